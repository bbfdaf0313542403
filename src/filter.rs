//! Filter-path bookkeeping shared by the add and remove compilers, plus the
//! compiled [`UpdateOperation`] handed to the store.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::instruction::Document;

/// Join a dotted prefix and a field name. An empty prefix yields the field itself.
pub fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

/// Filtered positional placeholder for `alias`, e.g. `$[schools]`.
pub fn positional(alias: &str) -> String {
    format!("$[{alias}]")
}

/// Placeholder addressing every element of an array.
pub const ALL_POSITIONAL: &str = "$[]";

/// Alias-filter pair for one nesting level: the alias used in `$[alias]` and
/// the identity the aliased element must carry.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayFilter {
    alias: String,
    identity: Document,
}

impl ArrayFilter {
    pub fn new(alias: impl Into<String>, identity: Document) -> Self {
        Self {
            alias: alias.into(),
            identity,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// `{ "<alias>.<field>": value, ... }` as the store expects it in `arrayFilters`.
    pub fn to_document(&self) -> Document {
        self.identity
            .iter()
            .map(|(field, value)| (join_path(&self.alias, field), value.clone()))
            .collect()
    }
}

/// Whether a guard asserts that an element is present or absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Exists,
    Absent,
}

#[derive(Clone, Debug, PartialEq)]
struct ChainLevel {
    field: String,
    identity: Document,
}

/// Logical path from the document root down to the current array, with the
/// identity selected at every level. Rendered into nested `$elemMatch`
/// predicates. Extending a chain returns a new value; the receiver is left
/// untouched so sibling branches never observe each other's levels.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExistenceChain {
    levels: Vec<ChainLevel>,
}

impl ExistenceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn extended(&self, field: impl Into<String>, identity: Document) -> Self {
        let mut levels = self.levels.clone();
        levels.push(ChainLevel {
            field: field.into(),
            identity,
        });
        Self { levels }
    }

    /// Predicate asserting that the array `field` under this chain does (or does
    /// not) contain an element matching `identity`.
    pub fn guard(&self, field: &str, identity: &Document, presence: Presence) -> Document {
        let elem_match = json!({ "$elemMatch": identity });
        let leaf = match presence {
            Presence::Exists => elem_match,
            Presence::Absent => json!({ "$not": elem_match }),
        };
        let mut inner = Document::new();
        inner.insert(field.to_string(), leaf);

        for level in self.levels.iter().rev() {
            let mut matcher = level.identity.clone();
            matcher.extend(inner);
            let mut wrapped = Document::new();
            wrapped.insert(level.field.clone(), json!({ "$elemMatch": matcher }));
            inner = wrapped;
        }
        inner
    }
}

/// One atomic update: an update-many call with an optional `arrayFilters` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOperation {
    pub filter: Document,
    pub update: Document,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub array_filters: Vec<Document>,
}

impl UpdateOperation {
    pub fn new(filter: Document, update: Document) -> Self {
        Self {
            filter,
            update,
            array_filters: Vec::new(),
        }
    }

    pub fn with_array_filters(mut self, filters: &[ArrayFilter]) -> Self {
        self.array_filters = filters.iter().map(ArrayFilter::to_document).collect();
        self
    }

    /// The single update operator this operation carries, if there is exactly one.
    pub fn operator(&self) -> Option<&str> {
        match self.update.len() {
            1 => self.update.keys().next().map(String::as_str),
            _ => None,
        }
    }
}

fn single(key: &str, value: Value) -> Document {
    let mut doc = Document::new();
    doc.insert(key.to_string(), value);
    doc
}

/// Conjunction of two filters.
pub fn and(left: Document, right: Document) -> Document {
    single("$and", json!([left, right]))
}

pub fn set(fields: Document) -> Document {
    single("$set", Value::Object(fields))
}

/// `$unset` with each field mapped to the empty-string sentinel.
pub fn unset<I, S>(fields: I) -> Document
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let fields: Document = fields
        .into_iter()
        .map(|f| (f.into(), Value::String(String::new())))
        .collect();
    single("$unset", Value::Object(fields))
}

pub fn add_to_set_each(path: &str, values: Vec<Value>) -> Document {
    let each = json!({ "$each": values });
    single("$addToSet", Value::Object(single(path, each)))
}

pub fn push(path: &str, value: Value) -> Document {
    single("$push", Value::Object(single(path, value)))
}

pub fn pull_in(path: &str, values: Vec<Value>) -> Document {
    let any_of = json!({ "$in": values });
    single("$pull", Value::Object(single(path, any_of)))
}

pub fn pull_match(path: &str, identity: Document) -> Document {
    single("$pull", Value::Object(single(path, Value::Object(identity))))
}
