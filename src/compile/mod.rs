//! Compilation of `add` / `remove` instruction trees into ordered update
//! operations.
//!
//! Each array field met during the walk gets its own [`Workset`]: the base
//! filter, the logical and physical paths down to the array, the existence
//! chain used for guards, and the alias filters collected from the root. A
//! child level is built from its parent by value, so sibling branches never
//! share state.

mod add;
mod extract;
mod remove;

pub use add::compile_add;
pub use extract::{ExtractedObject, extract_object};
pub use remove::compile_remove;

use serde_json::Value;

use crate::{
    filter::{ALL_POSITIONAL, ArrayFilter, ExistenceChain, join_path, positional},
    instruction::Document,
};

/// Recursion state for one array field.
#[derive(Clone, Debug)]
pub struct Workset<'a> {
    base_filter: &'a Document,
    field: String,
    logical_path: String,
    array_path: String,
    depth: usize,
    chain: ExistenceChain,
    array_filters: Vec<ArrayFilter>,
}

impl<'a> Workset<'a> {
    /// Context for a field at the document root.
    pub fn root(base_filter: &'a Document, field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            base_filter,
            logical_path: field.clone(),
            field,
            array_path: String::new(),
            depth: 0,
            chain: ExistenceChain::new(),
            array_filters: Vec::new(),
        }
    }

    pub fn base_filter(&self) -> &Document {
        self.base_filter
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Dotted path from the root without positional placeholders.
    pub fn logical_path(&self) -> &str {
        &self.logical_path
    }

    /// Physical path of the array itself, ancestors already positional.
    pub fn field_path(&self) -> String {
        join_path(&self.array_path, &self.field)
    }

    pub fn chain(&self) -> &ExistenceChain {
        &self.chain
    }

    /// Alias filters inherited from the ancestors of this array.
    pub fn array_filters(&self) -> &[ArrayFilter] {
        &self.array_filters
    }

    /// Positional alias for elements of this array.
    ///
    /// Derived from the field name; identifiers the store would reject are
    /// reduced to their alphanumeric characters, and a name already taken by an
    /// ancestor gets the nesting depth appended, then a counter until it is free.
    pub fn alias(&self) -> String {
        let mut alias: String = self
            .field
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let first = alias.chars().next();
        match first {
            None => alias.push('a'),
            Some(first) if first.is_ascii_digit() => alias.insert(0, 'a'),
            Some(first) if first.is_ascii_uppercase() => {
                alias.replace_range(..1, &first.to_ascii_lowercase().to_string());
            }
            Some(_) => {}
        }
        let taken = |candidate: &str| self.array_filters.iter().any(|f| f.alias() == candidate);
        if !taken(&alias) {
            return alias;
        }
        alias.push_str(&self.depth.to_string());
        let stem = alias.clone();
        let mut attempt = 0;
        while taken(&alias) {
            attempt += 1;
            alias = format!("{stem}{attempt}");
        }
        alias
    }

    /// Physical path of one element: `<field_path>.$[alias]`, or `<field_path>.$[]`
    /// when the element carries no identity to filter on.
    pub fn element_path(&self, alias: Option<&str>) -> String {
        let placeholder = match alias {
            Some(alias) => positional(alias),
            None => ALL_POSITIONAL.to_string(),
        };
        join_path(&self.field_path(), &placeholder)
    }

    /// Context for the nested array `field` inside the element described by `parent`.
    pub fn child(&self, parent: &ExtractedObject, field: &str) -> Workset<'a> {
        Workset {
            base_filter: self.base_filter,
            field: field.to_string(),
            logical_path: join_path(&self.logical_path, field),
            array_path: self.element_path(parent.alias.as_deref()),
            depth: self.depth + 1,
            chain: self
                .chain
                .extended(self.field.clone(), parent.identity_filter.clone()),
            array_filters: parent.child_array_filters.clone(),
        }
    }
}

/// One processing step over an array's values: all scalars are handled as a
/// single batch, each object on its own.
#[derive(Debug, PartialEq)]
pub(crate) enum ArrayStep<'v> {
    Scalars(Vec<Value>),
    Object(&'v Document),
}

pub(crate) fn array_steps(values: &[Value]) -> Vec<ArrayStep<'_>> {
    let mut scalars = Vec::new();
    let mut objects = Vec::new();
    for value in values {
        match value {
            Value::Object(object) => objects.push(ArrayStep::Object(object)),
            other => scalars.push(other.clone()),
        }
    }

    let mut steps = Vec::with_capacity(objects.len() + 1);
    if !scalars.is_empty() {
        steps.push(ArrayStep::Scalars(scalars));
    }
    steps.extend(objects);
    steps
}
