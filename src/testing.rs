//! In-process [`DocumentStore`] that evaluates the update-operator algebra the
//! compilers emit. Used by the test suite and the `apply` CLI command.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;

use crate::{
    filter::{ALL_POSITIONAL, UpdateOperation},
    instruction::Document,
    store::{BulkWriteOutcome, DocumentStore, StoreResult},
};

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("{0}")]
    Injected(String),
    #[error("no array filter found for identifier `{0}`")]
    MissingArrayFilter(String),
    #[error("unsupported operator `{0}`")]
    UnsupportedOperator(String),
    #[error("cannot apply {operator} to non-array field `{field}`")]
    NotAnArray { operator: String, field: String },
    #[error("projection cannot mix inclusion and exclusion")]
    MixedProjection,
}

type EvalResult<T> = std::result::Result<T, MemoryStoreError>;

#[derive(Default)]
struct MemoryState {
    docs: Vec<Value>,
    batches: Vec<Vec<UpdateOperation>>,
    fail_next: Option<String>,
    delete_after_write: bool,
}

/// Document collection held in memory. Batches are applied to a copy and
/// committed only when every operation succeeded.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents<I>(docs: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        let store = Self::new();
        for doc in docs {
            store.insert(doc);
        }
        store
    }

    pub fn insert(&self, doc: Value) {
        self.lock().docs.push(doc);
    }

    /// Snapshot of every stored document.
    pub fn documents(&self) -> Vec<Value> {
        self.lock().docs.clone()
    }

    /// Every batch received so far, in arrival order.
    pub fn batches(&self) -> Vec<Vec<UpdateOperation>> {
        self.lock().batches.clone()
    }

    /// Make the next store call fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    /// Drop every document right after the next successful batch, as a
    /// concurrent delete landing between write and read would.
    pub fn delete_after_next_write(&self) {
        self.lock().delete_after_write = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store poisoned")
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn bulk_update(&self, operations: &[UpdateOperation]) -> StoreResult<BulkWriteOutcome> {
        let mut state = self.lock();
        state.batches.push(operations.to_vec());
        if let Some(message) = state.fail_next.take() {
            return Err(MemoryStoreError::Injected(message).into());
        }

        let mut docs = state.docs.clone();
        let mut outcome = BulkWriteOutcome::default();
        for op in operations {
            let filters = parse_array_filters(&op.array_filters);
            for doc in docs.iter_mut() {
                if !matches(doc, &op.filter) {
                    continue;
                }
                outcome.matched += 1;
                if apply_update(doc, &op.update, &filters)? {
                    outcome.modified += 1;
                }
            }
        }

        state.docs = if std::mem::take(&mut state.delete_after_write) {
            Vec::new()
        } else {
            docs
        };
        Ok(outcome)
    }

    async fn find_one(
        &self,
        filter: &Document,
        projection: Option<&Document>,
    ) -> StoreResult<Option<Value>> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(MemoryStoreError::Injected(message).into());
        }
        let Some(doc) = state.docs.iter().find(|doc| matches(doc, filter)) else {
            return Ok(None);
        };
        match projection {
            Some(projection) if !projection.is_empty() => Ok(Some(project(doc, projection)?)),
            _ => Ok(Some(doc.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// queries

/// Whether `doc` satisfies the query document `filter`.
pub fn matches(doc: &Value, filter: &Document) -> bool {
    filter.iter().all(|(key, cond)| match key.as_str() {
        "$and" => cond
            .as_array()
            .is_some_and(|subs| subs.iter().all(|sub| sub_matches(doc, sub))),
        "$or" => cond
            .as_array()
            .is_some_and(|subs| subs.iter().any(|sub| sub_matches(doc, sub))),
        path => {
            let mut candidates = Vec::new();
            resolve(doc, &split(path), &mut candidates);
            condition_matches(&candidates, cond)
        }
    })
}

fn sub_matches(doc: &Value, sub: &Value) -> bool {
    sub.as_object().is_some_and(|sub| matches(doc, sub))
}

fn split(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Collect every value reachable at `parts`, descending into array elements
/// the way the store does for dotted paths.
fn resolve<'v>(value: &'v Value, parts: &[&str], out: &mut Vec<&'v Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                resolve(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    resolve(item, rest, out);
                }
            }
            for item in items.iter().filter(|item| item.is_object()) {
                resolve(item, parts, out);
            }
        }
        _ => {}
    }
}

fn is_operator_doc(cond: &Value) -> bool {
    cond.as_object()
        .is_some_and(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn condition_matches(candidates: &[&Value], cond: &Value) -> bool {
    if !is_operator_doc(cond) {
        return candidates.iter().any(|c| equals_or_contains(c, cond));
    }
    let Some(ops) = cond.as_object() else {
        return false;
    };
    ops.iter().all(|(op, arg)| match op.as_str() {
        "$eq" => candidates.iter().any(|c| equals_or_contains(c, arg)),
        "$ne" => !candidates.iter().any(|c| equals_or_contains(c, arg)),
        "$in" => arg.as_array().is_some_and(|options| {
            options
                .iter()
                .any(|option| candidates.iter().any(|c| equals_or_contains(c, option)))
        }),
        "$nin" => arg.as_array().is_none_or(|options| {
            !options
                .iter()
                .any(|option| candidates.iter().any(|c| equals_or_contains(c, option)))
        }),
        "$exists" => arg.as_bool().unwrap_or(true) != candidates.is_empty(),
        "$not" => !condition_matches(candidates, arg),
        "$elemMatch" => candidates.iter().any(|c| {
            c.as_array()
                .is_some_and(|items| items.iter().any(|item| element_matches(item, arg)))
        }),
        _ => false,
    })
}

fn equals_or_contains(candidate: &Value, expected: &Value) -> bool {
    candidate == expected
        || candidate
            .as_array()
            .is_some_and(|items| items.iter().any(|item| item == expected))
}

/// `$elemMatch` / `$pull` semantics for one array element: a query document for
/// object elements, an operator document or a literal for everything else.
fn element_matches(item: &Value, cond: &Value) -> bool {
    if is_operator_doc(cond) {
        return condition_matches(&[item], cond);
    }
    match (item, cond.as_object()) {
        (Value::Object(_), Some(query)) => matches(item, query),
        _ => item == cond,
    }
}

// ---------------------------------------------------------------------------
// updates

/// Array filters keyed by alias; the inner document is relative to the element.
type ArrayFilters = HashMap<String, Document>;

fn parse_array_filters(docs: &[Document]) -> ArrayFilters {
    let mut filters = ArrayFilters::new();
    for doc in docs {
        for (key, cond) in doc {
            let (alias, field) = key.split_once('.').unwrap_or((key.as_str(), ""));
            filters
                .entry(alias.to_string())
                .or_default()
                .insert(field.to_string(), cond.clone());
        }
    }
    filters
}

fn filter_accepts(item: &Value, filter: &Document) -> bool {
    filter.iter().all(|(field, cond)| {
        if field.is_empty() {
            condition_matches(&[item], cond)
        } else {
            let mut candidates = Vec::new();
            resolve(item, &split(field), &mut candidates);
            condition_matches(&candidates, cond)
        }
    })
}

fn apply_update(doc: &mut Value, update: &Document, filters: &ArrayFilters) -> EvalResult<bool> {
    let mut modified = false;
    for (operator, fields) in update {
        let Some(fields) = fields.as_object() else {
            continue;
        };
        let create = matches!(operator.as_str(), "$set" | "$push" | "$addToSet");
        for (path, arg) in fields {
            let parts = split(path);
            modified |= visit(
                doc,
                &parts,
                filters,
                create,
                &mut |map: &mut JsonMap<String, Value>, key: &str| {
                    apply_leaf(operator, map, key, arg)
                },
            )?;
        }
    }
    Ok(modified)
}

/// Walk `parts` from `node`, expanding positional placeholders, and run `leaf`
/// on every parent object of the final segment. Missing intermediate objects
/// are created only when `create` is set and no placeholder follows.
fn visit(
    node: &mut Value,
    parts: &[&str],
    filters: &ArrayFilters,
    create: bool,
    leaf: &mut dyn FnMut(&mut JsonMap<String, Value>, &str) -> EvalResult<bool>,
) -> EvalResult<bool> {
    let Some((head, rest)) = parts.split_first() else {
        return Ok(false);
    };

    if rest.is_empty() {
        return match node {
            Value::Object(map) => leaf(map, *head),
            _ => Ok(false),
        };
    }

    if *head == ALL_POSITIONAL {
        let Value::Array(items) = node else {
            return Ok(false);
        };
        let mut modified = false;
        for item in items.iter_mut() {
            modified |= visit(item, rest, filters, create, leaf)?;
        }
        return Ok(modified);
    }

    if let Some(alias) = head.strip_prefix("$[").and_then(|h| h.strip_suffix(']')) {
        let filter = filters
            .get(alias)
            .ok_or_else(|| MemoryStoreError::MissingArrayFilter(alias.to_string()))?;
        let Value::Array(items) = node else {
            return Ok(false);
        };
        let mut modified = false;
        for item in items.iter_mut() {
            if filter_accepts(item, filter) {
                modified |= visit(item, rest, filters, create, leaf)?;
            }
        }
        return Ok(modified);
    }

    match node {
        Value::Object(map) => {
            if !map.contains_key(*head) {
                let next_is_positional = rest.first().is_some_and(|p| p.starts_with("$["));
                if !create || next_is_positional {
                    return Ok(false);
                }
                map.insert(head.to_string(), Value::Object(JsonMap::new()));
            }
            match map.get_mut(*head) {
                Some(child) => visit(child, rest, filters, create, leaf),
                None => Ok(false),
            }
        }
        Value::Array(items) => match head.parse::<usize>() {
            Ok(index) => match items.get_mut(index) {
                Some(item) => visit(item, rest, filters, create, leaf),
                None => Ok(false),
            },
            Err(_) => Ok(false),
        },
        _ => Ok(false),
    }
}

fn apply_leaf(
    operator: &str,
    map: &mut JsonMap<String, Value>,
    key: &str,
    arg: &Value,
) -> EvalResult<bool> {
    match operator {
        "$set" => {
            let previous = map.insert(key.to_string(), arg.clone());
            Ok(previous.as_ref() != Some(arg))
        }
        "$unset" => Ok(map.remove(key).is_some()),
        "$push" => {
            let items = each_items(arg);
            let array = array_entry(operator, map, key)?;
            array.extend(items);
            Ok(true)
        }
        "$addToSet" => {
            let items = each_items(arg);
            let array = array_entry(operator, map, key)?;
            let mut modified = false;
            for item in items {
                if !array.contains(&item) {
                    array.push(item);
                    modified = true;
                }
            }
            Ok(modified)
        }
        "$pull" => match map.get_mut(key) {
            Some(Value::Array(array)) => {
                let before = array.len();
                array.retain(|item| !element_matches(item, arg));
                Ok(array.len() != before)
            }
            Some(_) => Err(MemoryStoreError::NotAnArray {
                operator: operator.to_string(),
                field: key.to_string(),
            }),
            None => Ok(false),
        },
        other => Err(MemoryStoreError::UnsupportedOperator(other.to_string())),
    }
}

fn each_items(arg: &Value) -> Vec<Value> {
    match arg.get("$each") {
        Some(Value::Array(items)) => items.clone(),
        _ => vec![arg.clone()],
    }
}

fn array_entry<'m>(
    operator: &str,
    map: &'m mut JsonMap<String, Value>,
    key: &str,
) -> EvalResult<&'m mut Vec<Value>> {
    match map
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(array) => Ok(array),
        _ => Err(MemoryStoreError::NotAnArray {
            operator: operator.to_string(),
            field: key.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// projections

fn project(doc: &Value, projection: &Document) -> EvalResult<Value> {
    let include = projection.values().any(is_truthy);
    let exclude = projection.values().any(|v| !is_truthy(v));
    if include && exclude {
        return Err(MemoryStoreError::MixedProjection);
    }

    if include {
        let mut out = Value::Object(JsonMap::new());
        for path in projection.keys() {
            let parts = split(path);
            if let Some(value) = lookup(doc, &parts) {
                place(&mut out, &parts, value.clone());
            }
        }
        Ok(out)
    } else {
        let mut out = doc.clone();
        for path in projection.keys() {
            remove_path(&mut out, &split(path));
        }
        Ok(out)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => true,
    }
}

fn lookup<'v>(value: &'v Value, parts: &[&str]) -> Option<&'v Value> {
    parts.iter().try_fold(value, |node, part| node.get(*part))
}

fn place(out: &mut Value, parts: &[&str], value: Value) {
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut node = out;
    for part in parents {
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

fn remove_path(out: &mut Value, parts: &[&str]) {
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut node = out;
    for part in parents {
        match node.get_mut(*part) {
            Some(child) => node = child,
            None => return,
        }
    }
    if let Value::Object(map) = node {
        map.remove(*last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn dotted_paths_descend_into_arrays() {
        let d = json!({"schools": [{"id": "s1", "roles": ["r1"]}, {"id": "s2"}]});
        assert!(matches(&d, &doc(json!({"schools.id": "s2"}))));
        assert!(matches(&d, &doc(json!({"schools.roles": "r1"}))));
        assert!(!matches(&d, &doc(json!({"schools.id": "s3"}))));
    }

    #[test]
    fn elem_match_and_negation() {
        let d = json!({"schools": [{"id": "s1", "roles": [{"id": "r1"}]}]});
        let nested = doc(json!({"schools": {"$elemMatch": {
            "id": "s1",
            "roles": {"$not": {"$elemMatch": {"id": "r2"}}}
        }}}));
        assert!(matches(&d, &nested));
        let absent = doc(json!({"schools": {"$not": {"$elemMatch": {"id": "s1"}}}}));
        assert!(matches(&json!({}), &absent));
        assert!(!matches(&d, &absent));
    }

    #[test]
    fn positional_set_touches_only_filtered_element() {
        let mut d = json!({"schools": [{"id": "s1", "name": "a"}, {"id": "s2", "name": "b"}]});
        let filters = parse_array_filters(&[doc(json!({"schools.id": "s2"}))]);
        let changed = apply_update(
            &mut d,
            &doc(json!({"$set": {"schools.$[schools].name": "z"}})),
            &filters,
        )
        .unwrap();
        assert!(changed);
        assert_eq!(d["schools"][0]["name"], json!("a"));
        assert_eq!(d["schools"][1]["name"], json!("z"));
    }

    #[test]
    fn missing_array_filter_is_an_error() {
        let mut d = json!({"schools": [{"id": "s1"}]});
        let err = apply_update(
            &mut d,
            &doc(json!({"$set": {"schools.$[schools].name": "z"}})),
            &ArrayFilters::new(),
        )
        .unwrap_err();
        assert!(matches!(err, MemoryStoreError::MissingArrayFilter(alias) if alias == "schools"));
    }

    #[test]
    fn pull_supports_in_and_match_documents() {
        let mut d = json!({"tags": ["a", "b", "c"], "items": [{"id": 1, "n": 1}, {"id": 2}]});
        let filters = ArrayFilters::new();
        let pull_tags = doc(json!({"$pull": {"tags": {"$in": ["a", "c"]}}}));
        apply_update(&mut d, &pull_tags, &filters).unwrap();
        apply_update(&mut d, &doc(json!({"$pull": {"items": {"id": 1}}})), &filters).unwrap();
        assert_eq!(d, json!({"tags": ["b"], "items": [{"id": 2}]}));
    }

    #[test]
    fn add_to_set_skips_existing_values() {
        let mut d = json!({"tags": ["a"]});
        let changed = apply_update(
            &mut d,
            &doc(json!({"$addToSet": {"tags": {"$each": ["a", "b"]}}})),
            &ArrayFilters::new(),
        )
        .unwrap();
        assert!(changed);
        assert_eq!(d["tags"], json!(["a", "b"]));
    }

    #[test]
    fn projection_includes_and_excludes() {
        let d = json!({"id": 1, "name": "n", "profile": {"age": 3, "city": "c"}});
        assert_eq!(
            project(&d, &doc(json!({"name": 1, "profile.age": 1}))).unwrap(),
            json!({"name": "n", "profile": {"age": 3}})
        );
        assert_eq!(
            project(&d, &doc(json!({"profile": 0}))).unwrap(),
            json!({"id": 1, "name": "n"})
        );
        assert!(project(&d, &doc(json!({"name": 1, "id": 0}))).is_err());
    }

    #[tokio::test]
    async fn failed_batch_leaves_documents_untouched() {
        let store = MemoryStore::with_documents([json!({"id": "x", "tags": "scalar"})]);
        let ops = vec![
            UpdateOperation::new(doc(json!({"id": "x"})), doc(json!({"$set": {"a": 1}}))),
            UpdateOperation::new(doc(json!({"id": "x"})), doc(json!({"$push": {"tags": 1}}))),
        ];
        assert!(store.bulk_update(&ops).await.is_err());
        assert_eq!(store.documents(), vec![json!({"id": "x", "tags": "scalar"})]);
        assert_eq!(store.batches().len(), 1);
    }
}
