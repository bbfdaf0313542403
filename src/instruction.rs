use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// A JSON object as understood by the document store (filters, updates, projections).
pub type Document = JsonMap<String, Value>;

/// Partial update for one document.
///
/// `add` and `remove` are instruction trees: objects mapping a field name to an
/// array of scalars or an array of objects. They are kept as raw values so that
/// malformed shapes can be skipped instead of rejected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchInstruction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Document>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<Value>,
}

impl PatchInstruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set
            .get_or_insert_with(Document::new)
            .insert(field.into(), value);
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    /// Queue `values` to be added to the array at `field`.
    pub fn add(mut self, field: impl Into<String>, values: Value) -> Self {
        insert_tree_entry(&mut self.add, field.into(), values);
        self
    }

    /// Queue `values` to be removed from the array at `field`.
    pub fn remove(mut self, field: impl Into<String>, values: Value) -> Self {
        insert_tree_entry(&mut self.remove, field.into(), values);
        self
    }

    /// The `add` tree, if it is object-shaped.
    pub fn add_tree(&self) -> Option<&Document> {
        self.add.as_ref().and_then(Value::as_object)
    }

    /// The `remove` tree, if it is object-shaped.
    pub fn remove_tree(&self) -> Option<&Document> {
        self.remove.as_ref().and_then(Value::as_object)
    }
}

fn insert_tree_entry(tree: &mut Option<Value>, field: String, values: Value) {
    match tree {
        Some(Value::Object(map)) => {
            map.insert(field, values);
        }
        _ => {
            let mut map = Document::new();
            map.insert(field, values);
            *tree = Some(Value::Object(map));
        }
    }
}
