use serde_json::Value;

use super::Workset;
use crate::{
    filter::{ArrayFilter, Presence, join_path},
    instruction::Document,
};

const ID_FIELD: &str = "id";

/// What the compilers need to know about one object inside an instruction array.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractedObject {
    /// Fields that single out this element: `id` alone when present, otherwise
    /// every scalar leaf.
    pub identity_filter: Document,
    /// Document-level predicate: the element exists at its nested position.
    pub exists_predicate: Document,
    /// Document-level predicate: the element does not exist at its nested position.
    pub not_exists_predicate: Document,
    /// `<element path>.<field> -> value` for every non-`id` scalar leaf.
    pub scalar_set_map: Document,
    /// Array-valued leaves, in field order. These drive recursion.
    pub nested_array_fields: Vec<(String, Vec<Value>)>,
    /// Alias for this element, `None` when it has no identity to filter on.
    pub alias: Option<String>,
    /// The parent's alias filters, plus this element's own when it has an identity.
    pub child_array_filters: Vec<ArrayFilter>,
}

/// Split `object` into identity, scalar updates and nested arrays, relative to
/// the array described by `work`.
pub fn extract_object(object: &Document, work: &Workset<'_>) -> ExtractedObject {
    let mut leaves = Vec::new();
    flatten_into("", object, &mut leaves);

    let mut identity_filter = Document::new();
    let mut scalar_fields = Vec::new();
    let mut nested_array_fields = Vec::new();
    let mut seen_id = false;

    for (path, value) in leaves {
        match value {
            Value::Array(items) => nested_array_fields.push((path, items.clone())),
            _ if path == ID_FIELD => {
                identity_filter.clear();
                identity_filter.insert(path, value.clone());
                seen_id = true;
            }
            _ => {
                if !seen_id {
                    identity_filter.insert(path.clone(), value.clone());
                }
                scalar_fields.push((path, value.clone()));
            }
        }
    }

    let alias = (!identity_filter.is_empty()).then(|| work.alias());
    let element_path = work.element_path(alias.as_deref());
    let scalar_set_map = scalar_fields
        .into_iter()
        .map(|(path, value)| (join_path(&element_path, &path), value))
        .collect();

    let mut child_array_filters = work.array_filters().to_vec();
    if let Some(alias) = &alias {
        child_array_filters.push(ArrayFilter::new(alias.clone(), identity_filter.clone()));
    }

    ExtractedObject {
        exists_predicate: work
            .chain()
            .guard(work.field(), &identity_filter, Presence::Exists),
        not_exists_predicate: work
            .chain()
            .guard(work.field(), &identity_filter, Presence::Absent),
        identity_filter,
        scalar_set_map,
        nested_array_fields,
        alias,
        child_array_filters,
    }
}

/// Flatten nested plain objects into dotted leaves. Arrays and empty objects
/// are leaves.
fn flatten_into<'v>(prefix: &str, object: &'v Document, out: &mut Vec<(String, &'v Value)>) {
    for (key, value) in object {
        let path = join_path(prefix, key);
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(&path, inner, out),
            _ => out.push((path, value)),
        }
    }
}
