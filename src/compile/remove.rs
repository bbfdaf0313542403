use serde_json::Value;
use tracing::warn;

use super::{ArrayStep, Workset, array_steps, extract_object};
use crate::{
    filter::{self, UpdateOperation},
    instruction::Document,
};

/// Compile a `remove` tree into ordered operations against the document matched
/// by `base_filter`.
///
/// Scalars are pulled with `$in`. An object without nested arrays is pulled by
/// its identity; an object with nested arrays stays in place and only the
/// listed nested values are removed from it. Removing something that is not
/// there is left to the store as a no-op.
pub fn compile_remove(base_filter: &Document, tree: &Document) -> Vec<UpdateOperation> {
    let mut ops = Vec::new();
    for (field, values) in tree {
        let work = Workset::root(base_filter, field.clone());
        remove_field(&work, values, &mut ops);
    }
    ops
}

fn remove_field(work: &Workset<'_>, values: &Value, ops: &mut Vec<UpdateOperation>) {
    let Some(values) = values.as_array() else {
        warn!(path = work.logical_path(), "skipping non-array remove value");
        return;
    };

    for step in array_steps(values) {
        match step {
            ArrayStep::Scalars(scalars) => {
                let update = filter::pull_in(&work.field_path(), scalars);
                ops.push(
                    UpdateOperation::new(work.base_filter().clone(), update)
                        .with_array_filters(work.array_filters()),
                );
            }
            ArrayStep::Object(object) => remove_object(work, object, ops),
        }
    }
}

fn remove_object(work: &Workset<'_>, object: &Document, ops: &mut Vec<UpdateOperation>) {
    let extracted = extract_object(object, work);

    if extracted.nested_array_fields.is_empty() {
        if extracted.identity_filter.is_empty() {
            // an empty match document would pull every element
            warn!(path = work.logical_path(), "skipping remove of empty object");
            return;
        }
        let update = filter::pull_match(&work.field_path(), extracted.identity_filter);
        ops.push(
            UpdateOperation::new(work.base_filter().clone(), update)
                .with_array_filters(work.array_filters()),
        );
        return;
    }

    for (field, values) in &extracted.nested_array_fields {
        let child = work.child(&extracted, field);
        remove_field(&child, &Value::Array(values.clone()), ops);
    }
}
