use serde_json::Value;
use tracing::warn;

use super::{ArrayStep, Workset, array_steps, extract_object};
use crate::{
    Error, Result,
    filter::{self, UpdateOperation},
    instruction::Document,
};

/// Compile an `add` tree into ordered operations against the document matched
/// by `base_filter`.
///
/// Per array field: one `$addToSet` for the scalar values, then for every
/// object a guarded `$push` (a no-op when the element is already present), a
/// positional `$set` of its scalar fields, and the operations for its own
/// nested arrays.
///
/// Fails only for an object that has nested arrays but nothing to identify it
/// by, since neither a guard nor a positional filter can be derived for it.
pub fn compile_add(base_filter: &Document, tree: &Document) -> Result<Vec<UpdateOperation>> {
    let mut ops = Vec::new();
    for (field, values) in tree {
        let work = Workset::root(base_filter, field.clone());
        add_field(&work, values, &mut ops)?;
    }
    Ok(ops)
}

fn add_field(work: &Workset<'_>, values: &Value, ops: &mut Vec<UpdateOperation>) -> Result<()> {
    let Some(values) = values.as_array() else {
        warn!(path = work.logical_path(), "skipping non-array add value");
        return Ok(());
    };

    for step in array_steps(values) {
        match step {
            ArrayStep::Scalars(scalars) => {
                let update = filter::add_to_set_each(&work.field_path(), scalars);
                ops.push(
                    UpdateOperation::new(work.base_filter().clone(), update)
                        .with_array_filters(work.array_filters()),
                );
            }
            ArrayStep::Object(object) => add_object(work, object, ops)?,
        }
    }
    Ok(())
}

fn add_object(work: &Workset<'_>, object: &Document, ops: &mut Vec<UpdateOperation>) -> Result<()> {
    let extracted = extract_object(object, work);

    if extracted.identity_filter.is_empty() {
        if extracted.nested_array_fields.is_empty() {
            return Ok(());
        }
        return Err(Error::UnsupportedShape {
            path: work.logical_path().to_string(),
        });
    }

    let guard = filter::and(
        work.base_filter().clone(),
        extracted.not_exists_predicate.clone(),
    );
    let insert = filter::push(&work.field_path(), Value::Object(object.clone()));
    ops.push(UpdateOperation::new(guard, insert).with_array_filters(work.array_filters()));

    if !extracted.scalar_set_map.is_empty() {
        let update = filter::set(extracted.scalar_set_map.clone());
        ops.push(
            UpdateOperation::new(work.base_filter().clone(), update)
                .with_array_filters(&extracted.child_array_filters),
        );
    }

    for (field, values) in &extracted.nested_array_fields {
        let child = work.child(&extracted, field);
        add_field(&child, &Value::Array(values.clone()), ops)?;
    }
    Ok(())
}
