use anyhow::Result;
use chrono::{TimeZone, Utc};
use rillpatch::{Document, Documents, PatchConfig, PatchInstruction, testing::MemoryStore};
use serde_json::{Value, json};

fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("object")
}

fn fixed_config() -> PatchConfig {
    PatchConfig::default().clock(|| Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
}

#[tokio::test]
async fn set_add_remove_unset_in_one_batch() -> Result<()> {
    let store = MemoryStore::with_documents([json!({
        "id": "objid",
        "name": "old",
        "legacy": true,
        "tags": ["a"],
        "schools": [{"id": "s1", "name": "North", "roles": ["r1", "r2"]}]
    })]);
    let docs = Documents::with_config(store, fixed_config());

    let instruction = PatchInstruction::new()
        .set("name", json!("new"))
        .add("tags", json!(["b", "a"]))
        .add(
            "schools",
            json!([
                {"id": "s1", "name": "North2", "roles": ["r3"]},
                {"id": "s2", "name": "South", "roles": ["r9"]}
            ]),
        )
        .remove("tags", json!(["a"]))
        .remove("schools", json!([{"id": "s1", "roles": ["r1"]}]))
        .unset("legacy");

    let patched = docs
        .patch(&doc(json!({"id": "objid"})), &instruction, None)
        .await?;

    assert_eq!(
        patched,
        json!({
            "id": "objid",
            "name": "new",
            "tags": ["b"],
            "schools": [
                {"id": "s1", "name": "North2", "roles": ["r2", "r3"]},
                {"id": "s2", "name": "South", "roles": ["r9"]}
            ],
            "updatedAt": "2024-05-01T12:00:00.000Z"
        })
    );

    // one atomic batch: set first, unset last
    let batches = docs.store().batches();
    assert_eq!(batches.len(), 1);
    let operators: Vec<&str> = batches[0].iter().filter_map(|op| op.operator()).collect();
    assert_eq!(operators.first(), Some(&"$set"));
    assert_eq!(operators.last(), Some(&"$unset"));
    Ok(())
}

#[tokio::test]
async fn nested_add_only_touches_the_addressed_branch() -> Result<()> {
    let store = MemoryStore::with_documents([json!({
        "id": "objid",
        "groups": [
            {"id": "g1", "subgroups": [{"id": "sg1", "tags": ["t0"]}]},
            {"id": "g2", "subgroups": [{"id": "sg1", "tags": []}]}
        ]
    })]);
    let docs = Documents::with_config(store, fixed_config());

    let instruction = PatchInstruction::new().add(
        "groups",
        json!([{"id": "g1", "subgroups": [{"id": "sg1", "label": "L", "tags": ["t1"]}]}]),
    );
    let patched = docs
        .patch(&doc(json!({"id": "objid"})), &instruction, None)
        .await?;

    assert_eq!(
        patched["groups"],
        json!([
            {"id": "g1", "subgroups": [{"id": "sg1", "tags": ["t0", "t1"], "label": "L"}]},
            {"id": "g2", "subgroups": [{"id": "sg1", "tags": []}]}
        ])
    );
    Ok(())
}

#[tokio::test]
async fn new_nested_element_is_inserted_with_its_children() -> Result<()> {
    let store = MemoryStore::with_documents([json!({"id": "objid"})]);
    let docs = Documents::with_config(store, fixed_config());

    let instruction = PatchInstruction::new().add(
        "schools",
        json!([{"id": "s1", "name": "North", "classes": [{"id": "c1", "size": 20}]}]),
    );
    let patched = docs
        .patch(&doc(json!({"id": "objid"})), &instruction, None)
        .await?;

    assert_eq!(
        patched["schools"],
        json!([{"id": "s1", "name": "North", "classes": [{"id": "c1", "size": 20}]}])
    );
    Ok(())
}

#[tokio::test]
async fn projection_limits_returned_fields() -> Result<()> {
    let store = MemoryStore::with_documents([json!({"id": "objid", "name": "a", "secret": 1})]);
    let docs = Documents::with_config(store, fixed_config());

    let patched = docs
        .patch(
            &doc(json!({"id": "objid"})),
            &PatchInstruction::new().set("name", json!("b")),
            Some(&doc(json!({"name": 1}))),
        )
        .await?;
    assert_eq!(patched, json!({"name": "b"}));
    Ok(())
}

#[tokio::test]
async fn custom_timestamp_field() -> Result<()> {
    let store = MemoryStore::with_documents([json!({"id": "objid"})]);
    let docs = Documents::with_config(store, fixed_config().timestamp_field("modifiedAt"));

    let patched = docs
        .patch(&doc(json!({"id": "objid"})), &PatchInstruction::new(), None)
        .await?;
    assert_eq!(patched["modifiedAt"], json!("2024-05-01T12:00:00.000Z"));
    assert!(patched.get("updatedAt").is_none());
    Ok(())
}

#[tokio::test]
async fn anonymous_removal_pulls_from_every_element() -> Result<()> {
    let store = MemoryStore::with_documents([json!({
        "id": "objid",
        "groups": [
            {"members": ["m1", "m2"]},
            {"members": ["m1", "m3"]},
            {"members": ["m4"]}
        ]
    })]);
    let docs = Documents::with_config(store, fixed_config());

    let patched = docs
        .patch(
            &doc(json!({"id": "objid"})),
            &PatchInstruction::new().remove("groups", json!([{"members": ["m1", "m4"]}])),
            None,
        )
        .await?;

    assert_eq!(
        patched["groups"],
        json!([{"members": ["m2"]}, {"members": ["m3"]}, {"members": []}])
    );
    let batch = docs.store().batches().remove(0);
    assert_eq!(
        Value::Object(batch[1].update.clone()),
        json!({"$pull": {"groups.$[].members": {"$in": ["m1", "m4"]}}})
    );
    assert!(batch[1].array_filters.is_empty());
    Ok(())
}
