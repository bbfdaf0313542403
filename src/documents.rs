use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
    Error, Result,
    compile::{compile_add, compile_remove},
    error::{BoxError, NotFoundScope},
    filter::{self, UpdateOperation},
    instruction::{Document, PatchInstruction},
    metrics,
    store::DocumentStore,
};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct PatchConfig {
    /// Field set to the modification time on every patch.
    pub timestamp_field: String,
    /// Patches slower than this are logged on the `rillpatch::slow_patch` target.
    pub slow_patch_threshold: Duration,
    /// Source of modification times; `Utc::now` when unset.
    pub clock: Option<Clock>,
}

impl fmt::Debug for PatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchConfig")
            .field("timestamp_field", &self.timestamp_field)
            .field("slow_patch_threshold", &self.slow_patch_threshold)
            .field("clock", &self.clock.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            timestamp_field: "updatedAt".to_string(),
            slow_patch_threshold: Duration::from_millis(500),
            clock: None,
        }
    }
}

impl PatchConfig {
    pub fn timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    pub fn slow_patch_threshold(mut self, threshold: Duration) -> Self {
        self.slow_patch_threshold = threshold;
        self
    }

    pub fn clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    fn now(&self) -> DateTime<Utc> {
        match &self.clock {
            Some(clock) => clock(),
            None => Utc::now(),
        }
    }
}

/// Assemble the ordered operation list for one patch.
///
/// The order is fixed: the `$set` (always present, carrying the modification
/// time), then everything derived from `add`, then everything derived from
/// `remove`, then `$unset`. Inserts must precede the positional sets that
/// target the inserted elements, which the add compiler guarantees within its
/// own output.
pub fn compile_patch(
    base_filter: &Document,
    instruction: &PatchInstruction,
    timestamp_field: &str,
    modified_at: DateTime<Utc>,
) -> Result<Vec<UpdateOperation>> {
    let mut fields = instruction.set.clone().unwrap_or_default();
    fields.insert(
        timestamp_field.to_string(),
        Value::String(modified_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    let mut ops = vec![UpdateOperation::new(
        base_filter.clone(),
        filter::set(fields),
    )];

    if let Some(tree) = instruction.add_tree() {
        ops.extend(compile_add(base_filter, tree)?);
    }
    if let Some(tree) = instruction.remove_tree() {
        ops.extend(compile_remove(base_filter, tree));
    }
    if !instruction.unset.is_empty() {
        ops.push(UpdateOperation::new(
            base_filter.clone(),
            filter::unset(instruction.unset.iter().cloned()),
        ));
    }
    Ok(ops)
}

/// Applies patch instructions to documents held by a [`DocumentStore`].
pub struct Documents<S> {
    store: S,
    config: PatchConfig,
}

impl<S: DocumentStore> Documents<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, PatchConfig::default())
    }

    pub fn with_config(store: S, config: PatchConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// Compile `instruction` for the document matched by `base_filter` without
    /// touching the store.
    pub fn compile(
        &self,
        base_filter: &Document,
        instruction: &PatchInstruction,
    ) -> Result<Vec<UpdateOperation>> {
        compile_patch(
            base_filter,
            instruction,
            &self.config.timestamp_field,
            self.config.now(),
        )
    }

    /// Apply `instruction` as one atomic batch, then read the document back.
    ///
    /// Returns [`Error::NotFound`] scoped to [`NotFoundScope::Patch`] when the
    /// batch matched nothing, and scoped to [`NotFoundScope::Get`] when the
    /// batch applied but the document was gone by the time it was re-read.
    #[instrument(skip_all, fields(filter = ?base_filter))]
    pub async fn patch(
        &self,
        base_filter: &Document,
        instruction: &PatchInstruction,
        projection: Option<&Document>,
    ) -> Result<Value> {
        let start = Instant::now();
        let result = self
            .apply(base_filter, instruction, projection, start)
            .await;

        let elapsed = start.elapsed();
        metrics::record_duration(elapsed);
        if matches!(result, Err(Error::UnsupportedShape { .. })) {
            metrics::record_failure();
        }
        if elapsed > self.config.slow_patch_threshold {
            warn!(
                target: "rillpatch::slow_patch",
                elapsed_ms = elapsed.as_millis() as u64,
                failed = result.is_err(),
                "slow document patch"
            );
        }
        result
    }

    async fn apply(
        &self,
        base_filter: &Document,
        instruction: &PatchInstruction,
        projection: Option<&Document>,
        start: Instant,
    ) -> Result<Value> {
        let ops = self.compile(base_filter, instruction)?;
        debug!(operations = ops.len(), "compiled patch");

        let outcome = self
            .store
            .bulk_update(&ops)
            .await
            .map_err(|e| store_error(e, start))?;
        debug!(
            matched = outcome.matched,
            modified = outcome.modified,
            "applied patch batch"
        );
        if outcome.matched == 0 {
            return Err(not_found(NotFoundScope::Patch, base_filter));
        }

        let doc = self
            .store
            .find_one(base_filter, projection)
            .await
            .map_err(|e| store_error(e, start))?
            .ok_or_else(|| not_found(NotFoundScope::Get, base_filter))?;

        metrics::record_patch(ops.len());
        Ok(doc)
    }
}

fn not_found(scope: NotFoundScope, base_filter: &Document) -> Error {
    metrics::record_not_found(scope);
    Error::NotFound {
        scope,
        target: Value::Object(base_filter.clone()).to_string(),
    }
}

fn store_error(source: BoxError, start: Instant) -> Error {
    metrics::record_failure();
    Error::Store {
        message: source.to_string(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn set_always_comes_first_with_timestamp() {
        let base = doc(json!({"id": "objid"}));
        let ops =
            compile_patch(&base, &PatchInstruction::new(), "updatedAt", fixed_time()).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(
            Value::Object(ops[0].update.clone()),
            json!({"$set": {"updatedAt": "2024-05-01T12:00:00.000Z"}})
        );
    }

    #[test]
    fn operations_follow_set_add_remove_unset_order() {
        let base = doc(json!({"id": "objid"}));
        let instruction = PatchInstruction::new()
            .unset("legacy")
            .remove("tags", json!(["old"]))
            .add("tags", json!(["new"]))
            .set("name", json!("n"));
        let ops = compile_patch(&base, &instruction, "modified", fixed_time()).unwrap();
        let operators: Vec<&str> = ops.iter().filter_map(UpdateOperation::operator).collect();
        assert_eq!(operators, vec!["$set", "$addToSet", "$pull", "$unset"]);
        assert_eq!(ops[0].update["$set"]["name"], json!("n"));
        assert_eq!(ops[0].update["$set"]["modified"], json!("2024-05-01T12:00:00.000Z"));
        assert_eq!(
            Value::Object(ops[3].update.clone()),
            json!({"$unset": {"legacy": ""}})
        );
    }

    #[test]
    fn non_object_trees_are_ignored() {
        let base = doc(json!({"id": "objid"}));
        let instruction: PatchInstruction =
            serde_json::from_value(json!({"add": ["x"], "remove": 3})).unwrap();
        let ops = compile_patch(&base, &instruction, "updatedAt", fixed_time()).unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn config_debug_hides_the_clock() {
        let rendered = format!("{:?}", PatchConfig::default().clock(fixed_time));
        assert!(rendered.contains("timestamp_field: \"updatedAt\""));
        assert!(rendered.contains("clock: Some(\"custom\")"));
        let plain = format!("{:?}", PatchConfig::default());
        assert!(plain.contains("slow_patch_threshold: 500ms"));
        assert!(plain.contains("clock: None"));
    }

    #[test]
    fn config_clock_overrides_now() {
        let config = PatchConfig::default().clock(fixed_time);
        assert_eq!(config.now(), fixed_time());
        assert_eq!(config.timestamp_field, "updatedAt");
    }
}
