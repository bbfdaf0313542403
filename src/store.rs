use async_trait::async_trait;
use serde_json::Value;

use crate::{error::BoxError, filter::UpdateOperation, instruction::Document};

pub type StoreResult<T> = std::result::Result<T, BoxError>;

/// Counts reported by the store for one ordered batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    /// Documents matched, summed over every operation in the batch.
    pub matched: u64,
    /// Documents actually changed, summed over every operation in the batch.
    pub modified: u64,
}

/// Driver for a document store that understands the update-operator algebra.
///
/// Implementations must apply a batch in order and atomically with respect to
/// other writers of the same document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply `operations` as one ordered batch of update-many calls.
    async fn bulk_update(&self, operations: &[UpdateOperation]) -> StoreResult<BulkWriteOutcome>;

    /// Fetch the first document matching `filter`, restricted to `projection`
    /// when one is given.
    async fn find_one(
        &self,
        filter: &Document,
        projection: Option<&Document>,
    ) -> StoreResult<Option<Value>>;
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<S> {
    async fn bulk_update(&self, operations: &[UpdateOperation]) -> StoreResult<BulkWriteOutcome> {
        (**self).bulk_update(operations).await
    }

    async fn find_one(
        &self,
        filter: &Document,
        projection: Option<&Document>,
    ) -> StoreResult<Option<Value>> {
        (**self).find_one(filter, projection).await
    }
}
