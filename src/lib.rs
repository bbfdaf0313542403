//! Rillpatch compiles `{ set, unset, add, remove }` patch instructions into
//! ordered, alias-scoped update operations for document stores.

pub mod compile;
pub mod documents;
mod error;
pub mod filter;
pub mod instruction;
pub mod metrics;
pub mod store;
pub mod testing;

pub use documents::{Documents, PatchConfig, compile_patch};
pub use error::{BoxError, Error, NotFoundScope, Result, WithContext};
pub use filter::UpdateOperation;
pub use instruction::{Document, PatchInstruction};
pub use store::{BulkWriteOutcome, DocumentStore};

pub mod prelude {
    pub use crate::{Document, DocumentStore, Documents, PatchInstruction, Result};
}
