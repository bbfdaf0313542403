use std::fmt;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which half of a patch failed to find the target document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotFoundScope {
    /// The update batch matched no document.
    Patch,
    /// The batch applied but the follow-up read came back empty.
    Get,
}

impl fmt::Display for NotFoundScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundScope::Patch => f.write_str("patch"),
            NotFoundScope::Get => f.write_str("get"),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {scope} ({target})")]
    NotFound { scope: NotFoundScope, target: String },
    #[error("store error after {elapsed_ms}ms: {message}")]
    Store {
        message: String,
        elapsed_ms: u64,
        #[source]
        source: BoxError,
    },
    #[error("unsupported shape at `{path}`: object has nested arrays but no identifying fields")]
    UnsupportedShape { path: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn not_found_scope(&self) -> Option<NotFoundScope> {
        match self {
            Error::NotFound { scope, .. } => Some(*scope),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
