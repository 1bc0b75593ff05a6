//! Service cache module.
//!
//! Provides the SQLite-backed document store and the document tree
//! helpers (flatten / unflatten / merge) it stores data with.

mod document;
mod store;

pub use document::*;
pub use store::*;

use thiserror::Error;

/// Cache error types.
///
/// Store failures are never fatal to a whole polling batch: callers log
/// them and carry on with the remaining services.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("document encode error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("document tree deeper than {0} levels")]
    DepthExceeded(usize),
    #[error("merge called without any document")]
    MergeArguments,
    #[error("merge target has no branch named {0:?}")]
    MissingBranch(String),
    #[error("document for {host}/{service} is not a JSON object")]
    BadDocument { host: String, service: String },
    #[error("service document must be a JSON object")]
    NotAnObject,
}
