//! Error types for the persistent search backend.

use crate::filter::FilterParseError;
use crate::index::IndexError;
use crate::storage::StorageError;
use thiserror::Error;

/// Main error type for registry, builder and configuration operations.
///
/// Dispatch itself never fails with this type; it reports a
/// [`DispatchOutcome`](crate::dispatch::DispatchOutcome) instead.
#[derive(Debug, Error)]
pub enum PsearchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Candidate evaluation failed: {0}")]
    Index(#[from] IndexError),

    #[error("Invalid filter: {0}")]
    Filter(#[from] FilterParseError),

    #[error("Invalid cookie interval: {0}")]
    InvalidInterval(u32),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for PsearchError {
    fn from(e: serde_json::Error) -> Self {
        PsearchError::Config(e.to_string())
    }
}

/// Result type for persistent search operations.
pub type Result<T> = std::result::Result<T, PsearchError>;
