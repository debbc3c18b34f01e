//! Index compiler collaborator: filter tree to candidate set.

use crate::filter::Filter;
use crate::idl::{CandidateSet, ScratchStack};
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("Undefined attribute type: {0}")]
    UndefinedAttribute(String),

    #[error("Index unavailable for {0}")]
    IndexUnavailable(String),

    #[error("Storage error during index lookup: {0}")]
    Storage(#[from] StorageError),
}

/// Compiles a filter tree into the candidate identifiers that may match it.
///
/// Implementations use `scratch` for intermediate sets, one frame per
/// AND/OR level being evaluated.
pub trait IndexCompiler: Send + Sync {
    fn filter_candidates(
        &self,
        filter: &Filter,
        scratch: &mut ScratchStack,
    ) -> Result<CandidateSet, IndexError>;
}
