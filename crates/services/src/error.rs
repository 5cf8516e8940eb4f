//! Shared error types for the services crate.

use thiserror::Error;

use coach_core::model::NodeError;
use storage::repository::StorageError;

/// Errors emitted by `ContentService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContentError {
    /// Absent, soft-deleted, or not visible to the caller. The three cases
    /// are deliberately indistinguishable so hidden content does not leak
    /// its existence.
    #[error("content not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `ProgressService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("target not found")]
    NotFound,

    #[error("exercise is already done")]
    AlreadyDone,

    #[error("previous exercise is not done yet")]
    OutOfSequence,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ContentError> for ProgressError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::NotFound => ProgressError::NotFound,
            ContentError::Storage(e) => ProgressError::Storage(e),
        }
    }
}

/// Errors emitted by `PublishService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublishError {
    #[error("program not found")]
    NotFound,

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
