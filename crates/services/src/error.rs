//! Shared error types for the services crate.

use thiserror::Error;

use progress_core::model::{CourseRunId, FinalGradeError, PayloadError, ProgramId};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors raised by a `RemoteClient`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemoteError {
    /// The platform rejected the learner's access token.
    #[error("remote platform rejected the credential")]
    InvalidCredential,
    #[error("remote platform unavailable: {0}")]
    Unavailable(String),
}

/// Errors emitted by `RemoteDataCache`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("remote platform rejected the credential")]
    InvalidUpstreamCredential,
    #[error("remote platform unavailable: {0}")]
    RemoteUnavailable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RemoteError> for CacheError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::InvalidCredential => CacheError::InvalidUpstreamCredential,
            RemoteError::Unavailable(reason) => CacheError::RemoteUnavailable(reason),
        }
    }
}

/// Errors emitted while building or reading a `ProgressFacade`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("program {program} is misconfigured: {reason}")]
    MisconfiguredProgram { program: ProgramId, reason: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `GradeFreezer`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FreezeError {
    #[error("grades of course run {0} cannot be frozen yet")]
    NotReadyToFreeze(CourseRunId),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Grade(#[from] FinalGradeError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `ExamAttemptLedger`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors that stop a batch job as a whole. Per-user failures never do.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BatchError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// What a caller outside the engine is allowed to see of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserFacing {
    /// The learner must log in to the platform again.
    ReauthenticationRequired,
    Failure,
}

impl UserFacing {
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            UserFacing::ReauthenticationRequired => {
                "Your session with the learning platform expired. Please sign in again."
            }
            UserFacing::Failure => "Something went wrong while loading your progress.",
        }
    }
}

impl From<&CacheError> for UserFacing {
    fn from(err: &CacheError) -> Self {
        match err {
            CacheError::InvalidUpstreamCredential => UserFacing::ReauthenticationRequired,
            _ => UserFacing::Failure,
        }
    }
}

impl From<&ProgressError> for UserFacing {
    fn from(err: &ProgressError) -> Self {
        match err {
            ProgressError::Cache(cache) => cache.into(),
            _ => UserFacing::Failure,
        }
    }
}

impl From<&FreezeError> for UserFacing {
    fn from(err: &FreezeError) -> Self {
        match err {
            FreezeError::Cache(cache) => cache.into(),
            _ => UserFacing::Failure,
        }
    }
}
