//! Error taxonomy for the consistency engine.
//!
//! Store traits and application glue speak `anyhow::Result`. Everything
//! that crosses the coordinator / scanner / health boundary is converted
//! into a [`SyncError`], whose [`ErrorKind`] tells the caller what to do:
//!
//! | Kind | Caller action | Response code hint |
//! |------|---------------|--------------------|
//! | `state_conflict` | fix the request, do not auto-retry | 409 |
//! | `backing_store_unavailable` | retry with backoff | 503 |
//! | `sync_in_progress` | back off, retry later | 409 |
//! | `partial_sync_failure` | inspect the failure count | 207 |
//! | `not_found` | check the id | 404 |
//! | `already_exists` | choose another name | 409 |
//! | `validation` | fix the request | 422 |

use serde::Serialize;
use std::fmt;

/// Which of the two stores an availability error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Metadata,
    Vector,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Metadata => f.write_str("metadata store"),
            StoreKind::Vector => f.write_str("vector index"),
        }
    }
}

/// Serializable discriminant of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StateConflict,
    BackingStoreUnavailable,
    SyncInProgress,
    PartialSyncFailure,
    NotFound,
    AlreadyExists,
    Validation,
}

impl ErrorKind {
    /// HTTP status an API layer should map this kind to.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::StateConflict | ErrorKind::SyncInProgress | ErrorKind::AlreadyExists => 409,
            ErrorKind::BackingStoreUnavailable => 503,
            ErrorKind::PartialSyncFailure => 207,
            ErrorKind::NotFound => 404,
            ErrorKind::Validation => 422,
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::BackingStoreUnavailable
                | ErrorKind::SyncInProgress
                | ErrorKind::PartialSyncFailure
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A lifecycle transition that the state table does not allow.
    #[error("{entity} {id}: cannot transition from '{from}' via {event}")]
    StateConflict {
        entity: &'static str,
        id: String,
        from: String,
        event: String,
    },

    /// The metadata store or vector index could not be reached (or timed out).
    #[error("{store} unavailable: {source:#}")]
    BackingStoreUnavailable {
        store: StoreKind,
        #[source]
        source: anyhow::Error,
    },

    /// Another create/sync/delete for the same collection is in flight.
    #[error("a sync operation is already in progress for collection {0}")]
    SyncInProgress(String),

    /// A batch where some items failed. The succeeded subset was applied.
    #[error("partial sync failure: {succeeded} succeeded, {failed} failed")]
    PartialSyncFailure { succeeded: u64, failed: u64 },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("collection with name '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    Validation(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::StateConflict { .. } => ErrorKind::StateConflict,
            SyncError::BackingStoreUnavailable { .. } => ErrorKind::BackingStoreUnavailable,
            SyncError::SyncInProgress(_) => ErrorKind::SyncInProgress,
            SyncError::PartialSyncFailure { .. } => ErrorKind::PartialSyncFailure,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SyncError::Validation(_) => ErrorKind::Validation,
        }
    }

    pub fn metadata(source: anyhow::Error) -> Self {
        SyncError::BackingStoreUnavailable {
            store: StoreKind::Metadata,
            source,
        }
    }

    pub fn vector(source: anyhow::Error) -> Self {
        SyncError::BackingStoreUnavailable {
            store: StoreKind::Vector,
            source,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
