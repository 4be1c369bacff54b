//! Lifecycle state machines for collections, documents, and chunks.
//!
//! Pure logic, no I/O. Each entity module exposes:
//!
//! - `can_transition(from, to)`: whether the status table has an edge.
//! - `apply(entity, event, ..)`: validates the event against the entity's
//!   current status, updates the entity in place, and returns a
//!   [`Transition`] naming the new status plus the side effects the caller
//!   still has to carry out against the stores.
//!
//! An event the table does not allow yields [`SyncError::StateConflict`];
//! the entity is left untouched.
//!
//! # Collection
//!
//! ```text
//!            SyncStarted             SyncFailed
//!   active ─────────────▶ syncing ─────────────▶ error
//!     ▲  ◀───────────────    │      ◀───────────  │
//!     │    SyncSucceeded     │       SyncStarted  │ Deactivate
//!     │                      │                    ▼
//!     └──────────── Activate ─────────────── inactive
//! ```
//!
//! The first container creation runs straight from `active` (no
//! `syncing` write), so `active` also accepts `SyncSucceeded` and
//! `SyncFailed`.
//!
//! # Document
//!
//! `uploading → processing → {completed, failed}`, `failed → processing`
//! while retries remain, and `* → deleted` at any time.
//!
//! # Chunk
//!
//! `pending → embedding → {completed, failed}`, `failed → pending`, and
//! `* → deleted`. `vector_synced` is an orthogonal flag that may only be
//! raised on a completed chunk ([`chunk::mark_vector_synced`]).

use chrono::{DateTime, Utc};

use crate::error::{SyncError, SyncResult};

/// Result of a successful [`apply`](collection::apply).
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S, E> {
    pub state: S,
    pub effects: Vec<E>,
}

fn conflict(entity: &'static str, id: &str, from: impl ToString, event: &str) -> SyncError {
    SyncError::StateConflict {
        entity,
        id: id.to_string(),
        from: from.to_string(),
        event: event.to_string(),
    }
}

pub mod collection {
    use super::*;
    use crate::models::{Collection, CollectionStatus};

    #[derive(Debug, Clone, PartialEq)]
    pub enum CollectionEvent {
        SyncStarted,
        SyncSucceeded { container: String },
        SyncFailed { cause: String },
        Deactivate,
        Activate,
    }

    impl CollectionEvent {
        pub fn name(&self) -> &'static str {
            match self {
                CollectionEvent::SyncStarted => "sync_started",
                CollectionEvent::SyncSucceeded { .. } => "sync_succeeded",
                CollectionEvent::SyncFailed { .. } => "sync_failed",
                CollectionEvent::Deactivate => "deactivate",
                CollectionEvent::Activate => "activate",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CollectionEffect {
        /// Create (or re-create) the vector container.
        ProvisionContainer,
        /// The record is unsynced and should be picked up by reconciliation.
        AwaitRetry,
    }

    fn target(from: CollectionStatus, event: &CollectionEvent) -> Option<CollectionStatus> {
        use CollectionStatus::*;
        match (from, event) {
            (Active | Error, CollectionEvent::SyncStarted) => Some(Syncing),
            (Active | Syncing, CollectionEvent::SyncSucceeded { .. }) => Some(Active),
            (Active | Syncing, CollectionEvent::SyncFailed { .. }) => Some(Error),
            (Error, CollectionEvent::Deactivate) => Some(Inactive),
            (Inactive, CollectionEvent::Activate) => Some(Active),
            _ => None,
        }
    }

    pub fn can_transition(from: CollectionStatus, to: CollectionStatus) -> bool {
        use CollectionStatus::*;
        matches!(
            (from, to),
            (Active, Syncing)
                | (Active, Active)
                | (Active, Error)
                | (Syncing, Active)
                | (Syncing, Error)
                | (Error, Syncing)
                | (Error, Inactive)
                | (Inactive, Active)
        )
    }

    pub fn apply(
        collection: &mut Collection,
        event: CollectionEvent,
        now: DateTime<Utc>,
    ) -> SyncResult<Transition<CollectionStatus, CollectionEffect>> {
        let next = target(collection.status, &event).ok_or_else(|| {
            conflict("collection", &collection.id, collection.status, event.name())
        })?;

        let effects = match event {
            CollectionEvent::SyncStarted => {
                collection.vector_synced = false;
                vec![CollectionEffect::ProvisionContainer]
            }
            CollectionEvent::SyncSucceeded { container } => {
                collection.vector_container_name = Some(container);
                collection.vector_synced = true;
                collection.last_sync_at = Some(now);
                collection.sync_error = None;
                Vec::new()
            }
            CollectionEvent::SyncFailed { cause } => {
                collection.vector_synced = false;
                collection.sync_error = Some(cause);
                collection.last_sync_at = Some(now);
                vec![CollectionEffect::AwaitRetry]
            }
            CollectionEvent::Deactivate => Vec::new(),
            CollectionEvent::Activate => {
                if collection.vector_synced {
                    Vec::new()
                } else {
                    vec![CollectionEffect::AwaitRetry]
                }
            }
        };

        collection.status = next;
        collection.updated_at = now;
        Ok(Transition {
            state: next,
            effects,
        })
    }
}

pub mod document {
    use super::*;
    use crate::models::{Document, DocumentStatus};

    #[derive(Debug, Clone, PartialEq)]
    pub enum DocumentEvent {
        StartProcessing,
        Complete {
            chunk_count: i64,
            character_count: i64,
            word_count: i64,
        },
        Fail { error: String },
        Retry,
        Delete,
    }

    impl DocumentEvent {
        pub fn name(&self) -> &'static str {
            match self {
                DocumentEvent::StartProcessing => "start_processing",
                DocumentEvent::Complete { .. } => "complete",
                DocumentEvent::Fail { .. } => "fail",
                DocumentEvent::Retry => "retry",
                DocumentEvent::Delete => "delete",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum DocumentEffect {
        /// Soft-delete every chunk of the document.
        CascadeChunks,
        /// Remove the document's vectors from the collection container.
        DeleteVectors,
        /// Collection statistics changed.
        RefreshCollectionStats,
    }

    pub fn can_transition(from: DocumentStatus, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (from, to),
            (Uploading, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
                | (_, Deleted)
        )
    }

    /// `max_retries` bounds how many times a failed document may re-enter
    /// processing.
    pub fn apply(
        doc: &mut Document,
        event: DocumentEvent,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> SyncResult<Transition<DocumentStatus, DocumentEffect>> {
        use DocumentStatus::*;

        if doc.is_deleted && event != DocumentEvent::Delete {
            return Err(conflict("document", &doc.id, Deleted, event.name()));
        }

        let effects = match (doc.status, event) {
            (_, DocumentEvent::Delete) => {
                if doc.is_deleted {
                    return Ok(Transition {
                        state: Deleted,
                        effects: Vec::new(),
                    });
                }
                doc.is_deleted = true;
                doc.deleted_at = Some(now);
                doc.status = Deleted;
                vec![
                    DocumentEffect::CascadeChunks,
                    DocumentEffect::DeleteVectors,
                    DocumentEffect::RefreshCollectionStats,
                ]
            }
            (Uploading, DocumentEvent::StartProcessing) => {
                doc.status = Processing;
                doc.processing_started_at = Some(now);
                doc.processing_error = None;
                Vec::new()
            }
            (
                Processing,
                DocumentEvent::Complete {
                    chunk_count,
                    character_count,
                    word_count,
                },
            ) => {
                doc.status = Completed;
                doc.processing_completed_at = Some(now);
                doc.chunk_count = chunk_count;
                doc.character_count = character_count;
                doc.word_count = word_count;
                doc.processing_error = None;
                vec![DocumentEffect::RefreshCollectionStats]
            }
            (Processing, DocumentEvent::Fail { error }) => {
                doc.status = Failed;
                doc.processing_error = Some(error);
                Vec::new()
            }
            (Failed, DocumentEvent::Retry) if doc.retry_count < max_retries => {
                doc.status = Processing;
                doc.retry_count += 1;
                doc.processing_started_at = Some(now);
                doc.processing_error = None;
                Vec::new()
            }
            (from, event) => return Err(conflict("document", &doc.id, from, event.name())),
        };

        doc.updated_at = now;
        Ok(Transition {
            state: doc.status,
            effects,
        })
    }
}

pub mod chunk {
    use super::*;
    use crate::models::{Chunk, ChunkStatus};

    #[derive(Debug, Clone, PartialEq)]
    pub enum ChunkEvent {
        StartEmbedding { model: String },
        Complete { embedding: Vec<f32> },
        Fail { error: String },
        Retry,
        Delete,
    }

    impl ChunkEvent {
        pub fn name(&self) -> &'static str {
            match self {
                ChunkEvent::StartEmbedding { .. } => "start_embedding",
                ChunkEvent::Complete { .. } => "complete",
                ChunkEvent::Fail { .. } => "fail",
                ChunkEvent::Retry => "retry",
                ChunkEvent::Delete => "delete",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ChunkEffect {
        /// The vector must be pushed to the collection container.
        PushVector,
        /// The vector is present in the container and must be removed.
        DeleteVector,
    }

    pub fn can_transition(from: ChunkStatus, to: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (from, to),
            (Pending, Embedding)
                | (Embedding, Completed)
                | (Embedding, Failed)
                | (Failed, Pending)
                | (_, Deleted)
        )
    }

    pub fn apply(
        chunk: &mut Chunk,
        event: ChunkEvent,
        now: DateTime<Utc>,
    ) -> SyncResult<Transition<ChunkStatus, ChunkEffect>> {
        use ChunkStatus::*;

        let effects = match (chunk.status, event) {
            (Deleted, ChunkEvent::Delete) => Vec::new(),
            (_, ChunkEvent::Delete) => {
                let was_synced = chunk.vector_synced;
                chunk.status = Deleted;
                chunk.vector_synced = false;
                chunk.vector_sync_at = None;
                if was_synced {
                    vec![ChunkEffect::DeleteVector]
                } else {
                    Vec::new()
                }
            }
            (Pending, ChunkEvent::StartEmbedding { model }) => {
                chunk.status = Embedding;
                chunk.embedding_model = Some(model);
                chunk.embedding_error = None;
                Vec::new()
            }
            (Embedding, ChunkEvent::Complete { embedding }) => {
                chunk.status = Completed;
                chunk.embedding = Some(embedding);
                chunk.embedding_error = None;
                chunk.vector_synced = false;
                vec![ChunkEffect::PushVector]
            }
            (Embedding, ChunkEvent::Fail { error }) => {
                chunk.status = Failed;
                chunk.embedding_error = Some(error);
                Vec::new()
            }
            (Failed, ChunkEvent::Retry) => {
                chunk.status = Pending;
                chunk.embedding_error = None;
                Vec::new()
            }
            (from, event) => return Err(conflict("chunk", &chunk.id, from, event.name())),
        };

        chunk.updated_at = now;
        Ok(Transition {
            state: chunk.status,
            effects,
        })
    }

    /// Raises `vector_synced`. Only a completed chunk can be synced.
    pub fn mark_vector_synced(chunk: &mut Chunk, now: DateTime<Utc>) -> SyncResult<()> {
        if chunk.status != ChunkStatus::Completed {
            return Err(conflict("chunk", &chunk.id, chunk.status, "mark_vector_synced"));
        }
        chunk.vector_synced = true;
        chunk.vector_sync_at = Some(now);
        chunk.updated_at = now;
        Ok(())
    }
}
