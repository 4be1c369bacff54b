//! Two-phase synchronization of collections with their vector containers.
//!
//! [`SyncCoordinator`] is the only component that writes sync-related
//! fields (`status`, `vector_container_name`, `vector_synced`,
//! `last_sync_at`, `sync_error`). Every mutation follows the same shape:
//!
//! ```text
//! lifecycle::apply (validate) ─▶ metadata write ─▶ vector RPC ─▶ metadata write (result)
//! ```
//!
//! There is no cross-store transaction. If the process dies between the
//! two metadata writes the record is left `syncing` (or unsynced), and
//! the reconciliation sweep picks it up.
//!
//! # Operations
//!
//! | Operation | Lock | Vector work |
//! |-----------|------|-------------|
//! | [`create_collection`](SyncCoordinator::create_collection) | new id | `ensure_container` |
//! | [`sync_collection`](SyncCoordinator::sync_collection) | id | `stat`, then drop + `ensure_container` when needed |
//! | [`delete_collection`](SyncCoordinator::delete_collection) | id | `drop_container` (failure goes to the orphan ledger) |
//! | [`set_collection_active`](SyncCoordinator::set_collection_active) | id | none |
//! | [`delete_document`](SyncCoordinator::delete_document) | none | `delete_vectors` for synced chunks |
//! | [`mark_chunks_synced`](SyncCoordinator::mark_chunks_synced) | none | none |
//!
//! Create, sync, delete and activate/deactivate are single-flight per
//! collection id (see [`SyncLocks`]). A second caller gets
//! [`SyncError::SyncInProgress`] instead of waiting.
//!
//! Every vector RPC runs under `tokio::time::timeout`. A call that does not
//! finish in time counts as a failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::chunk::{self as chunk_lifecycle, ChunkEffect, ChunkEvent};
use crate::lifecycle::collection::{self as collection_lifecycle, CollectionEvent};
use crate::lifecycle::document::{self as document_lifecycle, DocumentEffect, DocumentEvent};
use crate::lifecycle::Transition;
use crate::locks::SyncLocks;
use crate::models::{
    Chunk, ChunkStatus, Collection, CollectionStatus, Document, DocumentStatus, NewCollection,
    OperationResult,
};
use crate::store::MetadataStore;
use crate::vector::VectorIndexClient;

/// Knobs the coordinator needs from configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub dims: usize,
    pub rpc_timeout: Duration,
    pub container_prefix: String,
    pub max_processing_retries: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            dims: 1536,
            rpc_timeout: Duration::from_secs(10),
            container_prefix: "collection_".to_string(),
            max_processing_retries: 3,
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dims: config.vector.dims,
            rpc_timeout: config.vector.rpc_timeout(),
            container_prefix: config.vector.container_prefix.clone(),
            max_processing_retries: config.documents.max_processing_retries,
        }
    }
}

/// A vector RPC that did not finish before the deadline.
#[derive(Debug, thiserror::Error)]
#[error("{op} timed out after {millis}ms")]
pub struct RpcTimeout {
    pub op: &'static str,
    pub millis: u128,
}

pub struct SyncCoordinator {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorIndexClient>,
    locks: SyncLocks,
    options: CoordinatorOptions,
}

impl SyncCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorIndexClient>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            metadata,
            vectors,
            locks: SyncLocks::new(),
            options,
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn vectors(&self) -> &Arc<dyn VectorIndexClient> {
        &self.vectors
    }

    pub fn locks(&self) -> &SyncLocks {
        &self.locks
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    // ============ Collections ============

    /// Validates and stores a new collection, then creates its container.
    ///
    /// A container failure does not fail the call: the record is kept in
    /// `error` with the cause in `sync_error`, and the result is `pending`
    /// (created, not yet searchable).
    pub async fn create_collection(&self, mut request: NewCollection) -> SyncResult<OperationResult> {
        request.validate()?;
        if self
            .metadata
            .get_collection_by_name(&request.name)
            .await
            .map_err(SyncError::metadata)?
            .is_some()
        {
            return Err(SyncError::AlreadyExists(request.name));
        }

        let mut collection = Collection::new(request, Utc::now());
        let _guard = self.locks.try_acquire(&collection.id)?;

        if let Err(e) = self.metadata.insert_collection(&collection).await {
            // Lost a race on the name
            if let Ok(Some(_)) = self.metadata.get_collection_by_name(&collection.name).await {
                return Err(SyncError::AlreadyExists(collection.name));
            }
            return Err(SyncError::metadata(e));
        }
        info!(collection_id = %collection.id, name = %collection.name, "collection record created");

        let container = self.generate_container_name();
        let outcome = self
            .vector_call(
                "ensure_container",
                self.vectors.ensure_container(&container, self.options.dims),
            )
            .await;

        let timed_out = matches!(&outcome, Err(e) if is_timeout(e));
        let outcome = outcome.map_err(SyncError::vector);
        let event = match &outcome {
            Ok(()) => CollectionEvent::SyncSucceeded {
                container: container.clone(),
            },
            Err(e) => CollectionEvent::SyncFailed {
                cause: e.to_string(),
            },
        };
        collection_lifecycle::apply(&mut collection, event, Utc::now())?;

        if let Err(e) = self.metadata.upsert_collection(&collection).await {
            // The record still says "no container"; whatever was created is unreferenced.
            if outcome.is_ok() {
                self.discard_container(&container).await;
            }
            return Err(SyncError::metadata(e));
        }

        match outcome {
            Ok(()) => {
                info!(
                    collection_id = %collection.id,
                    container = %container,
                    "vector container created"
                );
                Ok(OperationResult::completed(
                    "Collection created successfully",
                    json!({ "collection_id": collection.id, "collection": collection }),
                ))
            }
            Err(e) => {
                warn!(
                    collection_id = %collection.id,
                    error = %e,
                    "vector container creation failed; collection left in error"
                );
                if timed_out {
                    self.remember_orphan(&container).await;
                }
                Ok(OperationResult::pending(
                    "Collection created but vector container creation failed; it will be retried",
                    e.kind(),
                    json!({ "collection_id": collection.id, "collection": collection }),
                ))
            }
        }
    }

    /// Brings a collection's container in line with its record.
    ///
    /// The container is (re)created when `force` is set, when the record
    /// names no container, or when the named container is missing. A
    /// vector failure is reported as a `failed` result with the record in
    /// `error`; only metadata failures and rejected transitions are `Err`.
    pub async fn sync_collection(&self, id: &str, force: bool) -> SyncResult<OperationResult> {
        let _guard = self.locks.try_acquire(id)?;
        let mut collection = self.load_collection(id).await?;

        collection_lifecycle::apply(&mut collection, CollectionEvent::SyncStarted, Utc::now())?;
        self.metadata
            .upsert_collection(&collection)
            .await
            .map_err(SyncError::metadata)?;
        debug!(collection_id = %id, force, "sync started");

        match self.provision_container(&collection, force).await {
            Ok((container, recreated)) => {
                if recreated {
                    // The container is empty now; every chunk must be pushed again.
                    let reset = self
                        .metadata
                        .reset_chunks_synced(id, Utc::now())
                        .await
                        .map_err(SyncError::metadata)?;
                    if reset > 0 {
                        info!(collection_id = %id, chunks = reset, "container recreated; chunk sync flags cleared");
                    }
                }
                collection_lifecycle::apply(
                    &mut collection,
                    CollectionEvent::SyncSucceeded {
                        container: container.clone(),
                    },
                    Utc::now(),
                )?;
                self.metadata
                    .upsert_collection(&collection)
                    .await
                    .map_err(SyncError::metadata)?;
                info!(collection_id = %id, container = %container, "collection synchronized");
                Ok(OperationResult::completed(
                    "Collection synchronized successfully",
                    json!({
                        "collection_id": id,
                        "container": container,
                        "recreated": recreated,
                        "last_sync_at": collection.last_sync_at,
                    }),
                ))
            }
            Err(e) => {
                let err = SyncError::vector(e);
                let cause = err.to_string();
                collection_lifecycle::apply(
                    &mut collection,
                    CollectionEvent::SyncFailed {
                        cause: cause.clone(),
                    },
                    Utc::now(),
                )?;
                self.metadata
                    .upsert_collection(&collection)
                    .await
                    .map_err(SyncError::metadata)?;
                warn!(collection_id = %id, error = %cause, "collection sync failed");
                Ok(OperationResult::failed(
                    format!("Collection sync failed: {}", cause),
                    err.kind(),
                    json!({ "collection_id": id, "sync_error": cause }),
                ))
            }
        }
    }

    /// Drops the container (best effort), then removes the record and
    /// soft-deletes its documents and chunks.
    ///
    /// A container that cannot be dropped is written to the orphan ledger
    /// for the reconciliation sweep; the record is deleted regardless.
    pub async fn delete_collection(&self, id: &str) -> SyncResult<OperationResult> {
        let _guard = self.locks.try_acquire(id)?;
        let collection = self.load_collection(id).await?;

        let mut container_dropped = false;
        if let Some(container) = &collection.vector_container_name {
            match self
                .vector_call("drop_container", self.vectors.drop_container(container))
                .await
            {
                Ok(()) => container_dropped = true,
                Err(e) => {
                    warn!(
                        collection_id = %id,
                        container = %container,
                        error = %format!("{:#}", e),
                        "failed to drop vector container; recording orphan"
                    );
                    self.remember_orphan(container).await;
                }
            }
        }

        let (documents, chunks) = self
            .metadata
            .soft_delete_collection_children(id, Utc::now())
            .await
            .map_err(SyncError::metadata)?;
        self.metadata
            .delete_collection(id)
            .await
            .map_err(SyncError::metadata)?;

        info!(
            collection_id = %id,
            documents,
            chunks,
            container_dropped,
            "collection deleted"
        );
        Ok(OperationResult::completed(
            "Collection deleted successfully",
            json!({
                "collection_id": id,
                "container": collection.vector_container_name,
                "container_dropped": container_dropped,
                "documents_deleted": documents,
                "chunks_deleted": chunks,
            }),
        ))
    }

    /// Moves a `syncing` record last written before `older_than` to
    /// `error`, so the next pass can retry it.
    ///
    /// Returns `false` (and writes nothing) when the record is gone, no
    /// longer `syncing`, or was touched after the cutoff. A sync that is
    /// actually in flight holds the lock, so this returns `SyncInProgress`.
    pub async fn fail_stale_sync(&self, id: &str, older_than: DateTime<Utc>) -> SyncResult<bool> {
        let _guard = self.locks.try_acquire(id)?;
        let mut collection = match self.load_collection(id).await {
            Ok(c) => c,
            Err(SyncError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if collection.status != CollectionStatus::Syncing || collection.updated_at >= older_than {
            return Ok(false);
        }

        collection_lifecycle::apply(
            &mut collection,
            CollectionEvent::SyncFailed {
                cause: "sync timed out".to_string(),
            },
            Utc::now(),
        )?;
        self.metadata
            .upsert_collection(&collection)
            .await
            .map_err(SyncError::metadata)?;
        warn!(collection_id = %id, "stale sync reclaimed; collection moved to error");
        Ok(true)
    }

    /// `Activate` (from `inactive`) or `Deactivate` (from `error`).
    pub async fn set_collection_active(&self, id: &str, active: bool) -> SyncResult<Collection> {
        let _guard = self.locks.try_acquire(id)?;
        let mut collection = self.load_collection(id).await?;
        let event = if active {
            CollectionEvent::Activate
        } else {
            CollectionEvent::Deactivate
        };
        collection_lifecycle::apply(&mut collection, event, Utc::now())?;
        self.metadata
            .upsert_collection(&collection)
            .await
            .map_err(SyncError::metadata)?;
        info!(collection_id = %id, status = %collection.status, "collection status changed");
        Ok(collection)
    }

    /// Re-aggregates `document_count`, `chunk_count` and `total_size_bytes`
    /// from the collection's live documents.
    ///
    /// Takes the collection lock, so it fails with `SyncInProgress` while a
    /// sync of the same collection is running.
    pub async fn refresh_collection_stats(&self, id: &str) -> SyncResult<Collection> {
        let _guard = self.locks.try_acquire(id)?;
        let mut collection = self.load_collection(id).await?;
        let documents = self
            .metadata
            .list_documents(id)
            .await
            .map_err(SyncError::metadata)?;

        collection.document_count = documents.len() as i64;
        collection.chunk_count = documents.iter().map(|d| d.chunk_count).sum();
        collection.total_size_bytes = documents.iter().map(|d| d.file_size).sum();
        collection.updated_at = Utc::now();
        self.metadata
            .upsert_collection(&collection)
            .await
            .map_err(SyncError::metadata)?;
        debug!(
            collection_id = %id,
            document_count = collection.document_count,
            chunk_count = collection.chunk_count,
            "collection stats refreshed"
        );
        Ok(collection)
    }

    // ============ Documents and chunks ============

    /// Validates and applies a status event from the ingestion pipeline,
    /// then carries out the transition's effects.
    pub async fn apply_document_event(
        &self,
        id: &str,
        event: DocumentEvent,
    ) -> SyncResult<Transition<DocumentStatus, DocumentEffect>> {
        let mut document = self.load_document(id).await?;
        let transition = document_lifecycle::apply(
            &mut document,
            event,
            self.options.max_processing_retries,
            Utc::now(),
        )?;
        self.metadata
            .upsert_document(&document)
            .await
            .map_err(SyncError::metadata)?;

        let cascade = self.run_document_effects(&document, &transition.effects).await?;
        if cascade.stats_deferred {
            debug!(document_id = %id, "collection busy; stats refresh deferred");
        }
        Ok(transition)
    }

    /// Soft-deletes a document and its chunks and removes their vectors
    /// from the collection's container.
    ///
    /// Deleting an already-deleted document is a no-op. A vector delete
    /// failure is reported in the result details; the metadata delete
    /// still happens.
    pub async fn delete_document(&self, id: &str) -> SyncResult<OperationResult> {
        let mut document = self.load_document(id).await?;
        let transition = document_lifecycle::apply(
            &mut document,
            DocumentEvent::Delete,
            self.options.max_processing_retries,
            Utc::now(),
        )?;
        if transition.effects.is_empty() {
            return Ok(OperationResult::completed(
                "Document already deleted",
                json!({ "document_id": id }),
            ));
        }
        self.metadata
            .upsert_document(&document)
            .await
            .map_err(SyncError::metadata)?;

        let cascade = self.run_document_effects(&document, &transition.effects).await?;
        info!(
            document_id = %id,
            collection_id = %document.collection_id,
            chunks = cascade.chunks_deleted,
            vectors = cascade.vectors_deleted,
            "document deleted"
        );
        Ok(OperationResult::completed(
            "Document deleted successfully",
            json!({
                "document_id": id,
                "collection_id": document.collection_id,
                "chunks_deleted": cascade.chunks_deleted,
                "vectors_deleted": cascade.vectors_deleted,
                "vector_error": cascade.vector_error,
                "stats_refreshed": !cascade.stats_deferred,
            }),
        ))
    }

    /// Validates and applies a chunk status event. A deleted chunk whose
    /// vector was in the index has it removed (best effort).
    pub async fn apply_chunk_event(
        &self,
        id: &str,
        event: ChunkEvent,
    ) -> SyncResult<Transition<ChunkStatus, ChunkEffect>> {
        let mut chunk = self.load_chunk(id).await?;
        let transition = chunk_lifecycle::apply(&mut chunk, event, Utc::now())?;
        self.metadata
            .upsert_chunk(&chunk)
            .await
            .map_err(SyncError::metadata)?;

        if transition.effects.contains(&ChunkEffect::DeleteVector) {
            if let Err(e) = self
                .delete_vectors_for(&chunk.collection_id, std::slice::from_ref(&chunk.id))
                .await
            {
                warn!(chunk_id = %id, error = %format!("{:#}", e), "failed to delete chunk vector");
            }
        }
        Ok(transition)
    }

    /// Flags a batch of completed chunks as present in the vector index.
    ///
    /// Ids that are missing or not completed are skipped. Returns the
    /// number of chunks flagged.
    pub async fn mark_chunks_synced(&self, ids: &[String]) -> SyncResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.metadata
            .mark_chunks_synced(ids, Utc::now())
            .await
            .map_err(SyncError::metadata)
    }

    /// Single-chunk variant of [`mark_chunks_synced`](Self::mark_chunks_synced)
    /// that rejects a chunk which is not completed.
    pub async fn mark_chunk_synced(&self, id: &str) -> SyncResult<Chunk> {
        let mut chunk = self.load_chunk(id).await?;
        chunk_lifecycle::mark_vector_synced(&mut chunk, Utc::now())?;
        self.metadata
            .upsert_chunk(&chunk)
            .await
            .map_err(SyncError::metadata)?;
        Ok(chunk)
    }

    // ============ Helpers ============

    pub(crate) async fn load_collection(&self, id: &str) -> SyncResult<Collection> {
        self.metadata
            .get_collection(id)
            .await
            .map_err(SyncError::metadata)?
            .ok_or_else(|| SyncError::not_found("collection", id))
    }

    async fn load_document(&self, id: &str) -> SyncResult<Document> {
        self.metadata
            .get_document(id)
            .await
            .map_err(SyncError::metadata)?
            .ok_or_else(|| SyncError::not_found("document", id))
    }

    async fn load_chunk(&self, id: &str) -> SyncResult<Chunk> {
        self.metadata
            .get_chunk(id)
            .await
            .map_err(SyncError::metadata)?
            .ok_or_else(|| SyncError::not_found("chunk", id))
    }

    /// Container names are `<prefix><16 hex chars>`.
    fn generate_container_name(&self) -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", self.options.container_prefix, &hex[..16])
    }

    /// Runs a vector RPC under the configured deadline.
    pub(crate) async fn vector_call<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.options.rpc_timeout, call).await {
            Ok(result) => result.with_context(|| format!("{} failed", op)),
            Err(_) => Err(anyhow::Error::new(RpcTimeout {
                op,
                millis: self.options.rpc_timeout.as_millis(),
            })),
        }
    }

    /// Returns the name of a container that exists once this succeeds, and
    /// whether it had to be (re)created.
    async fn provision_container(
        &self,
        collection: &Collection,
        force: bool,
    ) -> anyhow::Result<(String, bool)> {
        let (name, fresh) = match &collection.vector_container_name {
            Some(name) if !force => {
                let stats = self.vector_call("stat", self.vectors.stat(name)).await?;
                if stats.is_some() {
                    return Ok((name.clone(), false));
                }
                debug!(collection_id = %collection.id, container = %name, "container missing; recreating");
                (name.clone(), false)
            }
            Some(name) => {
                if let Err(e) = self
                    .vector_call("drop_container", self.vectors.drop_container(name))
                    .await
                {
                    warn!(
                        collection_id = %collection.id,
                        container = %name,
                        error = %format!("{:#}", e),
                        "forced resync could not drop existing container"
                    );
                }
                (name.clone(), false)
            }
            None => (self.generate_container_name(), true),
        };

        if let Err(e) = self
            .vector_call(
                "ensure_container",
                self.vectors.ensure_container(&name, self.options.dims),
            )
            .await
        {
            if fresh && is_timeout(&e) {
                self.remember_orphan(&name).await;
            }
            return Err(e);
        }
        Ok((name, true))
    }

    /// Drop a container nobody references; fall back to the orphan ledger.
    async fn discard_container(&self, name: &str) {
        if let Err(e) = self
            .vector_call("drop_container", self.vectors.drop_container(name))
            .await
        {
            warn!(container = %name, error = %format!("{:#}", e), "could not drop unreferenced container");
            self.remember_orphan(name).await;
        }
    }

    async fn remember_orphan(&self, name: &str) {
        if let Err(e) = self.metadata.record_orphan_container(name, Utc::now()).await {
            warn!(container = %name, error = %format!("{:#}", e), "could not record orphan container");
        }
    }

    async fn delete_vectors_for(&self, collection_id: &str, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let container = match self.metadata.get_collection(collection_id).await? {
            Some(Collection {
                vector_container_name: Some(name),
                ..
            }) => name,
            _ => return Ok(()),
        };
        self.vector_call("delete_vectors", self.vectors.delete_vectors(&container, ids))
            .await
    }

    async fn run_document_effects(
        &self,
        document: &Document,
        effects: &[DocumentEffect],
    ) -> SyncResult<DocumentCascade> {
        let mut cascade = DocumentCascade::default();
        let mut vector_ids = Vec::new();

        if effects.contains(&DocumentEffect::CascadeChunks) {
            let chunks = self
                .metadata
                .list_chunks_by_document(&document.id)
                .await
                .map_err(SyncError::metadata)?;
            let now = Utc::now();
            for mut chunk in chunks {
                if chunk.status == ChunkStatus::Deleted {
                    continue;
                }
                let transition = chunk_lifecycle::apply(&mut chunk, ChunkEvent::Delete, now)?;
                if transition.effects.contains(&ChunkEffect::DeleteVector) {
                    vector_ids.push(chunk.id.clone());
                }
                self.metadata
                    .upsert_chunk(&chunk)
                    .await
                    .map_err(SyncError::metadata)?;
                cascade.chunks_deleted += 1;
            }
        }

        if effects.contains(&DocumentEffect::DeleteVectors) && !vector_ids.is_empty() {
            match self
                .delete_vectors_for(&document.collection_id, &vector_ids)
                .await
            {
                Ok(()) => cascade.vectors_deleted = vector_ids.len() as u64,
                Err(e) => {
                    let cause = format!("{:#}", e);
                    warn!(document_id = %document.id, error = %cause, "failed to delete document vectors");
                    cascade.vector_error = Some(cause);
                }
            }
        }

        if effects.contains(&DocumentEffect::RefreshCollectionStats) {
            match self.refresh_collection_stats(&document.collection_id).await {
                Ok(_) => {}
                Err(SyncError::SyncInProgress(_)) | Err(SyncError::NotFound { .. }) => {
                    cascade.stats_deferred = true;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(cascade)
    }
}

#[derive(Debug, Default)]
struct DocumentCascade {
    chunks_deleted: u64,
    vectors_deleted: u64,
    vector_error: Option<String>,
    stats_deferred: bool,
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RpcTimeout>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{ChunkStatus, CollectionStatus, OperationStatus};
    use crate::store::memory::InMemoryMetadataStore;
    use crate::vector::memory::InMemoryVectorIndex;

    fn setup() -> (
        Arc<InMemoryMetadataStore>,
        Arc<InMemoryVectorIndex>,
        SyncCoordinator,
    ) {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let vectors = Arc::new(InMemoryVectorIndex::new());
        let options = CoordinatorOptions {
            dims: 3,
            rpc_timeout: Duration::from_millis(200),
            ..CoordinatorOptions::default()
        };
        let coordinator = SyncCoordinator::new(metadata.clone(), vectors.clone(), options);
        (metadata, vectors, coordinator)
    }

    fn collection_id(result: &OperationResult) -> String {
        result.details["collection_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_create_provisions_container() {
        let (metadata, vectors, coordinator) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        assert_eq!(result.status, OperationStatus::Completed);

        let stored = metadata
            .get_collection(&collection_id(&result))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CollectionStatus::Active);
        assert!(stored.vector_synced);
        let container = stored.vector_container_name.clone().unwrap();
        assert!(container.starts_with("collection_"));
        assert_eq!(container.len(), "collection_".len() + 16);
        assert!(vectors.has_container(&container));
        stored.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let (_, _, coordinator) = setup();
        coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let err = coordinator
            .create_collection(NewCollection::named("  docs "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_validation_error() {
        let (_, vectors, coordinator) = setup();
        let mut request = NewCollection::named("docs");
        request.chunk_overlap = 2000;
        let err = coordinator.create_collection(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(vectors.ensure_calls(), 0);
    }

    #[tokio::test]
    async fn test_create_timeout_counts_as_failure() {
        let (metadata, vectors, coordinator) = setup();
        vectors.set_delay(Some(Duration::from_millis(500)), true);
        let result = coordinator
            .create_collection(NewCollection::named("slow"))
            .await
            .unwrap();
        assert_eq!(result.status, OperationStatus::Pending);

        let stored = metadata
            .get_collection(&collection_id(&result))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CollectionStatus::Error);
        assert!(!stored.vector_synced);
        let cause = stored.sync_error.unwrap();
        assert!(cause.starts_with("vector index unavailable"), "{}", cause);
        assert!(cause.contains("timed out"));
        assert_eq!(result.error, Some(ErrorKind::BackingStoreUnavailable));
        assert_eq!(metadata.list_orphan_containers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_recreates_missing_container() {
        let (metadata, vectors, coordinator) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = collection_id(&result);
        let container = metadata
            .get_collection(&id)
            .await
            .unwrap()
            .unwrap()
            .vector_container_name
            .unwrap();
        vectors.drop_container(&container).await.unwrap();

        let result = coordinator.sync_collection(&id, false).await.unwrap();
        assert!(result.is_completed());
        assert!(vectors.has_container(&container));
    }

    #[tokio::test]
    async fn test_sync_healthy_container_is_noop() {
        let (_, vectors, coordinator) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = collection_id(&result);
        let before = vectors.ensure_calls();
        assert!(coordinator.sync_collection(&id, false).await.unwrap().is_completed());
        assert_eq!(vectors.ensure_calls(), before);
        assert_eq!(vectors.drop_calls(), 0);
    }

    #[tokio::test]
    async fn test_forced_sync_drops_and_recreates() {
        let (_, vectors, coordinator) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = collection_id(&result);
        assert!(coordinator.sync_collection(&id, true).await.unwrap().is_completed());
        assert_eq!(vectors.drop_calls(), 1);
        assert_eq!(vectors.ensure_calls(), 2);
    }

    #[tokio::test]
    async fn test_sync_failure_is_result_not_error() {
        let (metadata, vectors, coordinator) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = collection_id(&result);
        vectors.set_unavailable(true);

        let result = coordinator.sync_collection(&id, false).await.unwrap();
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.error, Some(ErrorKind::BackingStoreUnavailable));
        let stored = metadata.get_collection(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CollectionStatus::Error);
        assert!(stored.sync_error.is_some());
        stored.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_sync_unknown_collection() {
        let (_, _, coordinator) = setup();
        let err = coordinator.sync_collection("missing", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(coordinator.locks().is_empty());
    }

    #[tokio::test]
    async fn test_sync_inactive_is_conflict() {
        let (metadata, vectors, coordinator) = setup();
        vectors.set_fail_ensure(true);
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = collection_id(&result);
        coordinator.set_collection_active(&id, false).await.unwrap();

        let err = coordinator.sync_collection(&id, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        let stored = metadata.get_collection(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CollectionStatus::Inactive);
    }

    #[tokio::test]
    async fn test_metadata_outage_surfaces_as_unavailable() {
        let (metadata, _, coordinator) = setup();
        metadata.set_unavailable(true);
        let err = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackingStoreUnavailable);
    }

    #[tokio::test]
    async fn test_delete_document_cascades_and_removes_vectors() {
        let (metadata, vectors, coordinator) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = collection_id(&result);
        let container = metadata
            .get_collection(&id)
            .await
            .unwrap()
            .unwrap()
            .vector_container_name
            .unwrap();

        let now = Utc::now();
        let mut doc = Document::new(&id, "a.txt", 42, now);
        doc.status = DocumentStatus::Completed;
        doc.chunk_count = 1;
        metadata.upsert_document(&doc).await.unwrap();
        let mut chunk = Chunk::new(&doc, 0, "hello", now);
        chunk.status = ChunkStatus::Completed;
        chunk.embedding = Some(vec![0.1, 0.2, 0.3]);
        metadata.upsert_chunk(&chunk).await.unwrap();
        vectors
            .upsert_vectors(
                &container,
                &[crate::vector::VectorRecord {
                    id: chunk.id.clone(),
                    document_id: doc.id.clone(),
                    collection_id: id.clone(),
                    content: chunk.content.clone(),
                    embedding: vec![0.1, 0.2, 0.3],
                }],
            )
            .await
            .unwrap();
        coordinator.mark_chunk_synced(&chunk.id).await.unwrap();

        let result = coordinator.delete_document(&doc.id).await.unwrap();
        assert!(result.is_completed());
        assert_eq!(result.details["vectors_deleted"], 1);
        assert!(vectors.vector_ids(&container).is_empty());

        let stored_chunk = metadata.get_chunk(&chunk.id).await.unwrap().unwrap();
        assert_eq!(stored_chunk.status, ChunkStatus::Deleted);
        assert!(!stored_chunk.vector_synced);
        let stored = metadata.get_collection(&id).await.unwrap().unwrap();
        assert_eq!(stored.document_count, 0);

        let again = coordinator.delete_document(&doc.id).await.unwrap();
        assert_eq!(again.message, "Document already deleted");
    }

    #[tokio::test]
    async fn test_document_events_follow_lifecycle() {
        let (metadata, _, coordinator) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = collection_id(&result);
        let doc = Document::new(&id, "a.txt", 100, Utc::now());
        metadata.upsert_document(&doc).await.unwrap();

        coordinator
            .apply_document_event(&doc.id, DocumentEvent::StartProcessing)
            .await
            .unwrap();
        coordinator
            .apply_document_event(
                &doc.id,
                DocumentEvent::Complete {
                    chunk_count: 4,
                    character_count: 100,
                    word_count: 20,
                },
            )
            .await
            .unwrap();
        let err = coordinator
            .apply_document_event(&doc.id, DocumentEvent::StartProcessing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);

        let stored = metadata.get_collection(&id).await.unwrap().unwrap();
        assert_eq!(stored.document_count, 1);
        assert_eq!(stored.chunk_count, 4);
        assert_eq!(stored.total_size_bytes, 100);
    }

    #[tokio::test]
    async fn test_chunk_events_drive_vector_cleanup() {
        let (metadata, vectors, coordinator) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = collection_id(&result);
        let container = metadata
            .get_collection(&id)
            .await
            .unwrap()
            .unwrap()
            .vector_container_name
            .unwrap();
        let doc = Document::new(&id, "a.txt", 10, Utc::now());
        let chunk = Chunk::new(&doc, 0, "hello", Utc::now());
        metadata.upsert_chunk(&chunk).await.unwrap();

        coordinator
            .apply_chunk_event(
                &chunk.id,
                ChunkEvent::StartEmbedding {
                    model: "m".into(),
                },
            )
            .await
            .unwrap();
        let done = coordinator
            .apply_chunk_event(
                &chunk.id,
                ChunkEvent::Complete {
                    embedding: vec![1.0, 0.0, 0.0],
                },
            )
            .await
            .unwrap();
        assert_eq!(done.state, ChunkStatus::Completed);
        assert!(done.effects.contains(&ChunkEffect::PushVector));

        vectors
            .upsert_vectors(
                &container,
                &[crate::vector::VectorRecord {
                    id: chunk.id.clone(),
                    document_id: doc.id.clone(),
                    collection_id: id.clone(),
                    content: chunk.content.clone(),
                    embedding: vec![1.0, 0.0, 0.0],
                }],
            )
            .await
            .unwrap();
        coordinator.mark_chunk_synced(&chunk.id).await.unwrap();

        let deleted = coordinator
            .apply_chunk_event(&chunk.id, ChunkEvent::Delete)
            .await
            .unwrap();
        assert_eq!(deleted.state, ChunkStatus::Deleted);
        assert!(vectors.vector_ids(&container).is_empty());
        let stored = metadata.get_chunk(&chunk.id).await.unwrap().unwrap();
        assert!(!stored.vector_synced);
    }

    #[tokio::test]
    async fn test_mark_chunk_synced_rejects_pending() {
        let (metadata, _, coordinator) = setup();
        let doc = Document::new("c1", "a.txt", 1, Utc::now());
        let chunk = Chunk::new(&doc, 0, "text", Utc::now());
        metadata.upsert_chunk(&chunk).await.unwrap();

        let err = coordinator.mark_chunk_synced(&chunk.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(coordinator.mark_chunks_synced(&[]).await.unwrap(), 0);
        assert_eq!(
            coordinator
                .mark_chunks_synced(&[chunk.id.clone()])
                .await
                .unwrap(),
            0
        );
    }
}
