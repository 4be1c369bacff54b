//! Background detection and repair of metadata / vector divergence.
//!
//! [`ReconciliationScanner::reconcile_once`] is one full sweep. It runs
//! four steps in order, each over a bounded listing from the metadata
//! store:
//!
//! | Step | Finds | Repair |
//! |------|-------|--------|
//! | stale sweep | `syncing` records older than `stale_after` | `→ error` ("sync timed out") |
//! | collection repair | `active` / `error` records with `vector_synced = false` | `sync_collection(id, false)` |
//! | chunk push | embedded, completed chunks with `vector_synced = false` in synced collections | `upsert_vectors` in batches, then flag the written subset |
//! | orphan sweep | containers in the orphan ledger | `drop_container`, then clear the entry |
//!
//! A chunk deleted while its batch was in flight cannot be flagged; its
//! freshly written vector is deleted again before the batch finishes.
//!
//! Collections reclaimed by the stale sweep are not retried in the same
//! pass. Collections with an in-flight operation are skipped, never
//! queued. No single failure aborts the sweep: item failures are counted
//! and listed in the [`ReconcileReport`], and a failed listing ends only
//! its own step.
//!
//! Running the sweep twice with no intervening change repairs nothing the
//! second time.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::SyncCoordinator;
use crate::error::SyncError;
use crate::models::{Chunk, ChunkStatus, Collection, CollectionStatus, OperationStatus};
use crate::vector::VectorRecord;

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub batch_size: usize,
    pub collection_scan_limit: usize,
    pub chunk_scan_limit: usize,
    pub stale_after: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            collection_scan_limit: 100,
            chunk_scan_limit: 1000,
            stale_after: Duration::from_secs(600),
        }
    }
}

impl ReconcileOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.reconcile.batch_size,
            collection_scan_limit: config.reconcile.collection_scan_limit,
            chunk_scan_limit: config.reconcile.chunk_scan_limit,
            stale_after: Duration::from_secs(config.reconcile.stale_after_secs),
        }
    }
}

/// One item the sweep could not repair.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconcileFailure {
    /// `collection`, `chunk`, `container`, or the listing that failed.
    pub entity: String,
    pub id: String,
    pub error: String,
}

/// Counts from one [`reconcile_once`](ReconciliationScanner::reconcile_once).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub collections_repaired: u64,
    pub collections_failed: u64,
    pub collections_skipped: u64,
    pub stale_reclaimed: u64,
    pub chunks_synced: u64,
    pub chunks_failed: u64,
    pub orphans_dropped: u64,
    /// A metadata listing failed, so part of the sweep did not run.
    pub metadata_unavailable: bool,
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    /// Whether the sweep changed anything.
    pub fn repaired_anything(&self) -> bool {
        self.collections_repaired > 0
            || self.stale_reclaimed > 0
            || self.chunks_synced > 0
            || self.orphans_dropped > 0
    }

    /// `PartialSyncFailure` when any chunk push failed this pass.
    pub fn partial_failure(&self) -> Option<SyncError> {
        (self.chunks_failed > 0).then_some(SyncError::PartialSyncFailure {
            succeeded: self.chunks_synced,
            failed: self.chunks_failed,
        })
    }

    fn fail(&mut self, entity: &str, id: &str, error: impl ToString) {
        self.failures.push(ReconcileFailure {
            entity: entity.to_string(),
            id: id.to_string(),
            error: error.to_string(),
        });
    }
}

pub struct ReconciliationScanner {
    coordinator: Arc<SyncCoordinator>,
    options: ReconcileOptions,
}

impl ReconciliationScanner {
    pub fn new(coordinator: Arc<SyncCoordinator>, options: ReconcileOptions) -> Self {
        Self {
            coordinator,
            options,
        }
    }

    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let reclaimed = self.repair_collections(&mut report).await;
        debug!(reclaimed = reclaimed.len(), "collection pass finished");
        self.push_chunks(&mut report).await;
        self.sweep_orphans(&mut report).await;

        if report.repaired_anything() || !report.failures.is_empty() {
            info!(
                repaired = report.collections_repaired,
                failed = report.collections_failed,
                stale = report.stale_reclaimed,
                chunks_synced = report.chunks_synced,
                chunks_failed = report.chunks_failed,
                orphans_dropped = report.orphans_dropped,
                "reconcile pass complete"
            );
        } else {
            debug!("reconcile pass complete; nothing to do");
        }
        report
    }

    /// Runs [`reconcile_once`](Self::reconcile_once) forever.
    ///
    /// Waits `interval` between passes. While the metadata store is
    /// unreachable the wait doubles each pass (up to 8x).
    pub async fn watch<F>(&self, interval: Duration, mut on_report: F)
    where
        F: FnMut(&ReconcileReport),
    {
        let mut consecutive_outages: u32 = 0;
        loop {
            let report = self.reconcile_once().await;
            on_report(&report);

            if report.metadata_unavailable {
                consecutive_outages = consecutive_outages.saturating_add(1);
            } else {
                consecutive_outages = 0;
            }
            // Exponential backoff: 1x, 2x, 4x, 8x
            let delay = interval * 2u32.pow(consecutive_outages.min(3));
            if consecutive_outages > 0 {
                warn!(
                    delay_secs = delay.as_secs(),
                    "metadata store unavailable; backing off"
                );
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Stale sweep followed by collection repair. Returns the reclaimed ids.
    async fn repair_collections(&self, report: &mut ReconcileReport) -> HashSet<String> {
        let mut reclaimed = HashSet::new();
        let metadata = self.coordinator.metadata();
        let listed = match metadata
            .list_unsynced_collections(self.options.collection_scan_limit)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "could not list unsynced collections");
                report.metadata_unavailable = true;
                report.fail("metadata", "list_unsynced_collections", format!("{:#}", e));
                return reclaimed;
            }
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.options.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        for collection in listed.iter().filter(|c| c.status == CollectionStatus::Syncing) {
            if collection.updated_at >= cutoff {
                continue;
            }
            match self.coordinator.fail_stale_sync(&collection.id, cutoff).await {
                Ok(true) => {
                    report.stale_reclaimed += 1;
                    reclaimed.insert(collection.id.clone());
                }
                Ok(false) | Err(SyncError::SyncInProgress(_)) => {}
                Err(e) => report.fail("collection", &collection.id, e),
            }
        }

        for collection in &listed {
            if reclaimed.contains(&collection.id) {
                continue;
            }
            if !self.is_repairable(collection) {
                report.collections_skipped += 1;
                continue;
            }
            match self.coordinator.sync_collection(&collection.id, false).await {
                Ok(result) if result.status == OperationStatus::Completed => {
                    report.collections_repaired += 1;
                }
                Ok(result) => {
                    report.collections_failed += 1;
                    report.fail("collection", &collection.id, result.message);
                }
                Err(SyncError::SyncInProgress(_)) | Err(SyncError::NotFound { .. }) => {
                    report.collections_skipped += 1;
                }
                Err(e) => {
                    report.collections_failed += 1;
                    report.fail("collection", &collection.id, e);
                }
            }
        }
        reclaimed
    }

    fn is_repairable(&self, collection: &Collection) -> bool {
        matches!(
            collection.status,
            CollectionStatus::Active | CollectionStatus::Error
        ) && !self.coordinator.locks().is_in_flight(&collection.id)
    }

    async fn push_chunks(&self, report: &mut ReconcileReport) {
        let metadata = self.coordinator.metadata();
        let chunks = match metadata
            .list_unsynced_chunks(self.options.chunk_scan_limit)
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "could not list unsynced chunks");
                report.metadata_unavailable = true;
                report.fail("metadata", "list_unsynced_chunks", format!("{:#}", e));
                return;
            }
        };

        let mut by_collection: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
        for chunk in chunks {
            by_collection
                .entry(chunk.collection_id.clone())
                .or_default()
                .push(chunk);
        }

        for (collection_id, chunks) in by_collection {
            let container = match metadata.get_collection(&collection_id).await {
                Ok(Some(c)) if c.vector_synced => match c.vector_container_name {
                    Some(name) => name,
                    None => continue,
                },
                Ok(_) => {
                    debug!(
                        collection_id = %collection_id,
                        chunks = chunks.len(),
                        "collection missing or unsynced; chunk push deferred"
                    );
                    continue;
                }
                Err(e) => {
                    report.metadata_unavailable = true;
                    report.fail("collection", &collection_id, format!("{:#}", e));
                    continue;
                }
            };
            if self.coordinator.locks().is_in_flight(&collection_id) {
                continue;
            }

            for batch in chunks.chunks(self.options.batch_size.max(1)) {
                self.push_batch(&collection_id, &container, batch, report)
                    .await;
            }
        }
    }

    async fn push_batch(
        &self,
        collection_id: &str,
        container: &str,
        batch: &[Chunk],
        report: &mut ReconcileReport,
    ) {
        let mut records = Vec::with_capacity(batch.len());
        for chunk in batch {
            match &chunk.embedding {
                Some(embedding) => records.push(VectorRecord {
                    id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    collection_id: chunk.collection_id.clone(),
                    content: chunk.content.clone(),
                    embedding: embedding.clone(),
                }),
                None => {
                    report.chunks_failed += 1;
                    report.fail("chunk", &chunk.id, "completed chunk has no embedding");
                }
            }
        }
        if records.is_empty() {
            return;
        }

        let vectors = self.coordinator.vectors();
        let upsert = self
            .coordinator
            .vector_call("upsert_vectors", vectors.upsert_vectors(container, &records))
            .await;
        let outcome = match upsert {
            Ok(outcome) => outcome,
            Err(e) => {
                let cause = format!("{:#}", e);
                warn!(
                    collection_id = %collection_id,
                    container = %container,
                    batch = records.len(),
                    error = %cause,
                    "vector batch upsert failed"
                );
                report.chunks_failed += records.len() as u64;
                report.fail("collection", collection_id, cause);
                return;
            }
        };

        if !outcome.is_complete() {
            warn!(
                collection_id = %collection_id,
                rejected = outcome.failed.len(),
                batch = records.len(),
                "vector batch partially rejected"
            );
        }
        let rejected: HashSet<&str> = outcome.failed.iter().map(|(id, _)| id.as_str()).collect();
        for (id, error) in &outcome.failed {
            report.chunks_failed += 1;
            report.fail("chunk", id, error);
        }
        let written: Vec<String> = records
            .iter()
            .filter(|r| !rejected.contains(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect();

        match self.coordinator.mark_chunks_synced(&written).await {
            Ok(n) => {
                report.chunks_synced += n;
                debug!(
                    collection_id = %collection_id,
                    synced = n,
                    rejected = outcome.failed.len(),
                    "chunk batch pushed"
                );
                if n < written.len() as u64 {
                    self.retract_unflagged(collection_id, container, &written, report)
                        .await;
                }
            }
            Err(e) => {
                // Vectors are in the index; the next pass re-upserts them idempotently.
                report.metadata_unavailable = true;
                report.chunks_failed += written.len() as u64;
                report.fail("collection", collection_id, e);
            }
        }
    }

    /// Deletes the vectors of written chunks that were deleted (or left
    /// `completed`) while the upsert was in flight.
    async fn retract_unflagged(
        &self,
        collection_id: &str,
        container: &str,
        written: &[String],
        report: &mut ReconcileReport,
    ) {
        let metadata = self.coordinator.metadata();
        let mut stale = Vec::new();
        for id in written {
            match metadata.get_chunk(id).await {
                Ok(Some(chunk)) if chunk.status == ChunkStatus::Completed => {}
                Ok(_) => stale.push(id.clone()),
                Err(e) => {
                    report.metadata_unavailable = true;
                    report.fail("chunk", id, format!("{:#}", e));
                    return;
                }
            }
        }
        if stale.is_empty() {
            return;
        }

        let vectors = self.coordinator.vectors();
        match self
            .coordinator
            .vector_call("delete_vectors", vectors.delete_vectors(container, &stale))
            .await
        {
            Ok(()) => {
                info!(
                    collection_id = %collection_id,
                    container = %container,
                    retracted = stale.len(),
                    "retracted vectors of chunks deleted mid-push"
                );
            }
            Err(e) => {
                let cause = format!("{:#}", e);
                warn!(
                    collection_id = %collection_id,
                    container = %container,
                    error = %cause,
                    "failed to retract vectors of deleted chunks"
                );
                for id in &stale {
                    report.fail("chunk", id, &cause);
                }
            }
        }
    }

    async fn sweep_orphans(&self, report: &mut ReconcileReport) {
        let metadata = self.coordinator.metadata();
        let orphans = match metadata.list_orphan_containers().await {
            Ok(names) => names,
            Err(e) => {
                report.metadata_unavailable = true;
                report.fail("metadata", "list_orphan_containers", format!("{:#}", e));
                return;
            }
        };
        if orphans.is_empty() {
            return;
        }

        let referenced: HashSet<String> = match metadata.list_collections().await {
            Ok(collections) => collections
                .into_iter()
                .filter_map(|c| c.vector_container_name)
                .collect(),
            Err(e) => {
                report.metadata_unavailable = true;
                report.fail("metadata", "list_collections", format!("{:#}", e));
                return;
            }
        };

        let vectors = self.coordinator.vectors();
        for name in orphans {
            if !referenced.contains(&name) {
                if let Err(e) = self
                    .coordinator
                    .vector_call("drop_container", vectors.drop_container(&name))
                    .await
                {
                    report.fail("container", &name, format!("{:#}", e));
                    continue;
                }
                report.orphans_dropped += 1;
                info!(container = %name, "orphan container dropped");
            }
            if let Err(e) = metadata.clear_orphan_container(&name).await {
                report.fail("container", &name, format!("{:#}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorOptions;
    use crate::models::NewCollection;
    use crate::store::memory::InMemoryMetadataStore;
    use crate::store::MetadataStore;
    use crate::vector::memory::InMemoryVectorIndex;
    use crate::vector::VectorIndexClient;

    fn setup() -> (
        Arc<InMemoryMetadataStore>,
        Arc<InMemoryVectorIndex>,
        Arc<SyncCoordinator>,
        ReconciliationScanner,
    ) {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let vectors = Arc::new(InMemoryVectorIndex::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            metadata.clone(),
            vectors.clone(),
            CoordinatorOptions {
                dims: 2,
                ..CoordinatorOptions::default()
            },
        ));
        let scanner = ReconciliationScanner::new(coordinator.clone(), ReconcileOptions::default());
        (metadata, vectors, coordinator, scanner)
    }

    #[tokio::test]
    async fn test_empty_sweep_does_nothing() {
        let (_, _, _, scanner) = setup();
        let report = scanner.reconcile_once().await;
        assert!(!report.repaired_anything());
        assert!(report.failures.is_empty());
        assert!(report.partial_failure().is_none());
    }

    #[tokio::test]
    async fn test_failed_create_is_repaired() {
        let (metadata, vectors, coordinator, scanner) = setup();
        vectors.set_fail_ensure(true);
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = result.details["collection_id"].as_str().unwrap().to_string();

        let report = scanner.reconcile_once().await;
        assert_eq!(report.collections_failed, 1);
        assert_eq!(report.failures.len(), 1);

        vectors.set_fail_ensure(false);
        let report = scanner.reconcile_once().await;
        assert_eq!(report.collections_repaired, 1);
        let stored = metadata.get_collection(&id).await.unwrap().unwrap();
        assert!(stored.vector_synced);
        assert_eq!(stored.status, CollectionStatus::Active);
    }

    #[tokio::test]
    async fn test_inactive_collections_are_left_alone() {
        let (metadata, vectors, coordinator, scanner) = setup();
        vectors.set_fail_ensure(true);
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let id = result.details["collection_id"].as_str().unwrap().to_string();
        coordinator.set_collection_active(&id, false).await.unwrap();
        vectors.set_fail_ensure(false);
        let ensures = vectors.ensure_calls();

        let report = scanner.reconcile_once().await;
        assert_eq!(report.collections_skipped, 0);
        assert_eq!(report.collections_repaired, 0);
        assert_eq!(vectors.ensure_calls(), ensures);
        let stored = metadata.get_collection(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, CollectionStatus::Inactive);
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported() {
        let (metadata, _, _, scanner) = setup();
        metadata.set_unavailable(true);
        let report = scanner.reconcile_once().await;
        assert!(report.metadata_unavailable);
        assert_eq!(report.failures.len(), 3);
        assert!(!report.repaired_anything());
    }

    #[tokio::test]
    async fn test_orphan_referenced_by_live_collection_is_not_dropped() {
        let (metadata, vectors, coordinator, scanner) = setup();
        let result = coordinator
            .create_collection(NewCollection::named("docs"))
            .await
            .unwrap();
        let container = result.details["collection"]["vector_container_name"]
            .as_str()
            .unwrap()
            .to_string();
        metadata
            .record_orphan_container(&container, Utc::now())
            .await
            .unwrap();

        let report = scanner.reconcile_once().await;
        assert_eq!(report.orphans_dropped, 0);
        assert!(vectors.stat(&container).await.unwrap().is_some());
        assert!(metadata.list_orphan_containers().await.unwrap().is_empty());
    }
}
