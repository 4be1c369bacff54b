//! Metadata store abstraction.
//!
//! The [`MetadataStore`] trait is everything the consistency engine needs
//! from the durable relational store: single-record reads and writes for
//! collections, documents and chunks, the two "what is out of sync"
//! listings that drive reconciliation, and a small ledger of vector
//! containers whose drop failed after their collection was deleted.
//!
//! Every method is a single atomic operation from the engine's point of
//! view; no multi-record transaction is required of an implementation.
//! Errors are plain `anyhow` errors. The engine treats any error from this
//! trait as the store being unavailable.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`memory::InMemoryMetadataStore`] | tests, embedding in other processes |
//! | [`sqlite::SqliteMetadataStore`] | the `csync` binary |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Chunk, Collection, Document};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Cheap round-trip used by health checks.
    async fn ping(&self) -> Result<()>;

    // ---- collections ----

    /// Insert a new collection. Fails if the id or name is taken.
    async fn insert_collection(&self, collection: &Collection) -> Result<()>;

    /// Overwrite an existing collection record (matched by id).
    async fn upsert_collection(&self, collection: &Collection) -> Result<()>;

    async fn get_collection(&self, id: &str) -> Result<Option<Collection>>;

    async fn get_collection_by_name(&self, name: &str) -> Result<Option<Collection>>;

    /// All collections, oldest first.
    async fn list_collections(&self) -> Result<Vec<Collection>>;

    /// Collections with `vector_synced = false OR status = 'syncing'`,
    /// least recently updated first. `inactive` records are excluded: the
    /// sweep never repairs them, so they must not occupy the window.
    async fn list_unsynced_collections(&self, limit: usize) -> Result<Vec<Collection>>;

    /// Physically removes the collection record. Returns whether it existed.
    async fn delete_collection(&self, id: &str) -> Result<bool>;

    /// Soft-deletes all documents and chunks of a collection.
    ///
    /// Returns `(documents, chunks)` newly marked deleted.
    async fn soft_delete_collection_children(
        &self,
        collection_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(u64, u64)>;

    // ---- documents ----

    async fn upsert_document(&self, document: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Live (not soft-deleted) documents of a collection.
    async fn list_documents(&self, collection_id: &str) -> Result<Vec<Document>>;

    // ---- chunks ----

    async fn upsert_chunk(&self, chunk: &Chunk) -> Result<()>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>>;

    /// All chunks of a document (including soft-deleted), by index.
    async fn list_chunks_by_document(&self, document_id: &str) -> Result<Vec<Chunk>>;

    /// Chunks ready to push: `status = 'completed'`, `vector_synced = false`,
    /// an embedding present, and a parent collection whose container is
    /// synced. Grouped by collection and document.
    async fn list_unsynced_chunks(&self, limit: usize) -> Result<Vec<Chunk>>;

    /// Sets `vector_synced = true` on the given chunks that are completed.
    ///
    /// Returns how many rows changed; ids that are missing or not
    /// completed are ignored.
    async fn mark_chunks_synced(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64>;

    /// Clears `vector_synced` on every chunk of a collection, after its
    /// container was recreated empty. Returns how many rows changed.
    async fn reset_chunks_synced(&self, collection_id: &str, at: DateTime<Utc>) -> Result<u64>;

    // ---- orphaned vector containers ----

    async fn record_orphan_container(&self, name: &str, at: DateTime<Utc>) -> Result<()>;

    async fn list_orphan_containers(&self) -> Result<Vec<String>>;

    async fn clear_orphan_container(&self, name: &str) -> Result<()>;
}
