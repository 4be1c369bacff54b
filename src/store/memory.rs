//! In-memory [`MetadataStore`] implementation for tests and embedding.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. [`InMemoryMetadataStore::set_unavailable`]
//! makes every call fail, which is how tests simulate an unreachable
//! database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Chunk, ChunkStatus, Collection, CollectionStatus, Document, DocumentStatus};

use super::MetadataStore;

pub struct InMemoryMetadataStore {
    collections: RwLock<HashMap<String, Collection>>,
    documents: RwLock<HashMap<String, Document>>,
    chunks: RwLock<HashMap<String, Chunk>>,
    orphans: RwLock<BTreeMap<String, DateTime<Utc>>>,
    unavailable: AtomicBool,
    fail_orphan_ledger: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            orphans: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
            fail_orphan_ledger: AtomicBool::new(false),
        }
    }

    /// While set, every operation returns an error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// While set, recording an orphan container fails.
    pub fn set_fail_orphan_ledger(&self, fail: bool) {
        self.fail_orphan_ledger.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("metadata store is unreachable");
        }
        Ok(())
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn insert_collection(&self, collection: &Collection) -> Result<()> {
        self.check()?;
        let mut collections = self.collections.write().unwrap();
        if collections.contains_key(&collection.id) {
            bail!("collection id '{}' already exists", collection.id);
        }
        if collections.values().any(|c| c.name == collection.name) {
            bail!("collection name '{}' already exists", collection.name);
        }
        collections.insert(collection.id.clone(), collection.clone());
        Ok(())
    }

    async fn upsert_collection(&self, collection: &Collection) -> Result<()> {
        self.check()?;
        let mut collections = self.collections.write().unwrap();
        collections.insert(collection.id.clone(), collection.clone());
        Ok(())
    }

    async fn get_collection(&self, id: &str) -> Result<Option<Collection>> {
        self.check()?;
        Ok(self.collections.read().unwrap().get(id).cloned())
    }

    async fn get_collection_by_name(&self, name: &str) -> Result<Option<Collection>> {
        self.check()?;
        Ok(self
            .collections
            .read()
            .unwrap()
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.check()?;
        let mut all: Vec<Collection> = self.collections.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn list_unsynced_collections(&self, limit: usize) -> Result<Vec<Collection>> {
        self.check()?;
        let mut pending: Vec<Collection> = self
            .collections
            .read()
            .unwrap()
            .values()
            .filter(|c| c.status != CollectionStatus::Inactive)
            .filter(|c| !c.vector_synced || c.status == CollectionStatus::Syncing)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn delete_collection(&self, id: &str) -> Result<bool> {
        self.check()?;
        Ok(self.collections.write().unwrap().remove(id).is_some())
    }

    async fn soft_delete_collection_children(
        &self,
        collection_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        self.check()?;
        let mut doc_count = 0u64;
        for doc in self.documents.write().unwrap().values_mut() {
            if doc.collection_id == collection_id && !doc.is_deleted {
                doc.is_deleted = true;
                doc.deleted_at = Some(at);
                doc.status = DocumentStatus::Deleted;
                doc.updated_at = at;
                doc_count += 1;
            }
        }
        let mut chunk_count = 0u64;
        for chunk in self.chunks.write().unwrap().values_mut() {
            if chunk.collection_id == collection_id && chunk.status != ChunkStatus::Deleted {
                chunk.status = ChunkStatus::Deleted;
                chunk.vector_synced = false;
                chunk.vector_sync_at = None;
                chunk.updated_at = at;
                chunk_count += 1;
            }
        }
        Ok((doc_count, chunk_count))
    }

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        self.check()?;
        self.documents
            .write()
            .unwrap()
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.check()?;
        Ok(self.documents.read().unwrap().get(id).cloned())
    }

    async fn list_documents(&self, collection_id: &str) -> Result<Vec<Document>> {
        self.check()?;
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .unwrap()
            .values()
            .filter(|d| d.collection_id == collection_id && !d.is_deleted)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn upsert_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.check()?;
        self.chunks
            .write()
            .unwrap()
            .insert(chunk.id.clone(), chunk.clone());
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        self.check()?;
        Ok(self.chunks.read().unwrap().get(id).cloned())
    }

    async fn list_chunks_by_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        self.check()?;
        let mut chunks: Vec<Chunk> = self
            .chunks
            .read()
            .unwrap()
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn list_unsynced_chunks(&self, limit: usize) -> Result<Vec<Chunk>> {
        self.check()?;
        let collections = self.collections.read().unwrap();
        let mut chunks: Vec<Chunk> = self
            .chunks
            .read()
            .unwrap()
            .values()
            .filter(|c| c.needs_sync() && c.embedding.is_some())
            .filter(|c| {
                collections
                    .get(&c.collection_id)
                    .is_some_and(|parent| parent.vector_synced)
            })
            .cloned()
            .collect();
        chunks.sort_by(|a, b| {
            (&a.collection_id, &a.document_id, a.chunk_index).cmp(&(
                &b.collection_id,
                &b.document_id,
                b.chunk_index,
            ))
        });
        chunks.truncate(limit);
        Ok(chunks)
    }

    async fn mark_chunks_synced(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut chunks = self.chunks.write().unwrap();
        let mut changed = 0u64;
        for id in ids {
            if let Some(chunk) = chunks.get_mut(id) {
                if chunk.status == ChunkStatus::Completed {
                    chunk.vector_synced = true;
                    chunk.vector_sync_at = Some(at);
                    chunk.updated_at = at;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn reset_chunks_synced(&self, collection_id: &str, at: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut changed = 0u64;
        for chunk in self.chunks.write().unwrap().values_mut() {
            if chunk.collection_id == collection_id && chunk.vector_synced {
                chunk.vector_synced = false;
                chunk.vector_sync_at = None;
                chunk.updated_at = at;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn record_orphan_container(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.check()?;
        if self.fail_orphan_ledger.load(Ordering::SeqCst) {
            bail!("orphan ledger write failed");
        }
        self.orphans.write().unwrap().insert(name.to_string(), at);
        Ok(())
    }

    async fn list_orphan_containers(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.orphans.read().unwrap().keys().cloned().collect())
    }

    async fn clear_orphan_container(&self, name: &str) -> Result<()> {
        self.check()?;
        self.orphans.write().unwrap().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCollection;

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = InMemoryMetadataStore::new();
        let a = Collection::new(NewCollection::named("docs"), Utc::now());
        let b = Collection::new(NewCollection::named("docs"), Utc::now());
        store.insert_collection(&a).await.unwrap();
        assert!(store.insert_collection(&b).await.is_err());
        assert_eq!(store.list_collections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsynced_listing_includes_syncing() {
        let store = InMemoryMetadataStore::new();
        let mut synced = Collection::new(NewCollection::named("a"), Utc::now());
        synced.vector_synced = true;
        synced.vector_container_name = Some("collection_a".into());
        let mut syncing = Collection::new(NewCollection::named("b"), Utc::now());
        syncing.vector_synced = true;
        syncing.vector_container_name = Some("collection_b".into());
        syncing.status = CollectionStatus::Syncing;
        let fresh = Collection::new(NewCollection::named("c"), Utc::now());
        let mut parked = Collection::new(NewCollection::named("d"), Utc::now());
        parked.status = CollectionStatus::Inactive;
        for c in [&synced, &syncing, &fresh, &parked] {
            store.insert_collection(c).await.unwrap();
        }

        let ids: Vec<String> = store
            .list_unsynced_collections(10)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&syncing.id));
        assert!(ids.contains(&fresh.id));
    }

    #[tokio::test]
    async fn test_mark_synced_skips_incomplete_chunks() {
        let store = InMemoryMetadataStore::new();
        let now = Utc::now();
        let doc = Document::new("c1", "a.txt", 1, now);
        let mut done = Chunk::new(&doc, 0, "a", now);
        done.status = ChunkStatus::Completed;
        let pending = Chunk::new(&doc, 1, "b", now);
        store.upsert_chunk(&done).await.unwrap();
        store.upsert_chunk(&pending).await.unwrap();

        let changed = store
            .mark_chunks_synced(&[done.id.clone(), pending.id.clone(), "missing".into()], now)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert!(!store.get_chunk(&pending.id).await.unwrap().unwrap().vector_synced);
    }

    #[tokio::test]
    async fn test_unsynced_chunks_need_embedding_and_synced_parent() {
        let store = InMemoryMetadataStore::new();
        let now = Utc::now();
        let mut ready = Collection::new(NewCollection::named("ready"), now);
        ready.vector_synced = true;
        ready.vector_container_name = Some("collection_ready".into());
        let waiting = Collection::new(NewCollection::named("waiting"), now);
        store.insert_collection(&ready).await.unwrap();
        store.insert_collection(&waiting).await.unwrap();

        let chunk_in = |collection: &Collection, index: i64, embedded: bool| {
            let doc = Document::new(&collection.id, "a.txt", 1, now);
            let mut chunk = Chunk::new(&doc, index, "text", now);
            chunk.status = ChunkStatus::Completed;
            if embedded {
                chunk.embedding = Some(vec![1.0; 4]);
            }
            chunk
        };
        let good = chunk_in(&ready, 0, true);
        let bare = chunk_in(&ready, 1, false);
        let parked = chunk_in(&waiting, 0, true);
        for c in [&good, &bare, &parked] {
            store.upsert_chunk(c).await.unwrap();
        }

        let listed = store.list_unsynced_chunks(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good.id);

        store.mark_chunks_synced(&[good.id.clone()], now).await.unwrap();
        assert!(store.list_unsynced_chunks(10).await.unwrap().is_empty());
        assert_eq!(store.reset_chunks_synced(&ready.id, now).await.unwrap(), 1);
        assert_eq!(store.reset_chunks_synced(&waiting.id, now).await.unwrap(), 0);
        let stored = store.get_chunk(&good.id).await.unwrap().unwrap();
        assert!(!stored.vector_synced);
        assert!(stored.vector_sync_at.is_none());
    }

    #[tokio::test]
    async fn test_orphan_ledger_failure_switch() {
        let store = InMemoryMetadataStore::new();
        store.set_fail_orphan_ledger(true);
        assert!(store
            .record_orphan_container("collection_x", Utc::now())
            .await
            .is_err());
        assert!(store.ping().await.is_ok());
        store.set_fail_orphan_ledger(false);
        store
            .record_orphan_container("collection_x", Utc::now())
            .await
            .unwrap();
        assert_eq!(store.list_orphan_containers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let store = InMemoryMetadataStore::new();
        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        assert!(store.list_collections().await.is_err());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
