//! The SQLite metadata store and vector index against real database files.

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use collection_sync::config::{
    Config, DocumentsConfig, MetadataConfig, ReconcileConfig, VectorConfig,
};
use collection_sync::db;
use collection_sync::engine::Engine;
use collection_sync::migrate::{self, migrate_metadata, migrate_vectors};
use collection_sync::models::{
    Chunk, ChunkStatus, Collection, CollectionStatus, Document, DocumentStatus, NewCollection,
};
use collection_sync::store::sqlite::SqliteMetadataStore;
use collection_sync::store::MetadataStore;
use collection_sync::vector::sqlite::SqliteVectorIndex;
use collection_sync::vector::{VectorIndexClient, VectorRecord};

/// Millisecond-precision "now", so values survive the INTEGER round trip.
fn now() -> chrono::DateTime<Utc> {
    db::from_millis(db::to_millis(Utc::now()))
}

async fn metadata_store(tmp: &TempDir) -> SqliteMetadataStore {
    let pool = db::connect(&tmp.path().join("metadata.sqlite"))
        .await
        .unwrap();
    migrate_metadata(&pool).await.unwrap();
    SqliteMetadataStore::new(pool)
}

async fn vector_index(tmp: &TempDir) -> SqliteVectorIndex {
    let pool = db::connect(&tmp.path().join("vectors.sqlite")).await.unwrap();
    migrate_vectors(&pool).await.unwrap();
    SqliteVectorIndex::new(pool)
}

fn collection(name: &str) -> Collection {
    let mut request = NewCollection::named(name);
    request.description = Some("notes".into());
    request.tags = vec!["x".into(), "y".into()];
    request.settings = serde_json::json!({ "language": "en" });
    Collection::new(request, now())
}

fn record(id: &str, dims: usize) -> VectorRecord {
    VectorRecord {
        id: id.to_string(),
        document_id: "d".into(),
        collection_id: "c".into(),
        content: format!("content {}", id),
        embedding: vec![0.25; dims],
    }
}

#[tokio::test]
async fn test_collection_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = metadata_store(&tmp).await;

    let mut c = collection("Research Notes");
    c.last_sync_at = Some(now());
    c.sync_error = Some("boom".into());
    store.insert_collection(&c).await.unwrap();

    let loaded = store.get_collection(&c.id).await.unwrap().unwrap();
    assert_eq!(loaded, c);
    let by_name = store
        .get_collection_by_name("Research Notes")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_name.id, c.id);
    assert!(store.get_collection("missing").await.unwrap().is_none());

    c.status = CollectionStatus::Active;
    c.vector_container_name = Some("collection_0123456789abcdef".into());
    c.vector_synced = true;
    c.sync_error = None;
    store.upsert_collection(&c).await.unwrap();
    assert_eq!(store.get_collection(&c.id).await.unwrap().unwrap(), c);
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = metadata_store(&tmp).await;

    store.insert_collection(&collection("docs")).await.unwrap();
    assert!(store.insert_collection(&collection("docs")).await.is_err());
    assert_eq!(store.list_collections().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsynced_listing_and_delete() {
    let tmp = TempDir::new().unwrap();
    let store = metadata_store(&tmp).await;

    let unsynced = collection("a");
    let mut synced = collection("b");
    synced.vector_container_name = Some("collection_b".into());
    synced.vector_synced = true;
    let mut syncing = collection("c");
    syncing.status = CollectionStatus::Syncing;
    syncing.vector_container_name = Some("collection_c".into());
    let mut inactive = collection("d");
    inactive.status = CollectionStatus::Inactive;
    for c in [&unsynced, &synced, &syncing, &inactive] {
        store.insert_collection(c).await.unwrap();
    }

    let listed: Vec<String> = store
        .list_unsynced_collections(10)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&"a".to_string()));
    assert!(listed.contains(&"c".to_string()));
    assert_eq!(store.list_unsynced_collections(1).await.unwrap().len(), 1);

    assert!(store.delete_collection(&unsynced.id).await.unwrap());
    assert!(!store.delete_collection(&unsynced.id).await.unwrap());
}

#[tokio::test]
async fn test_documents_and_chunks() {
    let tmp = TempDir::new().unwrap();
    let store = metadata_store(&tmp).await;
    let mut c = collection("docs");
    c.status = CollectionStatus::Active;
    c.vector_container_name = Some("collection_docs".into());
    c.vector_synced = true;
    store.insert_collection(&c).await.unwrap();

    let mut doc = Document::new(&c.id, "a.md", 300, now());
    doc.status = DocumentStatus::Completed;
    doc.retry_count = 2;
    store.upsert_document(&doc).await.unwrap();
    assert_eq!(store.get_document(&doc.id).await.unwrap().unwrap(), doc);

    let mut done = Chunk::new(&doc, 0, "first", now());
    done.status = ChunkStatus::Completed;
    done.embedding_model = Some("text-embedding-3-small".into());
    done.embedding = Some(vec![0.5, -1.0, 2.25]);
    let pending = Chunk::new(&doc, 1, "second", now());
    let mut bare = Chunk::new(&doc, 2, "third", now());
    bare.status = ChunkStatus::Completed;
    store.upsert_chunk(&done).await.unwrap();
    store.upsert_chunk(&pending).await.unwrap();
    store.upsert_chunk(&bare).await.unwrap();

    // A completed chunk whose collection has no container yet.
    let waiting = collection("waiting");
    store.insert_collection(&waiting).await.unwrap();
    let other_doc = Document::new(&waiting.id, "b.md", 10, now());
    let mut parked = Chunk::new(&other_doc, 0, "parked", now());
    parked.status = ChunkStatus::Completed;
    parked.embedding = Some(vec![1.0, 1.0, 1.0]);
    store.upsert_chunk(&parked).await.unwrap();

    assert_eq!(store.get_chunk(&done.id).await.unwrap().unwrap(), done);
    let by_doc = store.list_chunks_by_document(&doc.id).await.unwrap();
    assert_eq!(by_doc.len(), 3);
    assert_eq!(by_doc[0].chunk_index, 0);

    let unsynced = store.list_unsynced_chunks(10).await.unwrap();
    assert_eq!(unsynced.len(), 1);
    assert_eq!(unsynced[0].id, done.id);

    let ids = vec![done.id.clone(), pending.id.clone()];
    assert_eq!(store.mark_chunks_synced(&ids, now()).await.unwrap(), 1);
    assert_eq!(store.mark_chunks_synced(&[], now()).await.unwrap(), 0);
    assert!(store.get_chunk(&done.id).await.unwrap().unwrap().vector_synced);
    assert!(!store.get_chunk(&pending.id).await.unwrap().unwrap().vector_synced);
    assert!(store.list_unsynced_chunks(10).await.unwrap().is_empty());

    // A recreated container invalidates every pushed chunk.
    assert_eq!(store.reset_chunks_synced(&c.id, now()).await.unwrap(), 1);
    assert_eq!(store.reset_chunks_synced(&c.id, now()).await.unwrap(), 0);
    let reset = store.get_chunk(&done.id).await.unwrap().unwrap();
    assert!(!reset.vector_synced);
    assert!(reset.vector_sync_at.is_none());
    assert_eq!(store.list_unsynced_chunks(10).await.unwrap()[0].id, done.id);

    let (docs, chunks) = store
        .soft_delete_collection_children(&c.id, now())
        .await
        .unwrap();
    assert_eq!((docs, chunks), (1, 3));
    assert!(store.list_documents(&c.id).await.unwrap().is_empty());
    let deleted = store.get_chunk(&done.id).await.unwrap().unwrap();
    assert_eq!(deleted.status, ChunkStatus::Deleted);
    assert!(!deleted.vector_synced);
    // Already deleted: nothing new to mark.
    assert_eq!(
        store
            .soft_delete_collection_children(&c.id, now())
            .await
            .unwrap(),
        (0, 0)
    );
}

#[tokio::test]
async fn test_orphan_ledger() {
    let tmp = TempDir::new().unwrap();
    let store = metadata_store(&tmp).await;

    store.record_orphan_container("collection_a", now()).await.unwrap();
    store.record_orphan_container("collection_a", now()).await.unwrap();
    store.record_orphan_container("collection_b", now()).await.unwrap();
    assert_eq!(store.list_orphan_containers().await.unwrap().len(), 2);

    store.clear_orphan_container("collection_a").await.unwrap();
    store.clear_orphan_container("collection_a").await.unwrap();
    assert_eq!(
        store.list_orphan_containers().await.unwrap(),
        vec!["collection_b".to_string()]
    );
    store.ping().await.unwrap();
}

#[tokio::test]
async fn test_vector_containers() {
    let tmp = TempDir::new().unwrap();
    let index = vector_index(&tmp).await;

    index.ensure_container("collection_x", 3).await.unwrap();
    index.ensure_container("collection_x", 3).await.unwrap();
    assert_eq!(
        index.list_containers().await.unwrap(),
        vec!["collection_x".to_string()]
    );

    let report = index
        .upsert_vectors(
            "collection_x",
            &[record("a", 3), record("b", 3), record("bad", 2)],
        )
        .await
        .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "bad");

    // Upsert by id replaces.
    index
        .upsert_vectors("collection_x", &[record("a", 3)])
        .await
        .unwrap();
    let stats = index.stat("collection_x").await.unwrap().unwrap();
    assert_eq!(stats.dims, 3);
    assert_eq!(stats.entity_count, 2);

    index
        .delete_vectors("collection_x", &["a".to_string(), "zzz".to_string()])
        .await
        .unwrap();
    assert_eq!(
        index.stat("collection_x").await.unwrap().unwrap().entity_count,
        1
    );

    assert!(index
        .upsert_vectors("collection_missing", &[record("a", 3)])
        .await
        .is_err());

    index.drop_container("collection_x").await.unwrap();
    index.drop_container("collection_x").await.unwrap();
    assert!(index.stat("collection_x").await.unwrap().is_none());
}

#[tokio::test]
async fn test_engine_over_sqlite() {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        metadata: MetadataConfig {
            path: tmp.path().join("data/metadata.sqlite"),
        },
        vector: VectorConfig {
            path: tmp.path().join("data/vectors.sqlite"),
            dims: 3,
            rpc_timeout_ms: 5_000,
            container_prefix: "collection_".into(),
        },
        reconcile: ReconcileConfig {
            batch_size: 2,
            ..ReconcileConfig::default()
        },
        documents: DocumentsConfig::default(),
    };
    migrate::run_migrations(&config).await.unwrap();
    migrate::run_migrations(&config).await.unwrap();

    let engine = Engine::open(&config).await.unwrap();
    let result = engine
        .coordinator
        .create_collection(NewCollection::named("docs"))
        .await
        .unwrap();
    assert!(result.is_completed());
    let id = result.details["collection_id"].as_str().unwrap().to_string();

    let metadata: Arc<dyn MetadataStore> = engine.coordinator.metadata().clone();
    let mut doc = Document::new(&id, "a.md", 10, now());
    doc.status = DocumentStatus::Completed;
    metadata.upsert_document(&doc).await.unwrap();
    for i in 0..5 {
        let mut chunk = Chunk::new(&doc, i, "text", now());
        chunk.status = ChunkStatus::Completed;
        chunk.embedding = Some(vec![i as f32; 3]);
        metadata.upsert_chunk(&chunk).await.unwrap();
    }

    let report = engine.scanner.reconcile_once().await;
    assert_eq!(report.chunks_synced, 5);
    assert!(report.failures.is_empty());

    let again = engine.scanner.reconcile_once().await;
    assert!(!again.repaired_anything());

    let health = engine.health.check_collection_health(&id).await.unwrap();
    assert!(health.healthy, "{:?}", health.issues);
    assert_eq!(health.container.unwrap().entity_count, 5);

    let deleted = engine.coordinator.delete_collection(&id).await.unwrap();
    assert_eq!(deleted.details["chunks_deleted"], 5);
    assert!(engine
        .coordinator
        .vectors()
        .list_containers()
        .await
        .unwrap()
        .is_empty());
    engine.close().await;
}
