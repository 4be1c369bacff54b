//! SQLite-backed [`MetadataStore`] implementation.
//!
//! Maps each [`MetadataStore`] operation onto the schema created by
//! [`migrate_metadata`](crate::migrate::migrate_metadata). Timestamps are
//! Unix milliseconds, `settings` and `tags` are JSON text, and chunk
//! embeddings are little-endian `f32` BLOBs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::MetadataStore;
use crate::db::{from_millis, to_millis};
use crate::models::{Chunk, Collection, Document};
use crate::vector::{blob_to_vec, vec_to_blob};

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const COLLECTION_COLUMNS: &str = "id, name, description, status, created_at, updated_at, \
    embedding_model, chunk_size, chunk_overlap, settings_json, tags_json, document_count, \
    chunk_count, total_size_bytes, vector_container_name, vector_synced, last_sync_at, sync_error";

const DOCUMENT_COLUMNS: &str = "id, collection_id, filename, file_size, status, \
    processing_started_at, processing_completed_at, processing_error, retry_count, chunk_count, \
    character_count, word_count, is_deleted, deleted_at, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, document_id, collection_id, chunk_index, content, content_hash, \
    status, embedding_model, embedding_error, embedding, vector_synced, vector_sync_at, \
    created_at, updated_at";

fn opt_ts(row: &SqliteRow, column: &str) -> Option<DateTime<Utc>> {
    row.get::<Option<i64>, _>(column).map(from_millis)
}

fn row_to_collection(row: &SqliteRow) -> Result<Collection> {
    let status: String = row.get("status");
    let settings_json: String = row.get("settings_json");
    let tags_json: String = row.get("tags_json");
    Ok(Collection {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        status: status.parse()?,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        embedding_model: row.get("embedding_model"),
        chunk_size: row.get("chunk_size"),
        chunk_overlap: row.get("chunk_overlap"),
        settings: serde_json::from_str(&settings_json).unwrap_or(serde_json::json!({})),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        document_count: row.get("document_count"),
        chunk_count: row.get("chunk_count"),
        total_size_bytes: row.get("total_size_bytes"),
        vector_container_name: row.get("vector_container_name"),
        vector_synced: row.get("vector_synced"),
        last_sync_at: opt_ts(row, "last_sync_at"),
        sync_error: row.get("sync_error"),
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        filename: row.get("filename"),
        file_size: row.get("file_size"),
        status: status.parse()?,
        processing_started_at: opt_ts(row, "processing_started_at"),
        processing_completed_at: opt_ts(row, "processing_completed_at"),
        processing_error: row.get("processing_error"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        chunk_count: row.get("chunk_count"),
        character_count: row.get("character_count"),
        word_count: row.get("word_count"),
        is_deleted: row.get("is_deleted"),
        deleted_at: opt_ts(row, "deleted_at"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let status: String = row.get("status");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        collection_id: row.get("collection_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        status: status.parse()?,
        embedding_model: row.get("embedding_model"),
        embedding_error: row.get("embedding_error"),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        vector_synced: row.get("vector_synced"),
        vector_sync_at: opt_ts(row, "vector_sync_at"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_collection(&self, c: &Collection) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO collections ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLLECTION_COLUMNS
        ))
        .bind(&c.id)
        .bind(&c.name)
        .bind(&c.description)
        .bind(c.status.as_str())
        .bind(to_millis(c.created_at))
        .bind(to_millis(c.updated_at))
        .bind(&c.embedding_model)
        .bind(c.chunk_size)
        .bind(c.chunk_overlap)
        .bind(c.settings.to_string())
        .bind(serde_json::to_string(&c.tags)?)
        .bind(c.document_count)
        .bind(c.chunk_count)
        .bind(c.total_size_bytes)
        .bind(&c.vector_container_name)
        .bind(c.vector_synced)
        .bind(c.last_sync_at.map(to_millis))
        .bind(&c.sync_error)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert collection '{}'", c.name))?;
        Ok(())
    }

    async fn upsert_collection(&self, c: &Collection) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO collections ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                status = excluded.status,
                updated_at = excluded.updated_at,
                embedding_model = excluded.embedding_model,
                chunk_size = excluded.chunk_size,
                chunk_overlap = excluded.chunk_overlap,
                settings_json = excluded.settings_json,
                tags_json = excluded.tags_json,
                document_count = excluded.document_count,
                chunk_count = excluded.chunk_count,
                total_size_bytes = excluded.total_size_bytes,
                vector_container_name = excluded.vector_container_name,
                vector_synced = excluded.vector_synced,
                last_sync_at = excluded.last_sync_at,
                sync_error = excluded.sync_error
            "#,
            COLLECTION_COLUMNS
        ))
        .bind(&c.id)
        .bind(&c.name)
        .bind(&c.description)
        .bind(c.status.as_str())
        .bind(to_millis(c.created_at))
        .bind(to_millis(c.updated_at))
        .bind(&c.embedding_model)
        .bind(c.chunk_size)
        .bind(c.chunk_overlap)
        .bind(c.settings.to_string())
        .bind(serde_json::to_string(&c.tags)?)
        .bind(c.document_count)
        .bind(c.chunk_count)
        .bind(c.total_size_bytes)
        .bind(&c.vector_container_name)
        .bind(c.vector_synced)
        .bind(c.last_sync_at.map(to_millis))
        .bind(&c.sync_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_collection(&self, id: &str) -> Result<Option<Collection>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM collections WHERE id = ?",
            COLLECTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_collection).transpose()
    }

    async fn get_collection_by_name(&self, name: &str) -> Result<Option<Collection>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM collections WHERE name = ?",
            COLLECTION_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_collection).transpose()
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM collections ORDER BY created_at ASC, id ASC",
            COLLECTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_collection).collect()
    }

    async fn list_unsynced_collections(&self, limit: usize) -> Result<Vec<Collection>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM collections
            WHERE (vector_synced = 0 OR status = 'syncing') AND status != 'inactive'
            ORDER BY updated_at ASC, id ASC
            LIMIT ?
            "#,
            COLLECTION_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_collection).collect()
    }

    async fn delete_collection(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM collections WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete_collection_children(
        &self,
        collection_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        let ts = to_millis(at);
        let mut tx = self.pool.begin().await?;
        let docs = sqlx::query(
            r#"
            UPDATE documents
            SET is_deleted = 1, deleted_at = ?, status = 'deleted', updated_at = ?
            WHERE collection_id = ? AND is_deleted = 0
            "#,
        )
        .bind(ts)
        .bind(ts)
        .bind(collection_id)
        .execute(&mut *tx)
        .await?;
        let chunks = sqlx::query(
            r#"
            UPDATE chunks
            SET status = 'deleted', vector_synced = 0, vector_sync_at = NULL, updated_at = ?
            WHERE collection_id = ? AND status != 'deleted'
            "#,
        )
        .bind(ts)
        .bind(collection_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((docs.rows_affected(), chunks.rows_affected()))
    }

    async fn upsert_document(&self, d: &Document) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO documents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                processing_started_at = excluded.processing_started_at,
                processing_completed_at = excluded.processing_completed_at,
                processing_error = excluded.processing_error,
                retry_count = excluded.retry_count,
                chunk_count = excluded.chunk_count,
                character_count = excluded.character_count,
                word_count = excluded.word_count,
                is_deleted = excluded.is_deleted,
                deleted_at = excluded.deleted_at,
                updated_at = excluded.updated_at
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(&d.id)
        .bind(&d.collection_id)
        .bind(&d.filename)
        .bind(d.file_size)
        .bind(d.status.as_str())
        .bind(d.processing_started_at.map(to_millis))
        .bind(d.processing_completed_at.map(to_millis))
        .bind(&d.processing_error)
        .bind(i64::from(d.retry_count))
        .bind(d.chunk_count)
        .bind(d.character_count)
        .bind(d.word_count)
        .bind(d.is_deleted)
        .bind(d.deleted_at.map(to_millis))
        .bind(to_millis(d.created_at))
        .bind(to_millis(d.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, collection_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE collection_id = ? AND is_deleted = 0 ORDER BY created_at ASC, id ASC",
            DOCUMENT_COLUMNS
        ))
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn upsert_chunk(&self, c: &Chunk) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO chunks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                content_hash = excluded.content_hash,
                status = excluded.status,
                embedding_model = excluded.embedding_model,
                embedding_error = excluded.embedding_error,
                embedding = excluded.embedding,
                vector_synced = excluded.vector_synced,
                vector_sync_at = excluded.vector_sync_at,
                updated_at = excluded.updated_at
            "#,
            CHUNK_COLUMNS
        ))
        .bind(&c.id)
        .bind(&c.document_id)
        .bind(&c.collection_id)
        .bind(c.chunk_index)
        .bind(&c.content)
        .bind(&c.content_hash)
        .bind(c.status.as_str())
        .bind(&c.embedding_model)
        .bind(&c.embedding_error)
        .bind(c.embedding.as_deref().map(vec_to_blob))
        .bind(c.vector_synced)
        .bind(c.vector_sync_at.map(to_millis))
        .bind(to_millis(c.created_at))
        .bind(to_millis(c.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!("SELECT {} FROM chunks WHERE id = ?", CHUNK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn list_chunks_by_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
            CHUNK_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn list_unsynced_chunks(&self, limit: usize) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM chunks
            WHERE status = 'completed' AND vector_synced = 0 AND embedding IS NOT NULL
              AND collection_id IN (SELECT id FROM collections WHERE vector_synced = 1)
            ORDER BY collection_id, document_id, chunk_index
            LIMIT ?
            "#,
            CHUNK_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn mark_chunks_synced(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ts = to_millis(at);
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE chunks SET vector_synced = 1, vector_sync_at = ");
        qb.push_bind(ts);
        qb.push(", updated_at = ");
        qb.push_bind(ts);
        qb.push(" WHERE status = 'completed' AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn reset_chunks_synced(&self, collection_id: &str, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE chunks SET vector_synced = 0, vector_sync_at = NULL, updated_at = ?
            WHERE collection_id = ? AND vector_synced = 1
            "#,
        )
        .bind(to_millis(at))
        .bind(collection_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_orphan_container(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO orphan_containers (name, recorded_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(to_millis(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_orphan_containers(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM orphan_containers ORDER BY recorded_at, name")
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    async fn clear_orphan_container(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM orphan_containers WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
