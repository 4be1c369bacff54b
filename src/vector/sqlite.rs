//! SQLite-backed [`VectorIndexClient`].
//!
//! A local vector index kept in its own database file (separate from the
//! metadata store). Containers are rows in `vector_containers`; vectors
//! are little-endian `f32` BLOBs in `container_vectors`, keyed by
//! `(container, id)`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{vec_to_blob, ContainerStats, UpsertReport, VectorIndexClient, VectorRecord};
use crate::db::to_millis;

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn container_dims(&self, name: &str) -> Result<Option<usize>> {
        let dims: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM vector_containers WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dims.map(|d| d as usize))
    }
}

#[async_trait]
impl VectorIndexClient for SqliteVectorIndex {
    async fn ensure_container(&self, name: &str, dims: usize) -> Result<()> {
        sqlx::query(
            "INSERT INTO vector_containers (name, dims, created_at) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(dims as i64)
        .bind(to_millis(chrono::Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_container(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM container_vectors WHERE container = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM vector_containers WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_vectors(&self, name: &str, records: &[VectorRecord]) -> Result<UpsertReport> {
        let dims = match self.container_dims(name).await? {
            Some(d) => d,
            None => bail!("container {} not found", name),
        };

        let mut report = UpsertReport::default();
        let mut tx = self.pool.begin().await?;
        for record in records {
            if record.embedding.len() != dims {
                report.failed.push((
                    record.id.clone(),
                    format!(
                        "dimension mismatch: expected {}, got {}",
                        dims,
                        record.embedding.len()
                    ),
                ));
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO container_vectors (container, id, document_id, collection_id, content, embedding)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(container, id) DO UPDATE SET
                    document_id = excluded.document_id,
                    collection_id = excluded.collection_id,
                    content = excluded.content,
                    embedding = excluded.embedding
                "#,
            )
            .bind(name)
            .bind(&record.id)
            .bind(&record.document_id)
            .bind(&record.collection_id)
            .bind(&record.content)
            .bind(vec_to_blob(&record.embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn delete_vectors(&self, name: &str, ids: &[String]) -> Result<()> {
        if self.container_dims(name).await?.is_none() {
            bail!("container {} not found", name);
        }
        if ids.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM container_vectors WHERE container = ");
        qb.push_bind(name);
        qb.push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn stat(&self, name: &str) -> Result<Option<ContainerStats>> {
        let row = sqlx::query(
            r#"
            SELECT c.dims AS dims, COUNT(v.id) AS entity_count
            FROM vector_containers c
            LEFT JOIN container_vectors v ON v.container = c.name
            WHERE c.name = ?
            GROUP BY c.name
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ContainerStats {
            name: name.to_string(),
            dims: row.get::<i64, _>("dims") as usize,
            entity_count: row.get::<i64, _>("entity_count") as u64,
        }))
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM vector_containers ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }
}
