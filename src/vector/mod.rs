//! Vector index abstraction.
//!
//! A vector index holds named **containers**, one per collection. The
//! consistency engine needs only a handful of operations from it, and
//! relies on two properties for safe retries:
//!
//! - [`ensure_container`](VectorIndexClient::ensure_container) is
//!   create-if-absent: calling it on an existing container succeeds.
//! - [`drop_container`](VectorIndexClient::drop_container) is
//!   delete-if-present: dropping a missing container succeeds.
//!
//! Vector upserts and deletes are keyed by chunk id and are idempotent at
//! the vector level.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`memory::InMemoryVectorIndex`] | tests (with fault injection) |
//! | [`sqlite::SqliteVectorIndex`] | local vector index in its own SQLite file |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// One chunk's vector plus the payload stored alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub document_id: String,
    pub collection_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// Per-item outcome of [`VectorIndexClient::upsert_vectors`].
///
/// A call that returns `Ok` wrote every record except those in `failed`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertReport {
    pub failed: Vec<(String, String)>,
}

impl UpsertReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub name: String,
    pub dims: usize,
    pub entity_count: u64,
}

#[async_trait]
pub trait VectorIndexClient: Send + Sync {
    /// Create the container if it does not exist.
    async fn ensure_container(&self, name: &str, dims: usize) -> Result<()>;

    /// Drop the container if it exists.
    async fn drop_container(&self, name: &str) -> Result<()>;

    /// Insert or replace vectors. Item-level rejections are reported in the
    /// returned [`UpsertReport`]; `Err` means the whole call failed.
    async fn upsert_vectors(&self, name: &str, records: &[VectorRecord]) -> Result<UpsertReport>;

    /// Remove vectors by id. Missing ids are ignored.
    async fn delete_vectors(&self, name: &str, ids: &[String]) -> Result<()>;

    /// Container statistics, or `None` if the container does not exist.
    async fn stat(&self, name: &str) -> Result<Option<ContainerStats>>;

    /// Names of all containers. Doubles as a reachability check.
    async fn list_containers(&self) -> Result<Vec<String>>;
}

/// Encode a float vector as a little-endian BLOB for SQLite storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_preserves_values() {
        let v = vec![0.5f32, -1.25, 3.0];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn test_blob_ignores_trailing_bytes() {
        let mut blob = vec_to_blob(&[1.0]);
        blob.push(0xff);
        assert_eq!(blob_to_vec(&blob), vec![1.0]);
    }
}
