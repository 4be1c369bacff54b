//! Per-collection statistics.
//!
//! Derived from the counters on the collection record (kept current by
//! [`SyncCoordinator::refresh_collection_stats`](crate::coordinator::SyncCoordinator::refresh_collection_stats)).
//! Used by `csync stats <id>`, either as JSON or as a short human summary.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{SyncError, SyncResult};
use crate::models::{Collection, CollectionStatus};
use crate::store::MetadataStore;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CollectionStats {
    pub collection_id: String,
    pub name: String,
    pub document_count: i64,
    pub chunk_count: i64,
    pub total_size_bytes: i64,
    pub average_document_size: f64,
    pub average_chunk_count_per_document: f64,
    pub status: CollectionStatus,
    pub vector_synced: bool,
    pub last_activity: DateTime<Utc>,
}

impl CollectionStats {
    pub fn from_collection(collection: &Collection) -> Self {
        let (avg_size, avg_chunks) = if collection.document_count > 0 {
            let docs = collection.document_count as f64;
            (
                collection.total_size_bytes as f64 / docs,
                collection.chunk_count as f64 / docs,
            )
        } else {
            (0.0, 0.0)
        };
        Self {
            collection_id: collection.id.clone(),
            name: collection.name.clone(),
            document_count: collection.document_count,
            chunk_count: collection.chunk_count,
            total_size_bytes: collection.total_size_bytes,
            average_document_size: avg_size,
            average_chunk_count_per_document: avg_chunks,
            status: collection.status,
            vector_synced: collection.vector_synced,
            last_activity: collection.updated_at,
        }
    }
}

pub async fn collection_stats(metadata: &dyn MetadataStore, id: &str) -> SyncResult<CollectionStats> {
    let collection = metadata
        .get_collection(id)
        .await
        .map_err(SyncError::metadata)?
        .ok_or_else(|| SyncError::not_found("collection", id))?;
    Ok(CollectionStats::from_collection(&collection))
}

/// Print a short human-readable summary to stdout.
pub fn print_stats(stats: &CollectionStats) {
    println!("Collection — {}", stats.name);
    println!("================================");
    println!();
    println!("  Id:          {}", stats.collection_id);
    println!("  Status:      {}", stats.status);
    println!(
        "  Vector sync: {}",
        if stats.vector_synced { "synced" } else { "out of sync" }
    );
    println!("  Activity:    {}", format_relative(stats.last_activity));
    println!();
    println!("  Documents:   {}", stats.document_count);
    println!("  Chunks:      {}", stats.chunk_count);
    println!("  Size:        {}", format_bytes(stats.total_size_bytes.max(0) as u64));
    println!(
        "  Avg doc:     {} / {:.1} chunks",
        format_bytes(stats.average_document_size.max(0.0) as u64),
        stats.average_chunk_count_per_document
    );
    println!();
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCollection;
    use crate::store::memory::InMemoryMetadataStore;

    #[test]
    fn test_averages_with_documents() {
        let mut c = Collection::new(NewCollection::named("docs"), Utc::now());
        c.document_count = 4;
        c.chunk_count = 10;
        c.total_size_bytes = 4096;
        let stats = CollectionStats::from_collection(&c);
        assert_eq!(stats.average_document_size, 1024.0);
        assert_eq!(stats.average_chunk_count_per_document, 2.5);
    }

    #[test]
    fn test_averages_without_documents_are_zero() {
        let c = Collection::new(NewCollection::named("empty"), Utc::now());
        let stats = CollectionStats::from_collection(&c);
        assert_eq!(stats.average_document_size, 0.0);
        assert_eq!(stats.average_chunk_count_per_document, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let store = InMemoryMetadataStore::new();
        let err = collection_stats(&store, "missing").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_relative() {
        assert_eq!(format_relative(Utc::now()), "just now");
        let two_hours = Utc::now() - chrono::Duration::hours(2);
        assert_eq!(format_relative(two_hours), "2 hours ago");
    }
}
