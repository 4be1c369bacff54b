//! Core data models used throughout Collection Sync.
//!
//! These types are the records held by the metadata store (collections,
//! documents, chunks), the request type for creating a collection, and the
//! result object returned by every externally exposed operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, SyncError};

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => anyhow::bail!("unknown {} '{}'", stringify!($name), other),
                }
            }
        }
    };
}

status_enum!(
    /// Sync status of a collection. `Syncing` is transient.
    CollectionStatus {
        Active => "active",
        Inactive => "inactive",
        Syncing => "syncing",
        Error => "error",
    }
);

status_enum!(
    /// Processing status of a document.
    DocumentStatus {
        Uploading => "uploading",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Deleted => "deleted",
    }
);

status_enum!(
    /// Embedding status of a chunk. Vector sync is tracked separately.
    ChunkStatus {
        Pending => "pending",
        Embedding => "embedding",
        Completed => "completed",
        Failed => "failed",
        Deleted => "deleted",
    }
);

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_CHUNK_SIZE: i64 = 1000;
pub const DEFAULT_CHUNK_OVERLAP: i64 = 200;

/// A named grouping of documents, backed by one vector container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: CollectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub embedding_model: String,
    pub chunk_size: i64,
    pub chunk_overlap: i64,
    pub settings: serde_json::Value,
    pub tags: Vec<String>,

    pub document_count: i64,
    pub chunk_count: i64,
    pub total_size_bytes: i64,

    pub vector_container_name: Option<String>,
    pub vector_synced: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
}

impl Collection {
    /// Build a fresh record: `active`, not synced, no container yet.
    pub fn new(request: NewCollection, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            description: request.description,
            status: CollectionStatus::Active,
            created_at: now,
            updated_at: now,
            embedding_model: request.embedding_model,
            chunk_size: request.chunk_size,
            chunk_overlap: request.chunk_overlap,
            settings: request.settings,
            tags: request.tags,
            document_count: 0,
            chunk_count: 0,
            total_size_bytes: 0,
            vector_container_name: None,
            vector_synced: false,
            last_sync_at: None,
            sync_error: None,
        }
    }

    /// Whether reconciliation should look at this record.
    pub fn needs_sync(&self) -> bool {
        !self.vector_synced || self.status == CollectionStatus::Syncing
    }

    /// Checks the cross-field invariant on sync state.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.vector_synced && self.vector_container_name.is_none() {
            return Err(format!(
                "collection {} is marked synced without a container name",
                self.id
            ));
        }
        if self.vector_synced && self.status == CollectionStatus::Error {
            return Err(format!(
                "collection {} is marked synced while in error",
                self.id
            ));
        }
        Ok(())
    }
}

/// An ingested file inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub collection_id: String,
    pub filename: String,
    pub file_size: i64,
    pub status: DocumentStatus,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    pub retry_count: u32,
    pub chunk_count: i64,
    pub character_count: i64,
    pub word_count: i64,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A document that has just started uploading.
    pub fn new(
        collection_id: &str,
        filename: &str,
        file_size: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            collection_id: collection_id.to_string(),
            filename: filename.to_string(),
            file_size,
            status: DocumentStatus::Uploading,
            processing_started_at: None,
            processing_completed_at: None,
            processing_error: None,
            retry_count: 0,
            chunk_count: 0,
            character_count: 0,
            word_count: 0,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A piece of a document's text and, once embedded, its vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub collection_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub content_hash: String,
    pub status: ChunkStatus,
    pub embedding_model: Option<String>,
    pub embedding_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub vector_synced: bool,
    pub vector_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    /// A pending chunk of `document`.
    pub fn new(document: &Document, chunk_index: i64, content: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            collection_id: document.collection_id.clone(),
            chunk_index,
            content: content.to_string(),
            content_hash: content_hash(content),
            status: ChunkStatus::Pending,
            embedding_model: None,
            embedding_error: None,
            embedding: None,
            vector_synced: false,
            vector_sync_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Completed with an embedding, but not yet pushed to the vector index.
    pub fn needs_sync(&self) -> bool {
        self.status == ChunkStatus::Completed && !self.vector_synced
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.vector_synced && self.status != ChunkStatus::Completed {
            return Err(format!(
                "chunk {} is vector-synced in status '{}'",
                self.id, self.status
            ));
        }
        Ok(())
    }
}

/// SHA-256 of the chunk text, hex encoded.
fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Request to create a collection. Run [`NewCollection::validate`] first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCollection {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: i64,
    #[serde(default = "default_settings")]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}
fn default_chunk_size() -> i64 {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_overlap() -> i64 {
    DEFAULT_CHUNK_OVERLAP
}
fn default_settings() -> serde_json::Value {
    serde_json::json!({})
}

impl NewCollection {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            embedding_model: default_embedding_model(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            settings: default_settings(),
            tags: Vec::new(),
        }
    }

    /// Normalizes the request in place and rejects invalid values.
    ///
    /// The name is trimmed; tags are trimmed, de-duplicated and stripped
    /// of empties (first occurrence wins).
    pub fn validate(&mut self) -> Result<(), SyncError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(SyncError::Validation(
                "collection name cannot be empty".into(),
            ));
        }
        if name.chars().count() > 255 {
            return Err(SyncError::Validation(
                "collection name cannot exceed 255 characters".into(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == ' ' || c == '-' || c == '_')
        {
            return Err(SyncError::Validation(
                "collection name can only contain letters, numbers, spaces, hyphens, and underscores"
                    .into(),
            ));
        }
        self.name = name;

        if let Some(desc) = &self.description {
            if desc.chars().count() > 2000 {
                return Err(SyncError::Validation(
                    "description cannot exceed 2000 characters".into(),
                ));
            }
        }
        if self.embedding_model.trim().is_empty() {
            return Err(SyncError::Validation(
                "embedding_model cannot be empty".into(),
            ));
        }
        if !(100..=8000).contains(&self.chunk_size) {
            return Err(SyncError::Validation(
                "chunk_size must be between 100 and 8000".into(),
            ));
        }
        if !(0..=1000).contains(&self.chunk_overlap) {
            return Err(SyncError::Validation(
                "chunk_overlap must be between 0 and 1000".into(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(SyncError::Validation(
                "chunk_overlap must be less than chunk_size".into(),
            ));
        }
        if !self.settings.is_object() {
            return Err(SyncError::Validation("settings must be a JSON object".into()));
        }

        let mut tags: Vec<String> = Vec::new();
        for tag in self.tags.iter().map(|t| t.trim()) {
            if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        if tags.len() > 20 {
            return Err(SyncError::Validation("maximum 20 tags allowed".into()));
        }
        if tags.iter().any(|t| t.chars().count() > 50) {
            return Err(SyncError::Validation(
                "tag length cannot exceed 50 characters".into(),
            ));
        }
        self.tags = tags;
        Ok(())
    }
}

// ============ Operation results ============

/// Outcome class of an exposed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// The operation finished and both stores agree.
    Completed,
    /// Accepted and recorded, but not yet searchable (sync pending or failed).
    Pending,
    /// The operation ran and failed; the failure is recorded on the entity.
    Failed,
}

impl OperationStatus {
    /// HTTP status an API layer should map this outcome to.
    pub fn status_code(self) -> u16 {
        match self {
            OperationStatus::Completed => 200,
            OperationStatus::Pending => 202,
            OperationStatus::Failed => 502,
        }
    }
}

/// Result object returned by create/sync/delete.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub details: serde_json::Value,
}

impl OperationResult {
    pub fn completed(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status: OperationStatus::Completed,
            message: message.into(),
            error: None,
            details,
        }
    }

    pub fn pending(message: impl Into<String>, error: ErrorKind, details: serde_json::Value) -> Self {
        Self {
            status: OperationStatus::Pending,
            message: message.into(),
            error: Some(error),
            details,
        }
    }

    pub fn failed(message: impl Into<String>, error: ErrorKind, details: serde_json::Value) -> Self {
        Self {
            status: OperationStatus::Failed,
            message: message.into(),
            error: Some(error),
            details,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == OperationStatus::Completed
    }
}
