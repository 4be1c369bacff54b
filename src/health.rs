//! Combined health of the metadata store, the vector index, and the sync
//! state between them.
//!
//! Each signal is gathered independently; one failing check never hides
//! another. A collection can be `synced` on record while its container is
//! missing, and both facts show up in the same [`CollectionHealth`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::coordinator::SyncCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::models::CollectionStatus;
use crate::vector::ContainerStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
    /// Nothing to check (the collection has no container yet).
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    OutOfSync,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionHealth {
    pub collection_id: String,
    pub collection_name: String,
    pub database_status: ProbeStatus,
    pub vector_status: ProbeStatus,
    pub sync_status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerStats>,
    pub healthy: bool,
    pub issues: Vec<String>,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    /// Metadata is reachable but something else is wrong.
    Degraded,
    /// The metadata store is unreachable.
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub metadata: ProbeStatus,
    pub vector: ProbeStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: OverallStatus,
    pub services: ServiceStatus,
    pub collections_total: u64,
    pub collections_by_status: BTreeMap<String, u64>,
    pub collections_synced: u64,
    pub documents_total: i64,
    pub chunks_total: i64,
    pub total_size_bytes: i64,
    pub vector_containers: u64,
    pub issues: Vec<String>,
    pub version: &'static str,
    pub last_check: DateTime<Utc>,
}

pub struct HealthAggregator {
    coordinator: Arc<SyncCoordinator>,
}

impl HealthAggregator {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Health of one collection.
    ///
    /// Fails only when the record cannot be read (`NotFound`, or
    /// `BackingStoreUnavailable` for the metadata store). Vector problems
    /// are reported in the result.
    pub async fn check_collection_health(&self, id: &str) -> SyncResult<CollectionHealth> {
        let collection = self
            .coordinator
            .metadata()
            .get_collection(id)
            .await
            .map_err(SyncError::metadata)?
            .ok_or_else(|| SyncError::not_found("collection", id))?;

        let mut issues = Vec::new();
        let mut container = None;
        let vector_status = match &collection.vector_container_name {
            None => ProbeStatus::Unknown,
            Some(name) => {
                let vectors = self.coordinator.vectors();
                match self.coordinator.vector_call("stat", vectors.stat(name)).await {
                    Ok(Some(stats)) => {
                        container = Some(stats);
                        ProbeStatus::Healthy
                    }
                    Ok(None) => {
                        issues.push(format!("Vector container {} not found", name));
                        ProbeStatus::Unhealthy
                    }
                    Err(e) => {
                        issues.push(format!("Vector container {} not accessible: {:#}", name, e));
                        ProbeStatus::Unhealthy
                    }
                }
            }
        };

        let sync_status = if collection.vector_synced {
            SyncStatus::Synced
        } else {
            issues.push("Collection not synchronized with vector index".to_string());
            SyncStatus::OutOfSync
        };
        if collection.status != CollectionStatus::Active {
            issues.push(format!("Collection status is {}", collection.status));
        }
        if let Some(cause) = &collection.sync_error {
            issues.push(format!("Last sync error: {}", cause));
        }

        Ok(CollectionHealth {
            collection_id: collection.id,
            collection_name: collection.name,
            database_status: ProbeStatus::Healthy,
            vector_status,
            sync_status,
            container,
            healthy: issues.is_empty(),
            issues,
            last_check: Utc::now(),
        })
    }

    /// Health of both stores plus aggregate counts. Never fails: store
    /// outages are part of the report.
    pub async fn check_system_health(&self) -> SystemHealth {
        let metadata = self.coordinator.metadata();
        let vectors = self.coordinator.vectors();
        let mut issues = Vec::new();

        let metadata_status = match metadata.ping().await {
            Ok(()) => ProbeStatus::Healthy,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "metadata store health check failed");
                issues.push(format!("Metadata store unavailable: {:#}", e));
                ProbeStatus::Unhealthy
            }
        };

        let mut vector_containers = 0;
        let vector_status = match self
            .coordinator
            .vector_call("list_containers", vectors.list_containers())
            .await
        {
            Ok(names) => {
                vector_containers = names.len() as u64;
                ProbeStatus::Healthy
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "vector index health check failed");
                issues.push(format!("Vector index unavailable: {:#}", e));
                ProbeStatus::Unhealthy
            }
        };

        let mut health = SystemHealth {
            status: OverallStatus::Healthy,
            services: ServiceStatus {
                metadata: metadata_status,
                vector: vector_status,
            },
            collections_total: 0,
            collections_by_status: BTreeMap::new(),
            collections_synced: 0,
            documents_total: 0,
            chunks_total: 0,
            total_size_bytes: 0,
            vector_containers,
            issues: Vec::new(),
            version: env!("CARGO_PKG_VERSION"),
            last_check: Utc::now(),
        };

        if metadata_status == ProbeStatus::Healthy {
            match metadata.list_collections().await {
                Ok(collections) => {
                    for collection in &collections {
                        *health
                            .collections_by_status
                            .entry(collection.status.to_string())
                            .or_default() += 1;
                        if collection.vector_synced {
                            health.collections_synced += 1;
                        }
                        health.documents_total += collection.document_count;
                        health.chunks_total += collection.chunk_count;
                        health.total_size_bytes += collection.total_size_bytes;
                    }
                    health.collections_total = collections.len() as u64;
                    let unsynced = health.collections_total - health.collections_synced;
                    if unsynced > 0 {
                        issues.push(format!("{} collection(s) not synchronized", unsynced));
                    }
                }
                Err(e) => issues.push(format!("Could not list collections: {:#}", e)),
            }
        }

        health.status = if metadata_status != ProbeStatus::Healthy {
            OverallStatus::Unhealthy
        } else if issues.is_empty() {
            OverallStatus::Healthy
        } else {
            OverallStatus::Degraded
        };
        health.issues = issues;
        health
    }
}
