//! Wiring of stores and components for one process.
//!
//! [`Engine::open`] connects both SQLite databases named in the config and
//! builds the coordinator, scanner and health aggregator over them.
//! [`Engine::from_stores`] does the same for any pair of store
//! implementations (the in-memory ones in tests).

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::coordinator::{CoordinatorOptions, SyncCoordinator};
use crate::db;
use crate::health::HealthAggregator;
use crate::reconcile::{ReconcileOptions, ReconciliationScanner};
use crate::store::sqlite::SqliteMetadataStore;
use crate::store::MetadataStore;
use crate::vector::sqlite::SqliteVectorIndex;
use crate::vector::VectorIndexClient;

pub struct Engine {
    pub coordinator: Arc<SyncCoordinator>,
    pub scanner: ReconciliationScanner,
    pub health: HealthAggregator,
    pools: Vec<SqlitePool>,
}

impl Engine {
    /// Opens the SQLite-backed stores. Run `csync init` first.
    pub async fn open(config: &Config) -> Result<Self> {
        let metadata_pool = db::connect_metadata(config).await?;
        let vector_pool = db::connect_vectors(config).await?;

        let metadata = Arc::new(SqliteMetadataStore::new(metadata_pool.clone()));
        let vectors = Arc::new(SqliteVectorIndex::new(vector_pool.clone()));
        let mut engine = Self::from_stores(metadata, vectors, config);
        engine.pools = vec![metadata_pool, vector_pool];
        Ok(engine)
    }

    pub fn from_stores(
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorIndexClient>,
        config: &Config,
    ) -> Self {
        let coordinator = Arc::new(SyncCoordinator::new(
            metadata,
            vectors,
            CoordinatorOptions::from_config(config),
        ));
        let scanner =
            ReconciliationScanner::new(coordinator.clone(), ReconcileOptions::from_config(config));
        let health = HealthAggregator::new(coordinator.clone());
        Self {
            coordinator,
            scanner,
            health,
            pools: Vec::new(),
        }
    }

    /// Closes any database pools the engine opened.
    pub async fn close(self) {
        for pool in self.pools {
            pool.close().await;
        }
    }
}
