//! In-memory [`VectorIndexClient`] for tests.
//!
//! Containers live in a `HashMap` behind `std::sync::RwLock`. A set of
//! fault switches lets tests simulate the failure modes the engine has to
//! survive: an unreachable index, container creation or drop failing,
//! individual vectors being rejected, and slow calls that exceed the RPC
//! deadline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{ContainerStats, UpsertReport, VectorIndexClient, VectorRecord};

struct Container {
    dims: usize,
    vectors: BTreeMap<String, VectorRecord>,
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    fail_ensure: bool,
    fail_drop: bool,
    fail_stat: bool,
    rejected_ids: HashSet<String>,
    delay: Option<Duration>,
}

pub struct InMemoryVectorIndex {
    containers: RwLock<HashMap<String, Container>>,
    faults: RwLock<Faults>,
    ensure_calls: AtomicU64,
    drop_calls: AtomicU64,
    upsert_calls: AtomicU64,
    slow_ensure: AtomicBool,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
            ensure_calls: AtomicU64::new(0),
            drop_calls: AtomicU64::new(0),
            upsert_calls: AtomicU64::new(0),
            slow_ensure: AtomicBool::new(false),
        }
    }

    /// Every call fails while set.
    pub fn set_unavailable(&self, on: bool) {
        self.faults.write().unwrap().unavailable = on;
    }

    pub fn set_fail_ensure(&self, on: bool) {
        self.faults.write().unwrap().fail_ensure = on;
    }

    pub fn set_fail_drop(&self, on: bool) {
        self.faults.write().unwrap().fail_drop = on;
    }

    pub fn set_fail_stat(&self, on: bool) {
        self.faults.write().unwrap().fail_stat = on;
    }

    /// Upserts of these ids are reported as item failures.
    pub fn reject_ids<I: IntoIterator<Item = String>>(&self, ids: I) {
        self.faults.write().unwrap().rejected_ids = ids.into_iter().collect();
    }

    /// Delay applied to `ensure_container` (all calls) or to every call.
    pub fn set_delay(&self, delay: Option<Duration>, ensure_only: bool) {
        self.faults.write().unwrap().delay = delay;
        self.slow_ensure.store(ensure_only, Ordering::SeqCst);
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.containers.read().unwrap().contains_key(name)
    }

    pub fn vector_ids(&self, name: &str) -> Vec<String> {
        self.containers
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.vectors.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ensure_calls(&self) -> u64 {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub fn drop_calls(&self) -> u64 {
        self.drop_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    async fn gate(&self, is_ensure: bool) -> Result<()> {
        let delay = {
            let faults = self.faults.read().unwrap();
            if faults.unavailable {
                bail!("vector index is unreachable");
            }
            let ensure_only = self.slow_ensure.load(Ordering::SeqCst);
            faults.delay.filter(|_| is_ensure || !ensure_only)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndexClient for InMemoryVectorIndex {
    async fn ensure_container(&self, name: &str, dims: usize) -> Result<()> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(true).await?;
        if self.faults.read().unwrap().fail_ensure {
            bail!("failed to create container {}", name);
        }
        let mut containers = self.containers.write().unwrap();
        containers.entry(name.to_string()).or_insert_with(|| Container {
            dims,
            vectors: BTreeMap::new(),
        });
        Ok(())
    }

    async fn drop_container(&self, name: &str) -> Result<()> {
        self.drop_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(false).await?;
        if self.faults.read().unwrap().fail_drop {
            bail!("failed to drop container {}", name);
        }
        self.containers.write().unwrap().remove(name);
        Ok(())
    }

    async fn upsert_vectors(&self, name: &str, records: &[VectorRecord]) -> Result<UpsertReport> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.gate(false).await?;
        let rejected = self.faults.read().unwrap().rejected_ids.clone();
        let mut containers = self.containers.write().unwrap();
        let container = match containers.get_mut(name) {
            Some(c) => c,
            None => bail!("container {} not found", name),
        };

        let mut report = UpsertReport::default();
        for record in records {
            if rejected.contains(&record.id) {
                report
                    .failed
                    .push((record.id.clone(), "rejected by index".to_string()));
                continue;
            }
            if record.embedding.len() != container.dims {
                report.failed.push((
                    record.id.clone(),
                    format!(
                        "dimension mismatch: expected {}, got {}",
                        container.dims,
                        record.embedding.len()
                    ),
                ));
                continue;
            }
            container.vectors.insert(record.id.clone(), record.clone());
        }
        Ok(report)
    }

    async fn delete_vectors(&self, name: &str, ids: &[String]) -> Result<()> {
        self.gate(false).await?;
        let mut containers = self.containers.write().unwrap();
        let container = match containers.get_mut(name) {
            Some(c) => c,
            None => bail!("container {} not found", name),
        };
        for id in ids {
            container.vectors.remove(id);
        }
        Ok(())
    }

    async fn stat(&self, name: &str) -> Result<Option<ContainerStats>> {
        self.gate(false).await?;
        if self.faults.read().unwrap().fail_stat {
            bail!("failed to read stats for {}", name);
        }
        Ok(self
            .containers
            .read()
            .unwrap()
            .get(name)
            .map(|c| ContainerStats {
                name: name.to_string(),
                dims: c.dims,
                entity_count: c.vectors.len() as u64,
            }))
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        self.gate(false).await?;
        let mut names: Vec<String> = self.containers.read().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
