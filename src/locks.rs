//! Per-collection single-flight table.
//!
//! At most one sync-state-mutating operation (create, sync, delete) may be
//! in flight for a collection id. [`SyncLocks::try_acquire`] either hands
//! out a [`FlightGuard`] or reports that the id is busy; it never waits.
//!
//! The table only holds ids that are currently in flight. Dropping the
//! guard evicts the entry, so the map is bounded by the number of
//! concurrent operations and never retains ids of deleted collections.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default, Clone)]
pub struct SyncLocks {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SyncLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id`, or returns [`SyncError::SyncInProgress`] if it is taken.
    pub fn try_acquire(&self, id: &str) -> SyncResult<FlightGuard> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(id.to_string()) {
            return Err(SyncError::SyncInProgress(id.to_string()));
        }
        Ok(FlightGuard {
            id: id.to_string(),
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }

    /// Number of ids currently held.
    pub fn len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its id when dropped, including on early return or cancellation.
#[derive(Debug)]
pub struct FlightGuard {
    id: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl FlightGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.id);
    }
}
