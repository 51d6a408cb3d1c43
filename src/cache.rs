//! Inactive-sensor gating cache.
//!
//! Readers take a lock-free snapshot of the current set (`arc_swap`), so the
//! router never blocks on the watcher or on other readers. Writes copy the set
//! and swap it in (read-copy-update); a reader sees either the old or the new
//! set, never a partial one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How `is_inactive` answers before the first snapshot is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingPolicy {
    /// Treat every sensor as active until loaded.
    #[default]
    FailOpen,
    /// Treat every sensor as inactive until loaded.
    FailClosed,
}

/// Concurrent membership set of sensor ids flagged inactive.
///
/// Mutated only by the change-feed watcher; read by any number of routing
/// tasks.
#[derive(Debug)]
pub struct InactiveEntityCache {
    inactive: ArcSwap<HashSet<String>>,
    loaded: AtomicBool,
    policy: GatingPolicy,
}

impl InactiveEntityCache {
    #[must_use]
    pub fn new(policy: GatingPolicy) -> Self {
        Self {
            inactive: ArcSwap::from_pointee(HashSet::new()),
            loaded: AtomicBool::new(false),
            policy,
        }
    }

    /// Returns true if messages from `sensor_id` should be dropped.
    pub fn is_inactive(&self, sensor_id: &str) -> bool {
        if !self.loaded.load(Ordering::Acquire) {
            return self.policy == GatingPolicy::FailClosed;
        }
        self.inactive.load().contains(sensor_id)
    }

    /// Atomically replace the whole set with a fresh snapshot.
    pub fn load<I>(&self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let set: HashSet<String> = ids.into_iter().collect();
        let count = set.len();
        self.inactive.store(Arc::new(set));
        self.loaded.store(true, Ordering::Release);
        info!(inactive = count, "loaded inactive sensors");
    }

    /// Mark a sensor inactive.
    pub fn add(&self, sensor_id: &str) {
        self.inactive.rcu(|current| {
            let mut next = HashSet::clone(current);
            next.insert(sensor_id.to_string());
            next
        });
        info!(sensor_id, "sensor is now inactive");
    }

    /// Mark a sensor active again.
    pub fn remove(&self, sensor_id: &str) {
        self.inactive.rcu(|current| {
            let mut next = HashSet::clone(current);
            next.remove(sensor_id);
            next
        });
        info!(sensor_id, "sensor is now active");
    }

    /// Empty the set and return to the unloaded state.
    pub fn clear(&self) {
        self.loaded.store(false, Ordering::Release);
        self.inactive.store(Arc::new(HashSet::new()));
        debug!("cleared inactive sensors");
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inactive.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inactive.load().is_empty()
    }

    pub const fn policy(&self) -> GatingPolicy {
        self.policy
    }

    /// Point-in-time copy of the inactive set.
    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        self.inactive.load_full()
    }
}

impl Default for InactiveEntityCache {
    fn default() -> Self {
        Self::new(GatingPolicy::default())
    }
}
