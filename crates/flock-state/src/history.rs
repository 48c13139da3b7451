//! Append-only distribution history.
//!
//! Each entry is a timestamped snapshot. Entries are kept oldest-first and
//! pruned by a minimum-timestamp watermark.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry<T> {
    pub timestamp: u64,
    pub snapshot: T,
}

/// Lock-protected history of snapshots of type `T`.
#[derive(Debug)]
pub struct HistoryStore<T> {
    entries: Mutex<Vec<HistoryEntry<T>>>,
}

impl<T> Default for HistoryStore<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> HistoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot stamped with the current time.
    pub fn store(&self, snapshot: T) {
        self.store_at(epoch_millis(), snapshot);
    }

    /// Append a snapshot with an explicit timestamp. Entries stay sorted.
    pub fn store_at(&self, timestamp: u64, snapshot: T) {
        let mut entries = self.lock();
        let index = entries.partition_point(|e| e.timestamp <= timestamp);
        entries.insert(index, HistoryEntry { timestamp, snapshot });
    }

    /// All entries, oldest first.
    pub fn items(&self) -> Vec<HistoryEntry<T>> {
        self.lock().clone()
    }

    pub fn latest(&self) -> Option<HistoryEntry<T>> {
        self.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop entries older than `min_timestamp`. Returns how many were removed.
    pub fn clear(&self, min_timestamp: u64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.timestamp >= min_timestamp);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, min_timestamp, "history pruned");
        }
        removed
    }

    /// Drop entries older than `retention` relative to now. The latest
    /// entry is always kept.
    pub fn prune_older_than(&self, retention: Duration) -> usize {
        let Some(latest) = self.lock().last().map(|e| e.timestamp) else {
            return 0;
        };
        let watermark = epoch_millis().saturating_sub(retention.as_millis() as u64);
        self.clear(watermark.min(latest))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HistoryEntry<T>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
