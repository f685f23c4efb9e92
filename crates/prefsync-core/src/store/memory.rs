//! In-memory preference store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::{apply_edits, LocalStore, StoreEdits, CHANGE_CHANNEL_CAPACITY};
use crate::error::{SyncError, SyncResult};
use crate::types::PrefValue;

/// A preference store held entirely in memory.
///
/// Used by tests and the simulation; it also counts commits so callers can
/// assert that a merge produced no store writes at all.
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, PrefValue>>,
    change_tx: broadcast::Sender<String>,
    commits: AtomicUsize,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_values(BTreeMap::new())
    }

    /// Create a store pre-populated with `values` (no notifications are sent)
    pub fn with_values(values: BTreeMap<String, PrefValue>) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: RwLock::new(values),
            change_tx,
            commits: AtomicUsize::new(0),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Number of non-empty commits applied so far
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make subsequent commits fail with a store error
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn get_all(&self) -> SyncResult<BTreeMap<String, PrefValue>> {
        Ok(self.values.read().clone())
    }

    fn get(&self, key: &str) -> SyncResult<Option<PrefValue>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn commit(&self, edits: StoreEdits) -> SyncResult<()> {
        if edits.is_empty() {
            return Ok(());
        }
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SyncError::Store("commit rejected".to_string()));
        }

        let changed = {
            let mut values = self.values.write();
            apply_edits(&mut values, edits)
        };
        self.commits.fetch_add(1, Ordering::SeqCst);

        debug!(changed = changed.len(), "Memory store commit");
        for key in changed {
            // No subscribers is fine
            let _ = self.change_tx.send(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.change_tx.subscribe()
    }
}
