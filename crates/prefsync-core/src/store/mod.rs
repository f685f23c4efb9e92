//! Local preference store adapters.
//!
//! The sync core never owns the host's preferences. It reads them, writes them
//! through a [`StoreEdits`] batch committed as one unit, and listens for change
//! notifications.
//!
//! Notifications carry only the key. They fire once per key whose stored value
//! actually changed during a commit: writing an equal value or removing an
//! absent key is silent.

mod memory;
mod redb_store;

pub use self::memory::MemoryStore;
pub use self::redb_store::RedbStore;

use std::collections::BTreeMap;

use tokio::sync::broadcast;

use crate::error::SyncResult;
use crate::types::PrefValue;

/// Capacity of the per-store change notification channel
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// A single pending edit
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEdit {
    Put(String, PrefValue),
    Remove(String),
}

impl StoreEdit {
    pub fn key(&self) -> &str {
        match self {
            StoreEdit::Put(key, _) | StoreEdit::Remove(key) => key,
        }
    }
}

/// An ordered set of edits committed atomically.
///
/// Later edits to the same key win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreEdits {
    ops: Vec<StoreEdit>,
}

impl StoreEdits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: PrefValue) -> &mut Self {
        self.ops.push(StoreEdit::Put(key.into(), value));
        self
    }

    pub fn remove(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(StoreEdit::Remove(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoreEdit> {
        self.ops.iter()
    }
}

impl IntoIterator for StoreEdits {
    type Item = StoreEdit;
    type IntoIter = std::vec::IntoIter<StoreEdit>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Access to the host's key-value preference store
pub trait LocalStore: Send + Sync + 'static {
    /// Snapshot of every stored preference
    fn get_all(&self) -> SyncResult<BTreeMap<String, PrefValue>>;

    /// Commit a batch of edits as one durable unit
    fn commit(&self, edits: StoreEdits) -> SyncResult<()>;

    /// Subscribe to keys changed by subsequent commits
    fn subscribe(&self) -> broadcast::Receiver<String>;

    fn get(&self, key: &str) -> SyncResult<Option<PrefValue>> {
        Ok(self.get_all()?.remove(key))
    }

    fn contains(&self, key: &str) -> SyncResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Convenience single-key write
    fn put(&self, key: &str, value: PrefValue) -> SyncResult<()> {
        let mut edits = StoreEdits::new();
        edits.put(key, value);
        self.commit(edits)
    }

    /// Convenience single-key removal
    fn remove(&self, key: &str) -> SyncResult<()> {
        let mut edits = StoreEdits::new();
        edits.remove(key);
        self.commit(edits)
    }
}

/// Apply edits to an in-memory map, returning the keys whose value changed.
pub(crate) fn apply_edits(
    map: &mut BTreeMap<String, PrefValue>,
    edits: StoreEdits,
) -> Vec<String> {
    let mut changed: Vec<String> = Vec::new();
    for edit in edits {
        let key = match edit {
            StoreEdit::Put(key, value) => {
                if map.get(&key) == Some(&value) {
                    continue;
                }
                map.insert(key.clone(), value);
                key
            }
            StoreEdit::Remove(key) => {
                if map.remove(&key).is_none() {
                    continue;
                }
                key
            }
        };
        if !changed.contains(&key) {
            changed.push(key);
        }
    }
    changed
}
