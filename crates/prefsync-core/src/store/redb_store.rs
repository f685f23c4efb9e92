//! Persistent preference store using redb.
//!
//! Each named store is one redb table mapping preference key to the JSON
//! encoding of its [`PrefValue`]. A commit is one write transaction, so a
//! batch of remote edits lands all-or-nothing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::broadcast;
use tracing::debug;

use super::{LocalStore, StoreEdit, StoreEdits, CHANGE_CHANNEL_CAPACITY};
use crate::error::SyncError;
use crate::types::PrefValue;

/// Table used when no store name is configured
pub const DEFAULT_TABLE: &str = "preferences";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
    table: String,
    change_tx: broadcast::Sender<String>,
}

impl RedbStore {
    /// Open (or create) the default preference store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        Self::open_named(path, None)
    }

    /// Open (or create) a named preference store at `path`.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create the store's table
    pub fn open_named(path: impl AsRef<Path>, name: Option<&str>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let table = name.unwrap_or(DEFAULT_TABLE).to_string();

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(Self::definition(&table))?;
        }
        write_txn.commit()?;

        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            table,
            change_tx,
        })
    }

    /// Name of the table backing this store
    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn definition(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(name)
    }

    fn decode(bytes: &[u8]) -> Result<PrefValue, SyncError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl LocalStore for RedbStore {
    fn get_all(&self) -> Result<BTreeMap<String, PrefValue>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(Self::definition(&self.table))?;

        let mut values = BTreeMap::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            values.insert(key.value().to_string(), Self::decode(value.value())?);
        }
        Ok(values)
    }

    fn get(&self, key: &str) -> Result<Option<PrefValue>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(Self::definition(&self.table))?;

        match table.get(key)? {
            Some(v) => Ok(Some(Self::decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn commit(&self, edits: StoreEdits) -> Result<(), SyncError> {
        if edits.is_empty() {
            return Ok(());
        }

        let mut changed: Vec<String> = Vec::new();
        {
            let db = self.db.read();
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(Self::definition(&self.table))?;
                for edit in edits {
                    match edit {
                        StoreEdit::Put(key, value) => {
                            let data = serde_json::to_vec(&value)?;
                            let previous =
                                table.get(key.as_str())?.map(|guard| guard.value().to_vec());
                            if previous.as_deref() == Some(data.as_slice()) {
                                continue;
                            }
                            table.insert(key.as_str(), data.as_slice())?;
                            if !changed.contains(&key) {
                                changed.push(key);
                            }
                        }
                        StoreEdit::Remove(key) => {
                            let removed = table.remove(key.as_str())?.is_some();
                            if removed && !changed.contains(&key) {
                                changed.push(key);
                            }
                        }
                    }
                }
            }
            write_txn.commit()?;
        }

        debug!(table = %self.table, changed = changed.len(), "Redb store commit");
        for key in changed {
            let _ = self.change_tx.send(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("prefs.redb");

        {
            let store = RedbStore::open(&path).unwrap();
            let mut edits = StoreEdits::new();
            edits
                .put("dark_mode", PrefValue::Bool(true))
                .put("ratio", PrefValue::Float(0.75))
                .put("count", PrefValue::Int(-3))
                .put("epoch", PrefValue::Long(1_700_000_000_000))
                .put("name", PrefValue::from("wrist"))
                .put(
                    "tags",
                    PrefValue::StringSet(BTreeSet::from(["a".to_string(), "b".to_string()])),
                );
            store.commit(edits).unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all.get("ratio"), Some(&PrefValue::Float(0.75)));
        assert_eq!(all.get("count"), Some(&PrefValue::Int(-3)));
        assert_eq!(store.get("epoch").unwrap(), Some(PrefValue::Long(1_700_000_000_000)));
    }

    #[test]
    fn test_non_finite_floats_stay_readable() {
        let temp = TempDir::new().unwrap();
        let store = RedbStore::open(temp.path().join("prefs.redb")).unwrap();
        let mut rx = store.subscribe();

        let mut edits = StoreEdits::new();
        edits
            .put("ratio", PrefValue::Float(f64::INFINITY))
            .put("floor", PrefValue::Float(f64::NEG_INFINITY))
            .put("unknown", PrefValue::Float(f64::NAN))
            .put("zero", PrefValue::Float(-0.0));
        store.commit(edits).unwrap();
        while rx.try_recv().is_ok() {}

        let all = store.get_all().unwrap();
        assert_eq!(all.get("ratio"), Some(&PrefValue::Float(f64::INFINITY)));
        assert_eq!(all.get("floor"), Some(&PrefValue::Float(f64::NEG_INFINITY)));
        assert_eq!(all.get("unknown"), Some(&PrefValue::Float(f64::NAN)));
        assert_eq!(all.get("zero"), Some(&PrefValue::Float(-0.0)));

        store.put("unknown", PrefValue::Float(f64::NAN)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_named_stores_are_isolated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("prefs.redb");

        let default = RedbStore::open(&path).unwrap();
        default.put("a", PrefValue::Int(1)).unwrap();
        drop(default);

        let named = RedbStore::open_named(&path, Some("watchface")).unwrap();
        assert_eq!(named.table_name(), "watchface");
        assert!(named.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_commit_notifies_only_changes() {
        let temp = TempDir::new().unwrap();
        let store = RedbStore::open(temp.path().join("prefs.redb")).unwrap();
        let mut rx = store.subscribe();

        store.put("theme", PrefValue::from("dark")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "theme");

        store.put("theme", PrefValue::from("dark")).unwrap();
        store.remove("absent").unwrap();
        assert!(rx.try_recv().is_err());

        store.remove("theme").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "theme");
    }
}
