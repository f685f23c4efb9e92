//! Merging remote changes into the local store.
//!
//! Every inbound batch becomes one [`StoreEdits`] commit. Checks for existence
//! and equality run against a working copy of the store that already reflects
//! the edits made earlier in the same batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::events::ApplyReport;
use crate::codec::Payload;
use crate::error::SyncResult;
use crate::store::{LocalStore, StoreEdits};
use crate::transport::{ChangeEvent, ChangeKind, LocalNodeId, RemoteItem};
use crate::types::{is_under_root, key_for_path, PrefValue, KEY_TIMESTAMP};

/// How much the merge knows about local state
enum Prior<'a> {
    /// Live delta: short-circuit against the current values
    Known(&'a mut BTreeMap<String, PrefValue>),
    /// Initial or forced load: write everything
    Unknown,
}

/// Applies remote events and pulled items to the local store
pub struct RemoteChangeApplier {
    store: Arc<dyn LocalStore>,
    local_id: LocalNodeId,
    settings_path: String,
}

impl RemoteChangeApplier {
    pub fn new(
        store: Arc<dyn LocalStore>,
        local_id: LocalNodeId,
        settings_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            local_id,
            settings_path: settings_path.into(),
        }
    }

    /// Merge one delivered batch of change events.
    ///
    /// Self-originated events are discarded. An explicit delete and a changed
    /// event with an empty payload both remove the addressed key, if present.
    /// A payload whose entries were all malformed is not empty and deletes nothing.
    pub fn apply_events(&self, events: &[ChangeEvent]) -> SyncResult<ApplyReport> {
        let mut current = self.store.get_all()?;
        let mut edits = StoreEdits::new();
        let mut report = ApplyReport::default();

        for event in events {
            report.events += 1;

            if self.local_id.is_local(&event.origin_node_id) {
                trace!(path = %event.path, "Discarding self-originated event");
                report.echoes += 1;
                continue;
            }
            if !is_under_root(&self.settings_path, &event.path) {
                report.ignored += 1;
                continue;
            }

            // Some transports report a deletion as an empty update
            if event.kind == ChangeKind::Deleted || event.is_empty_update() {
                self.delete_item(
                    &event.path,
                    Prior::Known(&mut current),
                    &mut edits,
                    &mut report,
                );
            } else {
                self.save_payload(
                    &event.payload,
                    Prior::Known(&mut current),
                    &mut edits,
                    &mut report,
                );
            }
        }

        self.commit(edits, &report)?;
        Ok(report)
    }

    /// Merge the result of a full pull.
    ///
    /// Items are applied in reverse delivery order with no comparison against
    /// existing values, and regardless of which node wrote them.
    pub fn apply_items(&self, items: &[RemoteItem]) -> SyncResult<ApplyReport> {
        let mut edits = StoreEdits::new();
        let mut report = ApplyReport::default();

        for item in items.iter().rev() {
            report.events += 1;
            if !is_under_root(&self.settings_path, &item.path) {
                report.ignored += 1;
                continue;
            }

            if item.payload.is_empty() && item.skipped == 0 {
                self.delete_item(&item.path, Prior::Unknown, &mut edits, &mut report);
            } else {
                self.save_payload(&item.payload, Prior::Unknown, &mut edits, &mut report);
            }
        }

        self.commit(edits, &report)?;
        Ok(report)
    }

    fn delete_item(
        &self,
        path: &str,
        prior: Prior<'_>,
        edits: &mut StoreEdits,
        report: &mut ApplyReport,
    ) {
        let Some(key) = key_for_path(&self.settings_path, path) else {
            debug!(%path, "Delete names no single key, ignoring");
            report.ignored += 1;
            return;
        };
        remove_key(key, prior, edits, report);
    }

    fn save_payload(
        &self,
        payload: &Payload,
        mut prior: Prior<'_>,
        edits: &mut StoreEdits,
        report: &mut ApplyReport,
    ) {
        for (key, value) in payload {
            if key == KEY_TIMESTAMP {
                continue;
            }

            let prior = match &mut prior {
                Prior::Known(current) => Prior::Known(&mut **current),
                Prior::Unknown => Prior::Unknown,
            };

            let Some(value) = value else {
                remove_key(key, prior, edits, report);
                continue;
            };

            match prior {
                Prior::Known(current) => {
                    if current.get(key) == Some(value) {
                        report.unchanged += 1;
                        continue;
                    }
                    current.insert(key.clone(), value.clone());
                }
                Prior::Unknown => {}
            }

            trace!(%key, kind = %value.kind(), "Writing remote value");
            edits.put(key.clone(), value.clone());
            report.writes += 1;
        }
    }

    fn commit(&self, edits: StoreEdits, report: &ApplyReport) -> SyncResult<()> {
        if edits.is_empty() {
            return Ok(());
        }
        debug!(
            writes = report.writes,
            deletes = report.deletes,
            "Committing remote changes"
        );
        self.store.commit(edits)
    }
}

/// Remove `key`, only if present when local state is known
fn remove_key(key: &str, prior: Prior<'_>, edits: &mut StoreEdits, report: &mut ApplyReport) {
    if let Prior::Known(current) = prior {
        if current.remove(key).is_none() {
            return;
        }
    }
    edits.remove(key);
    report.deletes += 1;
}
