//! Bulk resynchronization: full pull (remote → local) and full push
//! (local → remote, with pruning of stale remote items).

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::{FlushOutcome, SyncCoordinator};
use super::events::SyncEvent;
use crate::error::SyncResult;
use crate::types::{PrefValue, KEY_SYNC_DONE};

impl SyncCoordinator {
    /// Pull every item under the settings root into the local store.
    ///
    /// A previously requested pull is cancelled and its results never applied.
    /// While not connected the pull is latched and runs on the next connect.
    /// [`KEY_SYNC_DONE`] is written right away; it records that a pull was
    /// requested, not that one completed.
    pub fn resync_local(&self) -> SyncResult<()> {
        if self.prepare_pull() {
            self.start_pull();
        } else {
            debug!("Not connected, latching full pull");
            self.ensure_connected();
        }

        self.store().put(KEY_SYNC_DONE, PrefValue::Bool(true))
    }

    /// Push every local value accepted by the filter, pruning remote items
    /// whose key is not part of the push.
    ///
    /// Returns `Ok(None)` without touching the transport when no filter is
    /// installed: pushing unfiltered would publish every local key.
    pub async fn resync_remote(&self) -> SyncResult<Option<FlushOutcome>> {
        let Some(filter) = self.filter() else {
            debug!("No sync filter installed, declining bulk push");
            return Ok(None);
        };

        let mut values = self.store().get_all()?;
        values.retain(|key, _| filter(key));
        let count = self.enqueue_bulk(values);
        info!(count, "Starting bulk push");

        self.flush().await.map(Some)
    }

    /// Issue a fresh listing and merge it once it arrives, unless superseded
    pub(crate) fn start_pull(&self) {
        let token = CancellationToken::new();
        self.replace_pull(token.clone());

        let this = self.clone();
        self.inner.runtime.spawn(async move {
            this.run_pull(token).await;
        });
    }

    async fn run_pull(&self, token: CancellationToken) {
        let root = self.inner.config.settings_path.clone();
        debug!(path = %root, "Requesting full pull");

        let listing = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Full pull superseded before the listing arrived");
                return;
            }
            result = self.inner.transport.list_items(&root) => result,
        };
        if token.is_cancelled() {
            return;
        }

        let items = match listing {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Full pull failed, local store left unchanged");
                self.emit(SyncEvent::PullFailed {
                    message: e.to_string(),
                });
                return;
            }
        };

        match self.inner.applier.apply_items(&items) {
            Ok(report) => {
                info!(
                    count = items.len(),
                    writes = report.writes,
                    deletes = report.deletes,
                    "Full pull merged"
                );
                self.emit(SyncEvent::PullCompleted {
                    items: items.len(),
                    report,
                });
            }
            Err(e) => {
                warn!(error = %e, "Merging full pull failed");
                self.emit(SyncEvent::PullFailed {
                    message: e.to_string(),
                });
            }
        }
    }
}
