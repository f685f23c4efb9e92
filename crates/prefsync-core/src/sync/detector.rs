//! Local change detection

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::SyncCoordinator;
use crate::error::SyncResult;
use crate::types::{PendingEntry, KEY_SYNC_DONE};

/// Forwards local store mutations to the coordinator's queue
#[derive(Clone)]
pub struct ChangeDetector {
    coordinator: SyncCoordinator,
}

impl ChangeDetector {
    pub fn new(coordinator: SyncCoordinator) -> Self {
        Self { coordinator }
    }

    /// Handle one changed key. Returns whether it was queued.
    ///
    /// Keys rejected by the installed filter are ignored, except
    /// [`KEY_SYNC_DONE`], which always syncs.
    pub fn on_change(&self, key: &str) -> SyncResult<bool> {
        if key != KEY_SYNC_DONE {
            if let Some(filter) = self.coordinator.filter() {
                if !filter(key) {
                    debug!(%key, "Filtered out local change");
                    return Ok(false);
                }
            }
        }

        let current = self.coordinator.store().get(key)?;
        self.coordinator.enqueue(key, PendingEntry::from(current));
        Ok(true)
    }

    /// Listen for store notifications until the store goes away.
    ///
    /// The subscription is taken before this returns, so no change made after
    /// the call is missed.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut changes = self.coordinator.store().subscribe();
        let runtime = self.coordinator.inner.runtime.clone();

        runtime.spawn(async move {
            info!("Change detector started");
            loop {
                match changes.recv().await {
                    Ok(key) => {
                        if let Err(e) = self.on_change(&key) {
                            warn!(%key, error = %e, "Failed to queue local change");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change detector lagged, some local changes were not queued");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Change detector stopped");
        })
    }
}
