//! Inbound side: feeds change batches delivered by the transport into the applier

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::SyncCoordinator;

/// Spawn the task applying remote change batches for `coordinator`.
///
/// Runs until the transport's event channel closes. A failed commit is
/// logged and the next batch is processed normally.
pub fn spawn_remote_listener(coordinator: SyncCoordinator) -> JoinHandle<()> {
    let mut batches = coordinator.inner.transport.subscribe();
    let runtime = coordinator.inner.runtime.clone();

    runtime.spawn(async move {
        info!("Remote change listener started");
        loop {
            match batches.recv().await {
                Ok(batch) => {
                    if let Err(e) = coordinator.apply_remote(&batch) {
                        warn!(count = batch.len(), error = %e, "Failed to apply remote changes");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Remote listener lagged, batches were dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Remote change listener stopped");
    })
}
