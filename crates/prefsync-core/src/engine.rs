//! PrefSync - the primary entry point for preference synchronization
//!
//! PrefSync wires a local store and a transport together:
//! - inbound remote changes are always applied while the node exists
//! - outbound local changes are queued only between `resume` and `pause`
//! - bulk resync in either direction on demand
//!
//! # Example
//!
//! ```ignore
//! use prefsync_core::{sync_filter, PrefSync, SyncConfig};
//!
//! let sync = PrefSync::new(store, transport, SyncConfig::default())?;
//! sync.set_filter(Some(sync_filter(|key| key.starts_with("map."))));
//!
//! // Start listening; pulls from peers the first time this store is synced
//! sync.resume()?;
//!
//! // Push every map.* preference, removing stale ones on the PAN
//! sync.resync_remote().await?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::store::LocalStore;
use crate::sync::{spawn_remote_listener, ChangeDetector, FlushOutcome, SyncCoordinator, SyncEvent};
use crate::transport::Transport;
use crate::types::{ConnectionState, SyncFilter, KEY_SYNC_DONE};

/// Main entry point for one syncing node
pub struct PrefSync {
    coordinator: SyncCoordinator,
    listener: JoinHandle<()>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl PrefSync {
    /// Create a node and start applying remote changes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let coordinator = SyncCoordinator::new(store, transport, config)?;
        let listener = spawn_remote_listener(coordinator.clone());
        info!(
            path = %coordinator.config().settings_path,
            debounce_ms = coordinator.config().debounce_ms,
            "PrefSync created"
        );

        Ok(Self {
            coordinator,
            listener,
            detector: Mutex::new(None),
        })
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Install or clear the filter selecting which keys sync
    pub fn set_filter(&self, filter: Option<SyncFilter>) {
        self.coordinator.set_filter(filter);
    }

    /// Start forwarding local changes.
    ///
    /// Also requests a connection so inbound changes flow, and pulls from the
    /// PAN if this store has never requested a pull.
    pub fn resume(&self) -> SyncResult<()> {
        {
            let mut detector = self.detector.lock();
            if detector.is_none() {
                *detector = Some(ChangeDetector::new(self.coordinator.clone()).spawn());
                debug!("Local change forwarding resumed");
            }
        }
        self.coordinator.connect();
        self.resync_if_needed()?;
        Ok(())
    }

    /// Stop forwarding local changes. Queued changes still flush.
    pub fn pause(&self) {
        if let Some(detector) = self.detector.lock().take() {
            detector.abort();
            debug!("Local change forwarding paused");
        }
    }

    /// Whether local changes are currently forwarded
    pub fn is_resumed(&self) -> bool {
        self.detector.lock().is_some()
    }

    /// Pull from the PAN unless a pull was already requested for this store.
    ///
    /// Returns whether a pull was started.
    pub fn resync_if_needed(&self) -> SyncResult<bool> {
        if self.coordinator.store().contains(KEY_SYNC_DONE)? {
            return Ok(false);
        }
        info!("No previous sync recorded, pulling from the PAN");
        self.coordinator.resync_local()?;
        Ok(true)
    }

    /// Pull every preference from the PAN into the local store
    pub fn resync_local(&self) -> SyncResult<()> {
        self.coordinator.resync_local()
    }

    /// Push every filtered preference to the PAN. `Ok(None)` without a filter.
    pub async fn resync_remote(&self) -> SyncResult<Option<FlushOutcome>> {
        self.coordinator.resync_remote().await
    }

    /// Flush queued changes without waiting for the debounce window
    pub async fn flush_now(&self) -> SyncResult<FlushOutcome> {
        self.coordinator.flush().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.coordinator.connection_state()
    }

    /// Tell the node its transport dropped
    pub fn connection_lost(&self) {
        self.coordinator.connection_lost();
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    /// Stop listening and send whatever is still queued, if connected
    pub async fn shutdown(self) -> SyncResult<()> {
        info!("Shutting down PrefSync");
        self.pause();

        if self.coordinator.pending_len() > 0
            && self.coordinator.connection_state() == ConnectionState::Connected
        {
            if let Err(e) = self.coordinator.flush().await {
                warn!(error = %e, "Failed to flush queued changes during shutdown");
            }
        }

        info!("PrefSync shutdown complete");
        Ok(())
    }
}

impl Drop for PrefSync {
    fn drop(&mut self) {
        self.listener.abort();
        if let Some(detector) = self.detector.get_mut().take() {
            detector.abort();
        }
    }
}
