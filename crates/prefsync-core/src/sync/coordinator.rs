//! Sync coordinator: connection state machine and debounced write batcher
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncCoordinator (cheap to clone, one per node)                 │
//! │  ├── state: Mutex<CoordinatorState>                             │
//! │  │   ├── queue: key → PendingEntry (last write wins)            │
//! │  │   ├── connection: Disconnected | Connecting | Connected      │
//! │  │   ├── pending_action: None | FlushQueue | FullPull           │
//! │  │   └── debounce / pull: CancellationTokens                    │
//! │  ├── applier: RemoteChangeApplier                               │
//! │  └── event_tx: broadcast::Sender<SyncEvent>                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The state lock is only held for bookkeeping. Every transport call happens
//! after the guard is dropped, on a task spawned onto the runtime captured at
//! construction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::applier::RemoteChangeApplier;
use super::events::{ApplyReport, SyncEvent};
use crate::codec::Payload;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use crate::transport::{ChangeEvent, PutRequest, Transport};
use crate::types::{
    is_under_root, key_for_path, key_path, ConnectionState, PendingAction, PendingEntry,
    PrefValue, SyncFilter, KEY_TIMESTAMP,
};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of a flush request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Not connected; the flush is latched until the next connect
    Deferred,
    /// The batch was handed to the transport
    Flushed { keys: Vec<String>, pruned: usize },
}

#[derive(Default)]
struct CoordinatorState {
    queue: HashMap<String, PendingEntry>,
    connection: ConnectionState,
    pending_action: PendingAction,
    /// The next flush is a bulk push and prunes stale remote items first
    prune_first: bool,
    debounce: Option<CancellationToken>,
    pull: Option<CancellationToken>,
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) applier: RemoteChangeApplier,
    pub(crate) config: SyncConfig,
    filter: RwLock<Option<SyncFilter>>,
    state: Mutex<CoordinatorState>,
    event_tx: broadcast::Sender<SyncEvent>,
    pub(crate) runtime: Handle,
    started: Instant,
}

/// Owns the pending-write queue and gates outbound traffic on the connection state
#[derive(Clone)]
pub struct SyncCoordinator {
    pub(crate) inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Create a coordinator bound to the current tokio runtime.
    ///
    /// Fails if called outside a runtime or with an invalid config.
    pub fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::Config(format!("no tokio runtime available: {}", e)))?;

        let applier = RemoteChangeApplier::new(
            store.clone(),
            transport.local_node_id(),
            config.settings_path.clone(),
        );
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                transport,
                applier,
                config,
                filter: RwLock::new(None),
                state: Mutex::new(CoordinatorState::default()),
                event_tx,
                runtime,
                started: Instant::now(),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.inner.store
    }

    /// The installed sync filter, if any
    pub fn filter(&self) -> Option<SyncFilter> {
        self.inner.filter.read().clone()
    }

    pub fn set_filter(&self, filter: Option<SyncFilter>) {
        *self.inner.filter.write() = filter;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// Number of queued, not yet flushed keys
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// The action latched while not connected
    pub fn pending_action(&self) -> PendingAction {
        self.inner.state.lock().pending_action
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Request a transport connection unless one is up or in progress
    pub fn connect(&self) {
        self.ensure_connected();
    }

    /// Queue a local change and restart the debounce timer.
    ///
    /// Bursts of changes within the debounce window collapse into one flush,
    /// with the last entry per key winning.
    pub fn enqueue(&self, key: impl Into<String>, entry: PendingEntry) {
        let key = key.into();
        let token = CancellationToken::new();

        let queued = {
            let mut state = self.inner.state.lock();
            state.queue.insert(key.clone(), entry);
            if let Some(previous) = state.debounce.replace(token.clone()) {
                previous.cancel();
            }
            state.queue.len()
        };
        debug!(%key, queued, "Queued local change");

        let this = self.clone();
        let delay = self.inner.config.debounce();
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = this.flush().await {
                        warn!(error = %e, "Debounced flush failed");
                    }
                }
            }
        });

        self.ensure_connected();
    }

    /// Flush the pending queue.
    ///
    /// While not connected this latches [`PendingAction::FlushQueue`] and makes
    /// no network call. Otherwise the queue is taken atomically, so writes
    /// arriving during dispatch batch into the next round.
    pub async fn flush(&self) -> SyncResult<FlushOutcome> {
        let taken = {
            let mut state = self.inner.state.lock();
            if state.connection != ConnectionState::Connected {
                state.pending_action = state.pending_action.escalate(PendingAction::FlushQueue);
                Err(state.pending_action)
            } else {
                if let Some(timer) = state.debounce.take() {
                    timer.cancel();
                }
                Ok((
                    std::mem::take(&mut state.queue),
                    std::mem::take(&mut state.prune_first),
                ))
            }
        };

        let (batch, bulk) = match taken {
            Ok(taken) => taken,
            Err(pending) => {
                debug!(?pending, "Not connected, deferring flush");
                self.emit(SyncEvent::FlushDeferred { pending });
                self.ensure_connected();
                return Ok(FlushOutcome::Deferred);
            }
        };

        let pruned = if bulk {
            let keep: HashSet<&str> = batch.keys().map(String::as_str).collect();
            match self.prune_remote(&keep).await {
                Ok(pruned) => pruned,
                Err(e) => {
                    warn!(error = %e, "Pruning stale remote items failed");
                    0
                }
            }
        } else {
            0
        };

        let mut keys: Vec<String> = batch.keys().cloned().collect();
        keys.sort();
        if !batch.is_empty() {
            self.dispatch(batch, bulk).await?;
        }

        if bulk {
            info!(count = keys.len(), pruned, "Bulk push sent");
        } else {
            debug!(count = keys.len(), "Batch sent");
        }
        self.emit(SyncEvent::Flushed {
            keys: keys.clone(),
            pruned,
        });
        Ok(FlushOutcome::Flushed { keys, pruned })
    }

    /// Record that the transport dropped the connection.
    ///
    /// Nothing is retried now; the next enqueue or resync reconnects.
    pub fn connection_lost(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            let changed = state.connection != ConnectionState::Disconnected;
            state.connection = ConnectionState::Disconnected;
            changed
        };
        if changed {
            info!("Transport connection lost");
            self.emit(SyncEvent::ConnectionChanged {
                state: ConnectionState::Disconnected,
            });
        }
    }

    /// Merge one batch of remote change events into the local store
    pub fn apply_remote(&self, batch: &[ChangeEvent]) -> SyncResult<ApplyReport> {
        let report = self.inner.applier.apply_events(batch)?;
        if report.changed_store() {
            debug!(
                writes = report.writes,
                deletes = report.deletes,
                "Applied remote changes"
            );
        }
        self.emit(SyncEvent::RemoteApplied {
            report: report.clone(),
        });
        Ok(report)
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.inner.event_tx.send(event);
    }

    /// Queue several entries at once under one lock acquisition
    pub(crate) fn enqueue_bulk(&self, entries: BTreeMap<String, PrefValue>) -> usize {
        let mut state = self.inner.state.lock();
        let count = entries.len();
        for (key, value) in entries {
            state.queue.insert(key, PendingEntry::Put(value));
        }
        state.prune_first = true;
        if let Some(timer) = state.debounce.take() {
            timer.cancel();
        }
        count
    }

    /// Cancel any outstanding pull. Returns whether the transport is connected;
    /// if not, a full pull is latched instead.
    pub(crate) fn prepare_pull(&self) -> bool {
        let mut state = self.inner.state.lock();
        if let Some(previous) = state.pull.take() {
            previous.cancel();
        }
        if state.connection == ConnectionState::Connected {
            true
        } else {
            state.pending_action = state.pending_action.escalate(PendingAction::FullPull);
            false
        }
    }

    /// Install `token` as the current pull, cancelling any previous one
    pub(crate) fn replace_pull(&self, token: CancellationToken) {
        if let Some(previous) = self.inner.state.lock().pull.replace(token) {
            previous.cancel();
        }
    }

    pub(crate) fn ensure_connected(&self) {
        let start = {
            let mut state = self.inner.state.lock();
            if state.connection == ConnectionState::Disconnected {
                state.connection = ConnectionState::Connecting;
                true
            } else {
                false
            }
        };
        if !start {
            return;
        }

        debug!("Requesting transport connection");
        self.emit(SyncEvent::ConnectionChanged {
            state: ConnectionState::Connecting,
        });

        let this = self.clone();
        self.inner.runtime.spawn(async move {
            let result = this.inner.transport.connect().await;
            this.on_connect_result(result).await;
        });
    }

    async fn on_connect_result(&self, result: SyncResult<()>) {
        if let Err(e) = result {
            self.inner.state.lock().connection = ConnectionState::Disconnected;
            warn!(error = %e, "Transport connect failed");
            self.emit(SyncEvent::ConnectionChanged {
                state: ConnectionState::Disconnected,
            });
            return;
        }

        let (action, writes_waiting) = {
            let mut state = self.inner.state.lock();
            state.connection = ConnectionState::Connected;
            let action = std::mem::take(&mut state.pending_action);
            (action, !state.queue.is_empty() || state.prune_first)
        };
        info!(
            node_id = ?self.inner.transport.local_node_id().get(),
            ?action,
            "Transport connected"
        );
        self.emit(SyncEvent::ConnectionChanged {
            state: ConnectionState::Connected,
        });

        let flush = match action {
            PendingAction::None => false,
            PendingAction::FlushQueue => true,
            PendingAction::FullPull => {
                self.start_pull();
                // The pull preempted a latched flush; queued writes still go out
                writes_waiting
            }
        };
        if flush {
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Flush after connect failed");
            }
        }
    }

    /// Send one batch. A single key goes to its own path; several keys share
    /// one item at the settings root. A lone tombstone is an empty put followed
    /// by a delete of its path, and never carries the bulk tag.
    async fn dispatch(&self, batch: HashMap<String, PendingEntry>, bulk: bool) -> SyncResult<()> {
        let root = &self.inner.config.settings_path;
        let urgent = self.inner.config.urgent;

        let mut payload = Payload::new();
        if bulk {
            payload.insert(KEY_TIMESTAMP.to_string(), Some(self.bulk_timestamp()));
        }

        if batch.len() == 1 {
            if let Some((key, entry)) = batch.into_iter().next() {
                let path = key_path(root, &key);
                match entry {
                    PendingEntry::Put(value) => {
                        payload.insert(key, Some(value));
                        self.inner
                            .transport
                            .put(PutRequest {
                                path,
                                payload,
                                urgent,
                            })
                            .await?;
                    }
                    PendingEntry::Tombstone => {
                        // The key's last value may live in a multi-key item at the
                        // root, so nothing may exist at `path` to delete. An empty
                        // put reaches every peer as a delete either way.
                        self.inner
                            .transport
                            .put(PutRequest {
                                path: path.clone(),
                                payload: Payload::new(),
                                urgent,
                            })
                            .await?;
                        self.inner.transport.delete(&path).await?;
                    }
                }
            }
            return Ok(());
        }

        for (key, entry) in batch {
            let value = match entry {
                PendingEntry::Put(value) => Some(value),
                PendingEntry::Tombstone => None,
            };
            payload.insert(key, value);
        }
        self.inner
            .transport
            .put(PutRequest {
                path: root.clone(),
                payload,
                urgent,
            })
            .await
    }

    /// Delete, one path at a time, every remote item under the settings root
    /// whose key is not being pushed.
    ///
    /// Items are removed whoever wrote them and whichever filter selected
    /// them, so pushes from disjoint filters clobber each other.
    async fn prune_remote(&self, keep: &HashSet<&str>) -> SyncResult<usize> {
        let root = &self.inner.config.settings_path;
        let items = self.inner.transport.list_items(root).await?;

        let mut seen = HashSet::new();
        let stale: Vec<String> = items
            .into_iter()
            .map(|item| item.path)
            .filter(|path| is_under_root(root, path))
            .filter(|path| match key_for_path(root, path) {
                Some(key) => !keep.contains(key),
                None => true,
            })
            .filter(|path| seen.insert(path.clone()))
            .collect();

        for path in &stale {
            debug!(%path, "Pruning stale remote item");
            self.inner.transport.delete(path).await?;
        }
        Ok(stale.len())
    }

    /// Informational tag marking an item as part of a bulk push
    fn bulk_timestamp(&self) -> PrefValue {
        let nanos = self.inner.started.elapsed().as_nanos();
        PrefValue::Long(i64::try_from(nanos).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::{MemoryPan, TransportCall};
    use std::time::Duration;

    fn coordinator(pan: &MemoryPan) -> (SyncCoordinator, Arc<crate::transport::MemoryTransport>) {
        let transport = Arc::new(pan.transport_with_id("local"));
        let coordinator = SyncCoordinator::new(
            Arc::new(MemoryStore::new()),
            transport.clone(),
            SyncConfig::default(),
        )
        .unwrap();
        (coordinator, transport)
    }

    async fn wait_connected(coordinator: &SyncCoordinator) {
        let mut events = coordinator.subscribe();
        if coordinator.connection_state() == ConnectionState::Connected {
            return;
        }
        loop {
            if let SyncEvent::ConnectionChanged {
                state: ConnectionState::Connected,
            } = events.recv().await.unwrap()
            {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_new_requires_valid_config() {
        let pan = MemoryPan::new();
        let config = SyncConfig {
            settings_path: "relative".to_string(),
            ..SyncConfig::default()
        };
        let result = SyncCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(pan.transport()),
            config,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_while_disconnected_is_latched() {
        let pan = MemoryPan::new();
        pan.set_reachable(false);
        let (coordinator, transport) = coordinator(&pan);

        coordinator.enqueue("volume", PendingEntry::Put(PrefValue::Int(3)));
        assert_eq!(coordinator.connection_state(), ConnectionState::Connecting);

        let outcome = coordinator.flush().await.unwrap();
        assert_eq!(outcome, FlushOutcome::Deferred);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(coordinator.connection_state(), ConnectionState::Connecting);
        assert_eq!(coordinator.pending_action(), PendingAction::FlushQueue);
        assert_eq!(coordinator.pending_len(), 1);
        assert_eq!(transport.calls(), vec![TransportCall::Connect]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_tombstone_is_empty_put_then_delete() {
        let pan = MemoryPan::new();
        let (coordinator, transport) = coordinator(&pan);
        coordinator.connect();
        wait_connected(&coordinator).await;

        coordinator.enqueue("theme", PendingEntry::Tombstone);
        let outcome = coordinator.flush().await.unwrap();

        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                keys: vec!["theme".to_string()],
                pruned: 0
            }
        );
        let path = key_path(crate::types::DEFAULT_SETTINGS_PATH, "theme");
        let calls = transport.calls();
        let sent = &calls[calls.len() - 2..];
        assert_eq!(
            sent,
            &[
                TransportCall::Put {
                    path: path.clone(),
                    keys: vec![],
                    urgent: true,
                },
                TransportCall::Delete { path },
            ]
        );

        // The cancelled debounce timer never fires a second flush
        transport.clear_calls();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_then_reconnect_on_next_enqueue() {
        let pan = MemoryPan::new();
        let (coordinator, transport) = coordinator(&pan);
        coordinator.connect();
        wait_connected(&coordinator).await;

        transport.disconnect();
        coordinator.connection_lost();
        assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);

        coordinator.enqueue("a", PendingEntry::Put(PrefValue::Bool(true)));
        wait_connected(&coordinator).await;
        let connects = transport
            .calls()
            .iter()
            .filter(|c| **c == TransportCall::Connect)
            .count();
        assert_eq!(connects, 2);
    }
}
