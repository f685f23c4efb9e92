//! Shared helpers for prefsync-core integration tests
#![allow(dead_code)]

use std::sync::Arc;

use prefsync_core::{
    ChangeEvent, ChangeKind, ConnectionState, MemoryPan, MemoryStore, MemoryTransport, Payload,
    PrefSync, PrefValue, SyncConfig, SyncCoordinator, SyncEvent, TransportCall,
    DEFAULT_SETTINGS_PATH,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout, Duration};

/// Upper bound on how long any test waits for an event (virtual time when paused)
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Wait for the first event matching `pred`, skipping the rest
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

/// Connect a coordinator and wait until it reports Connected
pub async fn connect(coordinator: &SyncCoordinator) {
    let mut events = coordinator.subscribe();
    coordinator.connect();
    if coordinator.connection_state() == ConnectionState::Connected {
        return;
    }
    wait_for(&mut events, |e| {
        matches!(
            e,
            SyncEvent::ConnectionChanged {
                state: ConnectionState::Connected
            }
        )
    })
    .await;
}

/// Poll `check` until it holds
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// One node on a shared PAN, with its transport and store kept for assertions
pub struct TestNode {
    pub sync: PrefSync,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<MemoryTransport>,
}

impl TestNode {
    pub fn new(pan: &MemoryPan, node_id: &str) -> Self {
        Self::with_store(pan, node_id, MemoryStore::new())
    }

    pub fn with_store(pan: &MemoryPan, node_id: &str, store: MemoryStore) -> Self {
        let store = Arc::new(store);
        let transport = Arc::new(pan.transport_with_id(node_id));
        let sync = PrefSync::new(store.clone(), transport.clone(), SyncConfig::default())
            .expect("create node");
        Self {
            sync,
            store,
            transport,
        }
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        self.sync.coordinator()
    }

    /// Every put the transport has seen, as (path, keys)
    pub fn puts(&self) -> Vec<(String, Vec<String>)> {
        self.transport
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Put { path, keys, .. } => Some((path, keys)),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.transport
            .calls()
            .iter()
            .filter(|call| **call == TransportCall::Connect)
            .count()
    }
}

pub fn settings_key(key: &str) -> String {
    format!("{}/{}", DEFAULT_SETTINGS_PATH, key)
}

pub fn payload(entries: &[(&str, Option<PrefValue>)]) -> Payload {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

pub fn changed(origin: &str, path: &str, entries: &[(&str, Option<PrefValue>)]) -> ChangeEvent {
    ChangeEvent {
        origin_node_id: origin.to_string(),
        path: path.to_string(),
        kind: ChangeKind::Changed,
        payload: payload(entries),
        skipped: 0,
    }
}

pub fn deleted(origin: &str, path: &str) -> ChangeEvent {
    ChangeEvent {
        origin_node_id: origin.to_string(),
        path: path.to_string(),
        kind: ChangeKind::Deleted,
        payload: Payload::new(),
        skipped: 0,
    }
}
