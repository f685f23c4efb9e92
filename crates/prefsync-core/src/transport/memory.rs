//! In-process PAN for tests and simulation.
//!
//! [`MemoryPan`] holds the shared item namespace and fans every mutation out
//! to all connected [`MemoryTransport`]s, the originating node included, the
//! way real PAN transports echo a node's own writes back to it.
//!
//! Payloads are stored in their wire encoding and decoded on delivery, so a
//! node never sees anything a real transport could not carry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::{ChangeEvent, ChangeKind, LocalNodeId, PutRequest, RemoteItem, Transport};
use crate::codec::{decode_entries, encode_payload, Payload};
use crate::error::{SyncError, SyncResult};

/// Capacity of each node's inbound change channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One call made through a [`MemoryTransport`], recorded for assertions
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Connect,
    Put {
        path: String,
        keys: Vec<String>,
        urgent: bool,
    },
    Delete {
        path: String,
    },
    List {
        prefix: String,
    },
}

struct StoredItem {
    node_id: String,
    path: String,
    data: Vec<u8>,
}

struct NodeLink {
    node_id: String,
    events_tx: broadcast::Sender<Vec<ChangeEvent>>,
    connected: Arc<AtomicBool>,
}

struct PanInner {
    /// Oldest first; a put moves the item to the back
    items: Mutex<Vec<StoredItem>>,
    nodes: Mutex<Vec<NodeLink>>,
    reachable: watch::Sender<bool>,
    fail_listing: AtomicBool,
    list_delay: Mutex<Duration>,
}

/// A shared in-memory PAN namespace
#[derive(Clone)]
pub struct MemoryPan {
    inner: Arc<PanInner>,
}

impl MemoryPan {
    /// Create a reachable PAN with no items
    pub fn new() -> Self {
        let (reachable, _) = watch::channel(true);
        Self {
            inner: Arc::new(PanInner {
                items: Mutex::new(Vec::new()),
                nodes: Mutex::new(Vec::new()),
                reachable,
                fail_listing: AtomicBool::new(false),
                list_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Attach a new node with a random id
    pub fn transport(&self) -> MemoryTransport {
        self.transport_with_id(format!("node-{}", Ulid::new()))
    }

    /// Attach a new node with a fixed id
    pub fn transport_with_id(&self, node_id: impl Into<String>) -> MemoryTransport {
        let node_id = node_id.into();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        self.inner.nodes.lock().push(NodeLink {
            node_id: node_id.clone(),
            events_tx: events_tx.clone(),
            connected: connected.clone(),
        });

        MemoryTransport {
            pan: self.clone(),
            node_id,
            local_id: LocalNodeId::new(),
            events_tx,
            connected,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// While unreachable, `connect` stays pending
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.send_replace(reachable);
    }

    /// Make `list_items` fail as if the transport returned a non-success status
    pub fn set_fail_listing(&self, fail: bool) {
        self.inner.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Delay every listing by `delay`
    pub fn set_list_delay(&self, delay: Duration) {
        *self.inner.list_delay.lock() = delay;
    }

    /// Place an item as if `node_id` had written it, without notifying anyone
    pub fn seed_item(&self, node_id: &str, path: &str, payload: &Payload) -> SyncResult<()> {
        let data = encode_payload(payload)?;
        self.store_item(node_id, path, data);
        Ok(())
    }

    /// Place an item with an already encoded payload, without notifying anyone
    pub fn seed_raw_item(&self, node_id: &str, path: &str, data: &[u8]) {
        self.store_item(node_id, path, data.to_vec());
    }

    /// Snapshot of every item, most recently written first
    pub fn items(&self) -> Vec<RemoteItem> {
        self.list_prefix("")
    }

    /// Deliver typed events to every connected node
    pub fn inject(&self, batch: Vec<ChangeEvent>) {
        self.fan_out(|_| batch.clone());
    }

    /// Deliver one raw event whose payload still needs decoding
    pub fn inject_raw(&self, origin_node_id: &str, path: &str, kind: ChangeKind, data: &[u8]) {
        match decode_entries(data) {
            Ok(decoded) => self.inject(vec![ChangeEvent {
                origin_node_id: origin_node_id.to_string(),
                path: path.to_string(),
                kind,
                payload: decoded.payload,
                skipped: decoded.skipped,
            }]),
            Err(e) => warn!(%path, error = %e, "Dropping undecodable event"),
        }
    }

    fn store_item(&self, node_id: &str, path: &str, data: Vec<u8>) {
        let mut items = self.inner.items.lock();
        items.retain(|item| !(item.node_id == node_id && item.path == path));
        items.push(StoredItem {
            node_id: node_id.to_string(),
            path: path.to_string(),
            data,
        });
    }

    fn remove_path(&self, path: &str) -> Vec<String> {
        let mut items = self.inner.items.lock();
        let mut owners = Vec::new();
        items.retain(|item| {
            if item.path == path {
                owners.push(item.node_id.clone());
                false
            } else {
                true
            }
        });
        owners
    }

    fn list_prefix(&self, prefix: &str) -> Vec<RemoteItem> {
        let items = self.inner.items.lock();
        items
            .iter()
            .rev()
            .filter(|item| item.path.starts_with(prefix))
            .filter_map(|item| match decode_entries(&item.data) {
                Ok(decoded) => Some(RemoteItem {
                    node_id: item.node_id.clone(),
                    path: item.path.clone(),
                    payload: decoded.payload,
                    skipped: decoded.skipped,
                }),
                Err(e) => {
                    warn!(path = %item.path, error = %e, "Skipping undecodable item");
                    None
                }
            })
            .collect()
    }

    fn fan_out(&self, make_batch: impl Fn(&str) -> Vec<ChangeEvent>) {
        let nodes = self.inner.nodes.lock();
        for node in nodes.iter() {
            if !node.connected.load(Ordering::SeqCst) {
                continue;
            }
            let batch = make_batch(&node.node_id);
            if batch.is_empty() {
                continue;
            }
            // A node without listeners simply misses the batch
            let _ = node.events_tx.send(batch);
        }
    }
}

impl Default for MemoryPan {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's connection to a [`MemoryPan`]
pub struct MemoryTransport {
    pan: MemoryPan,
    node_id: String,
    local_id: LocalNodeId,
    events_tx: broadcast::Sender<Vec<ChangeEvent>>,
    connected: Arc<AtomicBool>,
    calls: Mutex<Vec<TransportCall>>,
}

impl MemoryTransport {
    /// This node's id on the PAN (known before connecting, unlike [`LocalNodeId`])
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop off the PAN; the node id handle is cleared
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.local_id.clear();
        info!(node_id = %self.node_id, "Memory transport disconnected");
    }

    /// Every call made so far, oldest first
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> SyncResult<()> {
        self.record(TransportCall::Connect);

        let mut reachable = self.pan.inner.reachable.subscribe();
        reachable
            .wait_for(|up| *up)
            .await
            .map_err(|e| SyncError::Transport(format!("PAN shut down: {}", e)))?;

        self.connected.store(true, Ordering::SeqCst);
        self.local_id.set(self.node_id.clone());
        info!(node_id = %self.node_id, "Memory transport connected");
        Ok(())
    }

    fn local_node_id(&self) -> LocalNodeId {
        self.local_id.clone()
    }

    async fn put(&self, request: PutRequest) -> SyncResult<()> {
        self.record(TransportCall::Put {
            path: request.path.clone(),
            keys: request.payload.keys().cloned().collect(),
            urgent: request.urgent,
        });
        self.ensure_connected()?;

        let data = encode_payload(&request.payload)?;
        let decoded = decode_entries(&data)?;
        self.pan.store_item(&self.node_id, &request.path, data);
        debug!(node_id = %self.node_id, path = %request.path, "Item written");

        let event = ChangeEvent {
            origin_node_id: self.node_id.clone(),
            path: request.path,
            kind: ChangeKind::Changed,
            payload: decoded.payload,
            skipped: decoded.skipped,
        };
        self.pan.fan_out(|_| vec![event.clone()]);
        Ok(())
    }

    async fn delete(&self, path: &str) -> SyncResult<()> {
        self.record(TransportCall::Delete {
            path: path.to_string(),
        });
        self.ensure_connected()?;

        let owners = self.pan.remove_path(path);
        debug!(node_id = %self.node_id, %path, removed = owners.len(), "Items deleted");

        let events: Vec<ChangeEvent> = owners
            .iter()
            .map(|_| ChangeEvent {
                origin_node_id: self.node_id.clone(),
                path: path.to_string(),
                kind: ChangeKind::Deleted,
                payload: Payload::new(),
                skipped: 0,
            })
            .collect();
        self.pan.fan_out(|_| events.clone());
        Ok(())
    }

    async fn list_items(&self, prefix: &str) -> SyncResult<Vec<RemoteItem>> {
        self.record(TransportCall::List {
            prefix: prefix.to_string(),
        });
        self.ensure_connected()?;

        let delay = *self.pan.inner.list_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.pan.inner.fail_listing.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("item listing failed".to_string()));
        }
        Ok(self.pan.list_prefix(prefix))
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<ChangeEvent>> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrefValue;

    fn payload(key: &str, value: PrefValue) -> Payload {
        let mut payload = Payload::new();
        payload.insert(key.to_string(), Some(value));
        payload
    }

    #[tokio::test]
    async fn test_put_is_echoed_to_every_connected_node() {
        let pan = MemoryPan::new();
        let a = pan.transport_with_id("a");
        let b = pan.transport_with_id("b");
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.put(PutRequest {
            path: "/s/volume".to_string(),
            payload: payload("volume", PrefValue::Int(5)),
            urgent: true,
        })
        .await
        .unwrap();

        let echoed = a_rx.recv().await.unwrap();
        let delivered = b_rx.recv().await.unwrap();
        assert_eq!(echoed, delivered);
        assert_eq!(delivered[0].origin_node_id, "a");
        assert_eq!(delivered[0].kind, ChangeKind::Changed);
    }

    #[tokio::test]
    async fn test_put_delivers_the_wire_form() {
        let pan = MemoryPan::new();
        let a = pan.transport_with_id("a");
        a.connect().await.unwrap();
        let mut rx = a.subscribe();

        // A NaN with a payload of its own comes back as the canonical NaN
        let odd_nan = f64::from_bits(f64::NAN.to_bits() | 1);
        a.put(PutRequest {
            path: "/s/ratio".to_string(),
            payload: payload("ratio", PrefValue::Float(odd_nan)),
            urgent: false,
        })
        .await
        .unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(
            delivered[0].payload.get("ratio"),
            Some(&Some(PrefValue::Float(f64::NAN)))
        );
        assert_ne!(
            delivered[0].payload.get("ratio"),
            Some(&Some(PrefValue::Float(odd_nan)))
        );
        assert_eq!(delivered[0].skipped, 0);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let pan = MemoryPan::new();
        let a = pan.transport_with_id("a");
        assert!(a.local_node_id().get().is_none());

        let err = a.delete("/s/x").await.unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));

        a.connect().await.unwrap();
        assert_eq!(a.local_node_id().get().as_deref(), Some("a"));

        a.disconnect();
        assert!(a.local_node_id().get().is_none());
        assert_eq!(
            a.calls(),
            vec![
                TransportCall::Delete {
                    path: "/s/x".to_string()
                },
                TransportCall::Connect
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_removes_items_of_every_owner() {
        let pan = MemoryPan::new();
        pan.seed_item("a", "/s/k", &payload("k", PrefValue::Bool(true)))
            .unwrap();
        pan.seed_item("b", "/s/k", &payload("k", PrefValue::Bool(false)))
            .unwrap();
        pan.seed_item("b", "/s/other", &payload("other", PrefValue::Int(1)))
            .unwrap();

        let c = pan.transport_with_id("c");
        c.connect().await.unwrap();
        let mut rx = c.subscribe();

        c.delete("/s/k").await.unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.kind == ChangeKind::Deleted));

        let remaining = pan.items();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, "/s/other");
    }

    #[tokio::test]
    async fn test_listing_is_newest_first_and_can_fail() {
        let pan = MemoryPan::new();
        pan.seed_item("a", "/s/first", &payload("first", PrefValue::Int(1)))
            .unwrap();
        pan.seed_item("a", "/s/second", &payload("second", PrefValue::Int(2)))
            .unwrap();
        pan.seed_item("a", "/elsewhere", &Payload::new()).unwrap();

        let a = pan.transport_with_id("a");
        a.connect().await.unwrap();

        let items = a.list_items("/s").await.unwrap();
        let paths: Vec<&str> = items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["/s/second", "/s/first"]);

        pan.set_fail_listing(true);
        assert!(matches!(
            a.list_items("/s").await,
            Err(SyncError::Transport(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_reachability() {
        let pan = MemoryPan::new();
        pan.set_reachable(false);
        let a = Arc::new(pan.transport_with_id("a"));

        let connecting = {
            let a = a.clone();
            tokio::spawn(async move { a.connect().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!a.is_connected());

        pan.set_reachable(true);
        connecting.await.unwrap().unwrap();
        assert!(a.is_connected());
    }
}
