//! Transport contract between the sync core and the PAN.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Transport (one per node)                                       │
//! │  ├── connect()          async, resolves once the node is up     │
//! │  ├── local_node_id()    LocalNodeId handle, set while connected │
//! │  ├── put(PutRequest)    create/overwrite this node's item       │
//! │  ├── delete(path)       remove every item at a path             │
//! │  ├── list_items(prefix) every item under a prefix, any node     │
//! │  └── subscribe()        batches of ChangeEvents, echo included  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Items are addressed by `(owner node, path)`. A change event names the node
//! that performed the mutation; transports are allowed to echo a node's own
//! mutations back to it, and the applier discards those.

mod memory;

pub use self::memory::{MemoryPan, MemoryTransport, TransportCall};

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::codec::Payload;
use crate::error::SyncResult;

/// Shared handle to this node's identifier on the PAN.
///
/// Owned and filled by the transport once connected, cleared on full
/// disconnect. Clones observe the same value.
#[derive(Debug, Clone, Default)]
pub struct LocalNodeId(Arc<RwLock<Option<String>>>);

impl LocalNodeId {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current id, if the transport is connected
    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }

    /// Whether `node_id` is this node
    pub fn is_local(&self, node_id: &str) -> bool {
        self.0.read().as_deref() == Some(node_id)
    }

    pub fn set(&self, node_id: impl Into<String>) {
        *self.0.write() = Some(node_id.into());
    }

    pub fn clear(&self) {
        *self.0.write() = None;
    }
}

/// A request to create or overwrite this node's item at `path`
#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub path: String,
    pub payload: Payload,
    /// Deliver without the transport's usual batching delay
    pub urgent: bool,
}

/// One item in the PAN-wide namespace
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub node_id: String,
    pub path: String,
    pub payload: Payload,
    /// Entries dropped while decoding `payload`
    pub skipped: usize,
}

/// Kind of remote mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Changed,
    Deleted,
}

/// A remote mutation delivered to every attached node
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub origin_node_id: String,
    pub path: String,
    pub kind: ChangeKind,
    pub payload: Payload,
    /// Entries dropped while decoding `payload`
    pub skipped: usize,
}

impl ChangeEvent {
    /// A changed event that carried no entries at all, which some transports
    /// deliver in place of a delete
    pub fn is_empty_update(&self) -> bool {
        self.kind == ChangeKind::Changed && self.payload.is_empty() && self.skipped == 0
    }
}

/// Asynchronous access to the PAN's shared item namespace
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect this node. Resolves when the node is reachable on the PAN.
    async fn connect(&self) -> SyncResult<()>;

    /// Handle to this node's id; empty until connected
    fn local_node_id(&self) -> LocalNodeId;

    async fn put(&self, request: PutRequest) -> SyncResult<()>;

    async fn delete(&self, path: &str) -> SyncResult<()>;

    /// List every item whose path starts with `prefix`, regardless of owner
    async fn list_items(&self, prefix: &str) -> SyncResult<Vec<RemoteItem>>;

    /// Subscribe to change batches delivered to this node
    fn subscribe(&self) -> broadcast::Receiver<Vec<ChangeEvent>>;
}
