//! PrefSync Core Library
//!
//! Replicates a key-value preference store across the nodes of a small,
//! intermittently connected personal-area network (PAN).
//!
//! ## Overview
//!
//! A value changed on one node eventually appears on every other node:
//!
//! - **Debounced batching**: bursts of local edits collapse into one send
//! - **Connection gating**: nothing is sent until the transport is up; one
//!   deferred action is latched meanwhile
//! - **Echo-free merge**: a node ignores its own changes and never rewrites
//!   a value it already holds
//! - **Bulk resync**: pull everything from the PAN, or push a filtered set
//!   and prune what no longer belongs
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use prefsync_core::{MemoryPan, PrefSync, PrefValue, RedbStore, SyncConfig, LocalStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pan = MemoryPan::new();
//!     let store = Arc::new(RedbStore::open("prefs.redb")?);
//!     let sync = PrefSync::new(store.clone(), Arc::new(pan.transport()), SyncConfig::default())?;
//!     sync.resume()?;
//!
//!     store.put("theme", PrefValue::from("dark"))?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use codec::{decode_entries, decode_payload, encode_payload, DecodedPayload, Payload};
pub use config::SyncConfig;
pub use engine::PrefSync;
pub use error::{SyncError, SyncResult};
pub use store::{LocalStore, MemoryStore, RedbStore, StoreEdit, StoreEdits};
pub use sync::{
    ApplyReport, ChangeDetector, FlushOutcome, RemoteChangeApplier, SyncCoordinator, SyncEvent,
};
pub use transport::{
    ChangeEvent, ChangeKind, LocalNodeId, MemoryPan, MemoryTransport, PutRequest, RemoteItem,
    Transport, TransportCall,
};
pub use types::*;
