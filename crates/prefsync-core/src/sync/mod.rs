//! Synchronization layer
//!
//! ## Overview
//!
//! Local edits flow out through a debounced batcher; remote edits flow in
//! through a merge that suppresses self-echo and redundant writes.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  outbound                                                       │
//! │  LocalStore ─notify─▶ ChangeDetector ─enqueue─▶ SyncCoordinator │
//! │                                   (debounce) ──flush──▶ Transport│
//! │                                                                 │
//! │  inbound                                                        │
//! │  Transport ─batch─▶ remote listener ─▶ RemoteChangeApplier      │
//! │                                         └─one commit─▶ LocalStore│
//! │                                                                 │
//! │  resync                                                         │
//! │  resync_local:  list_items(root) ─▶ applier (pull merge)        │
//! │  resync_remote: filtered values ─▶ prune stale ─▶ bulk put      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection gating
//!
//! Nothing is sent while the transport is not connected. One deferred
//! action is latched instead, and a full pull preempts a plain flush. The
//! connection is requested lazily by the first enqueue or resync, and the
//! latched action runs once when it comes up.

pub mod applier;
pub mod coordinator;
pub mod detector;
pub mod events;
pub mod listener;
mod resync;

pub use applier::RemoteChangeApplier;
pub use coordinator::{FlushOutcome, SyncCoordinator};
pub use detector::ChangeDetector;
pub use events::{ApplyReport, SyncEvent};
pub use listener::spawn_remote_listener;
