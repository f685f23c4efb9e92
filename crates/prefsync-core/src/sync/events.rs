//! Sync event types emitted by the coordinator
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncEvent: Notifications about sync activity                   │
//! │  ├── ConnectionChanged: transport state moved                   │
//! │  ├── FlushDeferred: flush latched while not connected           │
//! │  ├── Flushed: a batch left for the PAN                          │
//! │  ├── RemoteApplied: an inbound change batch was merged          │
//! │  ├── PullCompleted: a full pull was merged                      │
//! │  └── PullFailed: a full pull was discarded                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::types::{ConnectionState, PendingAction};

/// What merging one batch of remote data did to the local store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Events (or items) examined
    pub events: usize,
    /// Events discarded because this node originated them
    pub echoes: usize,
    /// Events outside the settings root, or deletes naming no key
    pub ignored: usize,
    /// Keys written locally
    pub writes: usize,
    /// Keys removed locally
    pub deletes: usize,
    /// Entries skipped because the local value already matched
    pub unchanged: usize,
}

impl ApplyReport {
    /// Whether the merge touched the local store
    pub fn changed_store(&self) -> bool {
        self.writes + self.deletes > 0
    }
}

/// Events emitted during synchronization
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The coordinator's view of the transport changed
    ConnectionChanged { state: ConnectionState },
    /// A flush was requested while not connected; `pending` is now latched
    FlushDeferred { pending: PendingAction },
    /// A batch was dispatched to the transport
    Flushed {
        /// Keys in the batch, sorted
        keys: Vec<String>,
        /// Remote items deleted by a bulk push's pruning step
        pruned: usize,
    },
    /// A batch of remote change events was merged
    RemoteApplied { report: ApplyReport },
    /// A full pull finished and was merged
    PullCompleted { items: usize, report: ApplyReport },
    /// A full pull failed; the local store was left unchanged
    PullFailed { message: String },
}
