//! Workspace events over a tokio broadcast channel
//!
//! Each workspace session owns one [`EventBus`]. Events are purely
//! observational: delivery is best effort and a slow subscriber only lags
//! behind, it never blocks the engine. Events about one entry are always
//! emitted from the task handling that entry, so per-entry order holds.

use crate::models::{EntryId, WorkspaceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of events buffered per subscriber
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkspaceEvent {
    /// Outbound sync of an entry started.
    SyncStarted {
        workspace_id: WorkspaceId,
        entry_id: EntryId,
    },
    /// Blocks of a file uploaded so far.
    SyncProgress {
        workspace_id: WorkspaceId,
        entry_id: EntryId,
        blocks_done: usize,
        blocks_total: usize,
    },
    OutboundSyncDone {
        workspace_id: WorkspaceId,
        entry_id: EntryId,
        remote_version: u64,
    },
    InboundSyncDone {
        workspace_id: WorkspaceId,
        entry_id: EntryId,
        remote_version: u64,
    },
    /// Local state of an entry changed (local write or applied remote change).
    EntryUpdated {
        workspace_id: WorkspaceId,
        entry_id: EntryId,
    },
    /// A conflicting local file version was preserved under a new entry.
    EntryForked {
        workspace_id: WorkspaceId,
        entry_id: EntryId,
        fork_id: EntryId,
        fork_name: String,
    },
    /// Sync of an entry failed; the entry stays dirty.
    SyncFailed {
        workspace_id: WorkspaceId,
        entry_id: EntryId,
        error: String,
        transient: bool,
    },
    /// A fatal error stopped the workspace sync loop.
    SyncHalted {
        workspace_id: WorkspaceId,
        error: String,
    },
}

impl WorkspaceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncStarted { .. } => "SyncStarted",
            Self::SyncProgress { .. } => "SyncProgress",
            Self::OutboundSyncDone { .. } => "OutboundSyncDone",
            Self::InboundSyncDone { .. } => "InboundSyncDone",
            Self::EntryUpdated { .. } => "EntryUpdated",
            Self::EntryForked { .. } => "EntryForked",
            Self::SyncFailed { .. } => "SyncFailed",
            Self::SyncHalted { .. } => "SyncHalted",
        }
    }

    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            Self::SyncStarted { entry_id, .. }
            | Self::SyncProgress { entry_id, .. }
            | Self::OutboundSyncDone { entry_id, .. }
            | Self::InboundSyncDone { entry_id, .. }
            | Self::EntryUpdated { entry_id, .. }
            | Self::EntryForked { entry_id, .. }
            | Self::SyncFailed { entry_id, .. } => Some(*entry_id),
            Self::SyncHalted { .. } => None,
        }
    }
}

/// Event statistics for monitoring and debugging
#[derive(Debug, Default, Clone)]
pub struct EventStats {
    pub total_events_sent: u64,
    pub events_by_type: HashMap<&'static str, u64>,
}

pub struct EventBus {
    sender: broadcast::Sender<WorkspaceEvent>,
    /// Kept alive so that publishing never fails for lack of subscribers
    _receiver: broadcast::Receiver<WorkspaceEvent>,
    stats: Arc<parking_lot::Mutex<EventStats>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            _receiver: receiver,
            stats: Arc::new(parking_lot::Mutex::new(EventStats::default())),
        }
    }

    /// Publish an event, returning the number of receivers it reached.
    pub fn emit(&self, event: WorkspaceEvent) -> usize {
        {
            let mut stats = self.stats.lock();
            stats.total_events_sent += 1;
            *stats.events_by_type.entry(event.kind()).or_insert(0) += 1;
        }

        debug!(event_type = event.kind(), entry_id = ?event.entry_id(), "Emitting event");

        // The bus holds its own receiver, so send only fails once the bus is dropped
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.sender.subscribe()
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.lock().clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
