//! Shared state of one running workspace
//!
//! Every filesystem operation and every sync task of a workspace works on the
//! same [`WorkspaceContext`]; nothing here is process-global.

use crate::error::{Result, WorkspaceError};
use crate::events::{EventBus, WorkspaceEvent};
use crate::infrastructure::config::EngineConfig;
use crate::models::{DeviceId, EntryId, WorkspaceId};
use crate::remote::RemoteService;
use crate::storage::{BlockStore, LocalCache, ManifestStore, SecretKey};
use crate::utils::retry::RetryPolicy;
use crate::workspace::fd::FdTable;
use crate::workspace::locks::EntryLocks;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct WorkspaceContext {
    pub workspace_id: WorkspaceId,
    pub device_id: DeviceId,
    pub config: EngineConfig,
    pub workspace_key: SecretKey,
    pub cache: Arc<LocalCache>,
    pub manifests: ManifestStore,
    pub blocks: BlockStore,
    pub remote: Arc<dyn RemoteService>,
    pub locks: EntryLocks,
    pub fds: FdTable,
    pub events: EventBus,
    pub retry: RetryPolicy,
    /// Cancelled by `stop()`.
    pub token: CancellationToken,
    /// Child of `token`, also cancelled when a fatal error halts syncing.
    pub sync_token: CancellationToken,
    pub outbound_wakeup: Notify,
    pub inbound_wakeup: Notify,
    /// Entries announced changed by the server, drained by the inbound pass.
    pending_remote_changes: Mutex<BTreeSet<EntryId>>,
    stopped: AtomicBool,
}

impl WorkspaceContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspace_id: WorkspaceId,
        device_id: DeviceId,
        config: EngineConfig,
        workspace_key: SecretKey,
        cache: Arc<LocalCache>,
        manifests: ManifestStore,
        blocks: BlockStore,
        remote: Arc<dyn RemoteService>,
    ) -> Self {
        let token = CancellationToken::new();
        let sync_token = token.child_token();
        Self {
            workspace_id,
            device_id,
            events: EventBus::new(config.events.channel_capacity),
            retry: RetryPolicy::from_config(&config.sync),
            config,
            workspace_key,
            cache,
            manifests,
            blocks,
            remote,
            locks: EntryLocks::new(),
            fds: FdTable::new(),
            token,
            sync_token,
            outbound_wakeup: Notify::new(),
            inbound_wakeup: Notify::new(),
            pending_remote_changes: Mutex::new(BTreeSet::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.config.sync.remote_timeout_ms)
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(WorkspaceError::Stopped);
        }
        Ok(())
    }

    /// Returns false if the session was already stopped.
    pub fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_sync_halted(&self) -> bool {
        self.sync_token.is_cancelled()
    }

    /// A local mutation was committed: tell observers and schedule a push.
    pub fn local_change(&self, entry_id: EntryId) {
        self.events.emit(WorkspaceEvent::EntryUpdated {
            workspace_id: self.workspace_id,
            entry_id,
        });
        self.outbound_wakeup.notify_one();
    }

    pub fn record_remote_change(&self, entry_id: EntryId) {
        self.pending_remote_changes.lock().insert(entry_id);
        self.inbound_wakeup.notify_one();
    }

    /// Keep a notification for the next pass without waking the monitor.
    pub fn requeue_remote_change(&self, entry_id: EntryId) {
        self.pending_remote_changes.lock().insert(entry_id);
    }

    pub fn take_remote_changes(&self) -> Vec<EntryId> {
        std::mem::take(&mut *self.pending_remote_changes.lock())
            .into_iter()
            .collect()
    }
}
