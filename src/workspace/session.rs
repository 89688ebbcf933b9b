//! Workspace session lifecycle
//!
//! A [`WorkspaceSession`] is the handle callers hold on a started workspace.
//! It owns the [`WorkspaceContext`] (cache, stores, locks, descriptors and
//! cancellation scope) and the background sync monitors; dropping or
//! stopping it tears all of them down. Filesystem operations are implemented
//! on the session in the sibling modules.

use crate::error::{Result, WorkspaceError};
use crate::events::WorkspaceEvent;
use crate::infrastructure::config::EngineConfig;
use crate::models::{Confinement, DeviceId, EntryId, WorkspaceId};
use crate::remote::RemoteService;
use crate::storage::{BlockStore, CacheUsage, LocalCache, ManifestStore, SecretKey};
use crate::sync::inbound::inbound_pass;
use crate::sync::monitor::{halt, spawn_monitors};
use crate::sync::outbound::outbound_pass;
use crate::sync::report::SyncReport;
use crate::utils::cancellation::cancellable;
use crate::workspace::context::WorkspaceContext;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts of an operation that lost a race against a concurrent writer.
const MAX_CONFLICT_RETRIES: usize = 8;

/// Re-run `operation` while it fails with `VersionConflict`.
///
/// Every attempt re-reads the manifests it works on, so a retry always
/// applies on top of the winning writer.
pub(crate) async fn retry_on_conflict<F, Fut, T>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1usize;
    loop {
        match operation().await {
            Err(WorkspaceError::VersionConflict { entry_id, .. })
                if attempt < MAX_CONFLICT_RETRIES =>
            {
                debug!(entry_id = %entry_id, attempt, "Concurrent update, retrying");
                attempt += 1;
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}

pub struct WorkspaceSession {
    pub(crate) ctx: Arc<WorkspaceContext>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkspaceSession {
    /// Open the local cache of `workspace_id` and start syncing it.
    ///
    /// # Arguments
    ///
    /// * `config` - Engine settings, validated before anything is opened
    /// * `workspace_key` - Symmetric key shared by every device of the workspace
    /// * `device_id` - Identity recorded as author of pushed versions
    /// * `remote` - The remote storage service
    ///
    /// # Errors
    ///
    /// `Config` for invalid settings, `Database` or `Corrupted` if the
    /// local cache cannot be opened.
    pub async fn start(
        config: EngineConfig,
        workspace_id: WorkspaceId,
        workspace_key: SecretKey,
        device_id: DeviceId,
        remote: Arc<dyn RemoteService>,
    ) -> Result<Self> {
        let config = config.validated()?;
        let confinement = Confinement::new(config.confinement.prevent_sync_pattern.as_deref())?;
        let remote_timeout = Duration::from_millis(config.sync.remote_timeout_ms);

        let cache = Arc::new(
            LocalCache::open(
                &config.storage.data_dir,
                workspace_id,
                workspace_key.clone(),
                config.storage.cache_budget_bytes,
            )
            .await?,
        );
        let manifests = ManifestStore::new(
            cache.clone(),
            remote.clone(),
            workspace_key.clone(),
            workspace_id.root_entry_id(),
            confinement,
            config.storage.manifest_cache_capacity,
            remote_timeout,
        );
        let blocks = BlockStore::new(
            cache.clone(),
            remote.clone(),
            workspace_key.clone(),
            remote_timeout,
        );

        if let Err(e) = manifests.ensure_root().await {
            cache.close().await;
            return Err(e);
        }

        let ctx = Arc::new(WorkspaceContext::new(
            workspace_id,
            device_id,
            config,
            workspace_key,
            cache,
            manifests,
            blocks,
            remote,
        ));
        let monitors = spawn_monitors(ctx.clone());
        // push what a previous session left dirty, pull what changed meanwhile
        ctx.outbound_wakeup.notify_one();
        ctx.inbound_wakeup.notify_one();

        info!(
            workspace_id = %workspace_id,
            device_id = %device_id,
            "Workspace session started"
        );
        Ok(Self {
            ctx,
            monitors: Mutex::new(monitors),
        })
    }

    /// Stop the session: cancel in-flight sync, close descriptors and the cache.
    ///
    /// Idempotent. Every later operation fails with `Stopped`.
    pub async fn stop(&self) -> Result<()> {
        if !self.ctx.mark_stopped() {
            return Ok(());
        }
        self.ctx.token.cancel();

        let monitors = std::mem::take(&mut *self.monitors.lock());
        for handle in monitors {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync monitor ended abnormally");
            }
        }

        let closed = self.ctx.fds.close_all();
        self.ctx.cache.close().await;
        info!(
            workspace_id = %self.ctx.workspace_id,
            closed_descriptors = closed,
            "Workspace session stopped"
        );
        Ok(())
    }

    /// Run one outbound then one inbound pass and wait for both.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.ctx.ensure_running()?;
        if self.ctx.is_sync_halted() {
            return Err(WorkspaceError::Stopped);
        }

        let ctx = self.ctx.as_ref();
        let result = cancellable(&ctx.sync_token, async {
            let mut report = outbound_pass(ctx).await?;
            report.merge(inbound_pass(ctx).await?);
            Ok(report)
        })
        .await;

        if let Err(e) = &result {
            if e.is_fatal() {
                halt(ctx, e);
            }
        }
        result
    }

    /// Like [`sync_now`](Self::sync_now), but gives up as soon as `cancel` fires.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn demo(session: &workspace_sync::WorkspaceSession) -> workspace_sync::Result<()> {
    /// let cancel = tokio_util::sync::CancellationToken::new();
    /// let report = session.sync_now_until(&cancel).await?;
    /// println!("{} entries synced", report.synced);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Entries whose push was not yet committed locally stay dirty with
    /// their base version unchanged; the next pass retries them.
    pub async fn sync_now_until(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        cancellable(cancel, self.sync_now()).await
    }

    /// Server-pushed notification that `entry_id` changed remotely.
    pub fn notify_remote_change(&self, entry_id: EntryId) {
        self.ctx.record_remote_change(entry_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.ctx.events.subscribe()
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.ctx.workspace_id
    }

    pub fn device_id(&self) -> DeviceId {
        self.ctx.device_id
    }

    pub fn root_id(&self) -> EntryId {
        self.ctx.manifests.root_id()
    }

    /// True once a fatal error stopped the sync monitors.
    pub fn is_sync_halted(&self) -> bool {
        self.ctx.is_sync_halted()
    }

    pub async fn cache_usage(&self) -> Result<CacheUsage> {
        self.ctx.ensure_running()?;
        self.ctx.cache.cache_usage().await
    }

    /// Evict cached blocks down to the configured budget; returns how many went.
    pub async fn evict_to_budget(&self) -> Result<usize> {
        self.ctx.ensure_running()?;
        self.ctx.cache.evict_to_budget().await
    }

    /// Entries with local changes not pushed yet.
    pub async fn dirty_entries(&self) -> Result<Vec<EntryId>> {
        self.ctx.ensure_running()?;
        self.ctx.cache.dirty_entries().await
    }
}

impl Drop for WorkspaceSession {
    fn drop(&mut self) {
        // monitors hold their own reference to the context
        self.ctx.token.cancel();
    }
}
