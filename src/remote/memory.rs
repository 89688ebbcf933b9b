//! In-process remote service
//!
//! Implements [`RemoteService`] on top of in-memory maps so the workspace and
//! sync layers can be exercised without a server. Several sessions may share
//! one instance to simulate concurrent devices. Faults such as an offline
//! service, denied writes or lost replies can be injected at runtime, and
//! block uploads can be parked to observe work racing with a sync.

use super::{EncryptedManifest, FetchOutcome, RemoteChanges, RemoteResult, RemoteService};
use crate::error::RemoteError;
use crate::models::{BlockDigest, EntryId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct RemoteState {
    manifests: HashMap<EntryId, Vec<EncryptedManifest>>,
    blocks: HashMap<BlockDigest, Vec<u8>>,
    changes: Vec<(EntryId, u64)>,
    denied: Option<String>,
    denied_entries: HashSet<EntryId>,
}

#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    offline: AtomicBool,
    /// Manifest pushes to reject before storing anything.
    failing_manifest_pushes: AtomicUsize,
    /// Manifest pushes to store but answer with a transport error.
    lost_manifest_replies: AtomicUsize,
    manifest_pushes: AtomicU64,
    block_pushes: AtomicU64,
    /// Block pushes wait while set.
    blocks_held: AtomicBool,
    blocks_released: Notify,
    held_block_pushes: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject every push with `PermissionDenied` while set.
    pub fn deny_writes(&self, reason: Option<String>) {
        self.state.lock().denied = reason;
    }

    /// Reject manifest pushes of a single entry with `PermissionDenied`.
    pub fn deny_manifest_pushes_for(&self, entry_id: EntryId) {
        self.state.lock().denied_entries.insert(entry_id);
    }

    /// Park block pushes until released with `hold_block_pushes(false)`.
    pub fn hold_block_pushes(&self, held: bool) {
        self.blocks_held.store(held, Ordering::SeqCst);
        if !held {
            self.blocks_released.notify_waiters();
        }
    }

    /// Block pushes currently parked.
    pub fn held_block_push_count(&self) -> usize {
        self.held_block_pushes.load(Ordering::SeqCst)
    }

    pub fn fail_next_manifest_pushes(&self, count: usize) {
        self.failing_manifest_pushes.store(count, Ordering::SeqCst);
    }

    pub fn lose_next_manifest_replies(&self, count: usize) {
        self.lost_manifest_replies.store(count, Ordering::SeqCst);
    }

    /// Number of manifest versions accepted so far.
    pub fn manifest_push_count(&self) -> u64 {
        self.manifest_pushes.load(Ordering::SeqCst)
    }

    /// Number of blocks accepted so far.
    pub fn block_push_count(&self) -> u64 {
        self.block_pushes.load(Ordering::SeqCst)
    }

    pub fn latest_version(&self, entry_id: EntryId) -> Option<u64> {
        self.state
            .lock()
            .manifests
            .get(&entry_id)
            .and_then(|versions| versions.last())
            .map(|m| m.version)
    }

    pub fn has_block(&self, digest: &BlockDigest) -> bool {
        self.state.lock().blocks.contains_key(digest)
    }

    /// Drop a stored block, as if garbage collected by the server.
    pub fn forget_block(&self, digest: &BlockDigest) {
        self.state.lock().blocks.remove(digest);
    }

    fn check_online(&self) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Offline("remote service unreachable".to_string()));
        }
        Ok(())
    }

    async fn wait_for_block_release(&self) {
        if !self.blocks_held.load(Ordering::SeqCst) {
            return;
        }
        self.held_block_pushes.fetch_add(1, Ordering::SeqCst);
        loop {
            let released = self.blocks_released.notified();
            if !self.blocks_held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        self.held_block_pushes.fetch_sub(1, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteService for InMemoryRemote {
    async fn fetch_manifest(
        &self,
        entry_id: EntryId,
        since_version: u64,
    ) -> RemoteResult<FetchOutcome> {
        self.check_online()?;
        let state = self.state.lock();
        let latest = state
            .manifests
            .get(&entry_id)
            .and_then(|versions| versions.last())
            .ok_or(RemoteError::NotFound)?;
        if latest.version <= since_version {
            return Ok(FetchOutcome::NotModified);
        }
        Ok(FetchOutcome::Manifest(latest.clone()))
    }

    async fn fetch_manifest_version(
        &self,
        entry_id: EntryId,
        version: u64,
    ) -> RemoteResult<EncryptedManifest> {
        self.check_online()?;
        let state = self.state.lock();
        state
            .manifests
            .get(&entry_id)
            .and_then(|versions| versions.iter().find(|m| m.version == version))
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn push_manifest(
        &self,
        entry_id: EntryId,
        expected_base_version: u64,
        manifest: EncryptedManifest,
    ) -> RemoteResult<()> {
        self.check_online()?;
        if Self::take_one(&self.failing_manifest_pushes) {
            return Err(RemoteError::Offline("connection reset".to_string()));
        }

        let mut state = self.state.lock();
        if let Some(reason) = &state.denied {
            return Err(RemoteError::PermissionDenied(reason.clone()));
        }
        if state.denied_entries.contains(&entry_id) {
            return Err(RemoteError::PermissionDenied(format!(
                "no write access to {}",
                entry_id
            )));
        }
        let current = state
            .manifests
            .get(&entry_id)
            .and_then(|versions| versions.last())
            .map(|m| m.version)
            .unwrap_or(0);
        if current != expected_base_version {
            return Err(RemoteError::VersionConflict { current });
        }
        if manifest.version != expected_base_version + 1 {
            return Err(RemoteError::Internal(format!(
                "version {} does not follow {}",
                manifest.version, expected_base_version
            )));
        }

        let version = manifest.version;
        state.manifests.entry(entry_id).or_default().push(manifest);
        state.changes.push((entry_id, version));
        drop(state);
        self.manifest_pushes.fetch_add(1, Ordering::SeqCst);
        debug!(entry_id = %entry_id, version, "Remote accepted manifest");

        if Self::take_one(&self.lost_manifest_replies) {
            return Err(RemoteError::Timeout(0));
        }
        Ok(())
    }

    async fn fetch_block(&self, digest: &BlockDigest) -> RemoteResult<Vec<u8>> {
        self.check_online()?;
        self.state
            .lock()
            .blocks
            .get(digest)
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn push_block(&self, digest: &BlockDigest, ciphertext: Vec<u8>) -> RemoteResult<()> {
        self.check_online()?;
        self.wait_for_block_release().await;
        let mut state = self.state.lock();
        if let Some(reason) = &state.denied {
            return Err(RemoteError::PermissionDenied(reason.clone()));
        }
        if state.blocks.contains_key(digest) {
            return Err(RemoteError::AlreadyExists);
        }
        state.blocks.insert(digest.clone(), ciphertext);
        self.block_pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll_changes(&self, checkpoint: u64) -> RemoteResult<RemoteChanges> {
        self.check_online()?;
        let state = self.state.lock();
        let start = (checkpoint as usize).min(state.changes.len());
        Ok(RemoteChanges {
            checkpoint: state.changes.len() as u64,
            changes: state.changes[start..].to_vec(),
        })
    }
}
