//! Outbound sync: push local changes of dirty entries
//!
//! For one entry, a round is:
//!
//! 1. lock the entry
//! 2. undo a local move that would put the entry below itself given the
//!    moves already on the remote
//! 3. fetch the remote version newer than the local `base_version`
//! 4. if there is none, push the referenced blocks, then the manifest as
//!    `base_version + 1`, and record it as the new base
//! 5. otherwise merge it into the local manifest and start another round;
//!    a fork is committed with the parent folder locked as well
//!
//! A pass handles the dirty entries deepest first so a folder is pushed after
//! its new children.

use crate::error::{RemoteError, Result, WorkspaceError};
use crate::events::WorkspaceEvent;
use crate::models::{
    EntryId, EntryKind, EntryName, FileManifest, LocalManifest, ManifestContent, RemoteManifest,
};
use crate::remote::{open_manifest, seal_manifest, FetchOutcome};
use crate::storage::ManifestUpdate;
use crate::sync::merge::{
    get_conflict_filename, merge_remote_into_local, visible_content, MergeOutcome,
    CONTENT_CONFLICT_SUFFIX, NAME_CONFLICT_SUFFIX,
};
use crate::sync::report::SyncReport;
use crate::utils::retry::{retry_transient, with_timeout};
use crate::workspace::WorkspaceContext;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntrySyncOutcome {
    /// Remote version now matching the local content, if the entry got clean.
    pub remote_version: Option<u64>,
    pub conflicts: usize,
}

enum PushOutcome {
    Pushed(u64),
    Conflict,
}

/// Remote version of `entry_id` newer than `since`, decrypted.
pub(crate) async fn fetch_newer(
    ctx: &WorkspaceContext,
    entry_id: EntryId,
    since: u64,
) -> Result<Option<RemoteManifest>> {
    let limit = ctx.remote_timeout();
    let fetched = retry_transient(&ctx.retry, "fetch_manifest", move || async move {
        match with_timeout(limit, ctx.remote.fetch_manifest(entry_id, since)).await {
            Ok(FetchOutcome::Manifest(encrypted)) => Ok(Some(encrypted)),
            Ok(FetchOutcome::NotModified) => Ok(None),
            // never pushed yet
            Err(RemoteError::NotFound) if since == 0 => Ok(None),
            Err(RemoteError::NotFound) => Err(WorkspaceError::Corrupted(format!(
                "remote lost entry {} synced at version {}",
                entry_id, since
            ))),
            Err(e) => Err(e.into()),
        }
    })
    .await?;

    fetched
        .map(|encrypted| open_manifest(&ctx.workspace_key, entry_id, &encrypted))
        .transpose()
}

async fn push_blocks(ctx: &WorkspaceContext, entry_id: EntryId, file: &FileManifest) -> Result<()> {
    let total = file.blocks.len();
    if total == 0 {
        return Ok(());
    }

    let uploads: Vec<_> = file
        .blocks
        .iter()
        .map(|block| {
            let digest = &block.digest;
            retry_transient(&ctx.retry, "push_block", move || ctx.blocks.push(digest))
        })
        .collect();
    let mut uploads =
        stream::iter(uploads).buffer_unordered(ctx.config.sync.max_concurrent_block_uploads);

    let mut done = 0usize;
    while let Some(result) = uploads.next().await {
        result?;
        done += 1;
        ctx.events.emit(WorkspaceEvent::SyncProgress {
            workspace_id: ctx.workspace_id,
            entry_id,
            blocks_done: done,
            blocks_total: total,
        });
    }
    debug!(entry_id = %entry_id, blocks = total, "Blocks uploaded");
    Ok(())
}

async fn push_local(ctx: &WorkspaceContext, local: &LocalManifest) -> Result<PushOutcome> {
    let entry_id = local.id();
    let base_version = local.base_version;

    // blocks first: a pushed manifest never references a missing block
    if let ManifestContent::File(file) = &local.content {
        push_blocks(ctx, entry_id, file).await?;
    }

    let content = visible_content(&local.content, ctx.manifests.confinement());
    let remote = RemoteManifest {
        version: base_version + 1,
        author: ctx.device_id,
        timestamp: Utc::now(),
        content: content.clone(),
    };
    let sealed = seal_manifest(&ctx.workspace_key, &remote)?;
    let sealed = &sealed;
    let limit = ctx.remote_timeout();

    let accepted = retry_transient(&ctx.retry, "push_manifest", move || async move {
        match with_timeout(
            limit,
            ctx.remote
                .push_manifest(entry_id, base_version, sealed.clone()),
        )
        .await
        {
            Ok(()) => Ok(true),
            Err(RemoteError::VersionConflict { current }) => {
                debug!(entry_id = %entry_id, base_version, current, "Remote moved on");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    })
    .await?;

    if !accepted {
        return Ok(PushOutcome::Conflict);
    }

    let mut synced = local.clone();
    synced.base_version = remote.version;
    synced.base = Some(content);
    synced.base_author = Some(ctx.device_id);
    synced.need_sync = false;
    ctx.manifests.put(synced, local.version).await?;

    info!(entry_id = %entry_id, remote_version = remote.version, "Pushed manifest");
    ctx.events.emit(WorkspaceEvent::OutboundSyncDone {
        workspace_id: ctx.workspace_id,
        entry_id,
        remote_version: remote.version,
    });
    Ok(PushOutcome::Pushed(remote.version))
}

/// Commit a merge of the remote version `remote_version` into `local`.
///
/// Caller holds the entry lock and, when the merge forks the file, the lock
/// of its parent.
async fn commit_merge(
    ctx: &WorkspaceContext,
    local: &LocalManifest,
    remote_version: u64,
    outcome: MergeOutcome,
) -> Result<(usize, bool)> {
    let now = Utc::now();
    let conflicts = outcome.conflicts();
    let need_sync = outcome.manifest.need_sync;
    let mut updates = vec![ManifestUpdate::new(outcome.manifest, local.version)];
    let mut forked = None;

    if let Some(fork) = outcome.fork {
        let mut parent = ctx.manifests.get(fork.parent).await?;
        let parent_confined = parent.confined;
        let ManifestContent::Folder(folder) = &mut parent.content else {
            return Err(WorkspaceError::Corrupted(format!(
                "parent {} of file {} is not a folder",
                fork.parent,
                local.id()
            )));
        };
        let original = match folder.child_name(local.id()) {
            Some(name) => name.clone(),
            None => local.id().to_string().parse()?,
        };
        let fork_name = get_conflict_filename(&original, CONTENT_CONFLICT_SUFFIX, |name| {
            folder.children.contains_key(name)
        })?;
        folder.children.insert(fork_name.clone(), fork.id);
        folder.updated = now;
        parent.need_sync = true;

        let confined = ctx
            .manifests
            .confinement()
            .child_confined(parent_confined, &fork_name);
        forked = Some((fork.id, fork_name, parent.id()));
        updates.push(ManifestUpdate::on_top(parent));
        updates.push(ManifestUpdate::new(
            LocalManifest::new_local(ManifestContent::File(fork), confined),
            0,
        ));
    }

    ctx.manifests.put_many(updates).await?;

    if conflicts > 0 {
        warn!(
            entry_id = %local.id(),
            remote_version,
            conflicts,
            "Merged conflicting remote version"
        );
    } else {
        debug!(entry_id = %local.id(), remote_version, "Merged remote version");
    }
    ctx.events.emit(WorkspaceEvent::EntryUpdated {
        workspace_id: ctx.workspace_id,
        entry_id: local.id(),
    });
    if let Some((fork_id, fork_name, parent_id)) = forked {
        ctx.events.emit(WorkspaceEvent::EntryForked {
            workspace_id: ctx.workspace_id,
            entry_id: local.id(),
            fork_id,
            fork_name: fork_name.to_string(),
        });
        ctx.local_change(parent_id);
    }
    Ok((conflicts, need_sync))
}

/// Whether the local move of `local` would put it below itself once the
/// remote placement of its new ancestors is taken into account.
///
/// Ancestors are followed through their latest remote version, or the local
/// one for folders never pushed.
async fn crosses_remote_move(ctx: &WorkspaceContext, local: &LocalManifest) -> Result<bool> {
    let Some(base) = &local.base else {
        return Ok(false);
    };
    let mut current = local.content.parent();
    if current == base.parent() {
        return Ok(false);
    }

    let root_id = ctx.manifests.root_id();
    let mut seen = HashSet::new();
    while current != root_id && seen.insert(current) {
        if current == local.id() {
            return Ok(true);
        }
        current = match fetch_newer(ctx, current, 0).await? {
            Some(remote) => remote.content.parent(),
            None => match ctx.manifests.try_get(current).await? {
                Some(manifest) => manifest.content.parent(),
                None => return Ok(false),
            },
        };
    }
    Ok(false)
}

/// Put a moved entry back under the parent it had at its last sync.
///
/// The remote placement wins a crossed move the same way it wins when both
/// sides moved the same entry. The previous parent being gone, the entry
/// goes to the workspace root. Does nothing if the entry changed since
/// `expected_version`.
async fn undo_local_move(ctx: &WorkspaceContext, entry_id: EntryId, expected_version: u64) -> Result<()> {
    let local = ctx.manifests.get(entry_id).await?;
    let Some(base) = &local.base else {
        return Ok(());
    };
    let from_id = local.content.parent();
    let to_id = match ctx.manifests.try_get(base.parent()).await? {
        Some(folder) if !folder.tombstone && folder.kind() == EntryKind::Folder => folder.id(),
        _ => ctx.manifests.root_id(),
    };
    if from_id == to_id {
        return Ok(());
    }

    let _guards = ctx.locks.lock_many([entry_id, from_id, to_id]).await;
    let mut moved = ctx.manifests.get(entry_id).await?;
    if moved.version != expected_version || moved.content.parent() != from_id {
        return Ok(());
    }
    let mut from = ctx.manifests.get(from_id).await?;
    let mut to = ctx.manifests.get(to_id).await?;
    let now = Utc::now();

    let name = match from.content.as_folder().and_then(|f| f.child_name(entry_id)) {
        Some(name) => name.clone(),
        None => match base_name(ctx, base.parent(), entry_id).await? {
            Some(name) => name,
            None => entry_id.to_string().parse()?,
        },
    };
    if let ManifestContent::Folder(folder) = &mut from.content {
        folder.children.retain(|_, id| *id != entry_id);
        folder.updated = now;
    }
    from.need_sync = true;

    let ManifestContent::Folder(folder) = &mut to.content else {
        return Err(WorkspaceError::Corrupted(format!(
            "entry {} is not a folder",
            to_id
        )));
    };
    let name = if folder.children.contains_key(&name) {
        get_conflict_filename(&name, NAME_CONFLICT_SUFFIX, |n| folder.children.contains_key(n))?
    } else {
        name
    };
    folder.children.insert(name.clone(), entry_id);
    folder.updated = now;
    to.need_sync = true;

    moved.content.set_parent(to_id);
    moved.content.set_updated(now);
    moved.confined = ctx.manifests.confinement().child_confined(to.confined, &name);
    moved.need_sync = true;

    ctx.manifests
        .put_many(vec![
            ManifestUpdate::on_top(from),
            ManifestUpdate::on_top(to),
            ManifestUpdate::new(moved, expected_version),
        ])
        .await?;

    warn!(
        entry_id = %entry_id,
        from = %from_id,
        to = %to_id,
        "Move crosses a remote move, entry put back"
    );
    for id in [from_id, to_id, entry_id] {
        ctx.local_change(id);
    }
    Ok(())
}

/// Name of `entry_id` in the synced version of `parent_id`.
async fn base_name(ctx: &WorkspaceContext, parent_id: EntryId, entry_id: EntryId) -> Result<Option<EntryName>> {
    Ok(ctx
        .manifests
        .try_get(parent_id)
        .await?
        .and_then(|parent| parent.base)
        .and_then(|base| base.as_folder().and_then(|f| f.child_name(entry_id)).cloned()))
}

/// Bring one dirty entry in sync with the remote.
///
/// Only the entry itself is locked while talking to the remote; the parent
/// is locked just long enough to commit a fork into it.
pub async fn sync_entry(ctx: &WorkspaceContext, entry_id: EntryId) -> Result<EntrySyncOutcome> {
    let mut outcome = EntrySyncOutcome::default();
    let mut started = false;
    let rounds = ctx.config.sync.max_rounds_per_entry;

    for round in 0..rounds {
        let guard = ctx.locks.lock(entry_id).await;
        let local = ctx.manifests.get(entry_id).await?;
        if !local.is_syncable() {
            return Ok(outcome);
        }
        if !started {
            started = true;
            ctx.events.emit(WorkspaceEvent::SyncStarted {
                workspace_id: ctx.workspace_id,
                entry_id,
            });
        }

        if crosses_remote_move(ctx, &local).await? {
            drop(guard);
            undo_local_move(ctx, entry_id, local.version).await?;
            outcome.conflicts += 1;
            continue;
        }

        match fetch_newer(ctx, entry_id, local.base_version).await? {
            Some(remote) => {
                let remote_version = remote.version;
                let merged = merge_remote_into_local(
                    &local,
                    &remote,
                    ctx.device_id,
                    ctx.manifests.confinement(),
                    Utc::now(),
                )?;
                let (conflicts, need_sync) = match merged.fork.as_ref().map(|f| f.parent) {
                    None => commit_merge(ctx, &local, remote_version, merged).await?,
                    Some(parent_id) => {
                        drop(guard);
                        let _guards = ctx.locks.lock_many([entry_id, parent_id]).await;
                        if ctx.manifests.get(entry_id).await?.version != local.version {
                            // changed while relocking, merge again
                            continue;
                        }
                        commit_merge(ctx, &local, remote_version, merged).await?
                    }
                };
                outcome.conflicts += conflicts;
                if !need_sync {
                    outcome.remote_version = Some(remote_version);
                    return Ok(outcome);
                }
            }
            None => match push_local(ctx, &local).await? {
                PushOutcome::Pushed(version) => {
                    outcome.remote_version = Some(version);
                    return Ok(outcome);
                }
                PushOutcome::Conflict => {
                    debug!(entry_id = %entry_id, round, "Push rejected, merging");
                }
            },
        }
    }

    let actual = ctx
        .manifests
        .get(entry_id)
        .await
        .map(|m| m.base_version)
        .unwrap_or_default();
    Err(WorkspaceError::VersionConflict {
        entry_id,
        expected: actual,
        actual: actual + 1,
    })
}

/// Dirty entries grouped by depth, deepest group last.
async fn group_by_depth(
    ctx: &WorkspaceContext,
    ids: Vec<EntryId>,
) -> Result<BTreeMap<usize, Vec<EntryId>>> {
    let mut levels: BTreeMap<usize, Vec<EntryId>> = BTreeMap::new();
    for id in ids {
        let depth = match ctx.manifests.depth_of(id).await {
            Ok(depth) => depth,
            Err(e) if e.is_fatal() => return Err(e),
            // detached entry: its own sync attempt reports the problem
            Err(_) => 0,
        };
        levels.entry(depth).or_default().push(id);
    }
    Ok(levels)
}

/// One outbound pass over the Dirty Set.
///
/// Entries failing with a non-fatal error are reported and stay dirty; a
/// fatal error aborts the pass.
pub async fn outbound_pass(ctx: &WorkspaceContext) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let mut attempted: HashSet<EntryId> = HashSet::new();
    let concurrency = ctx.config.sync.max_concurrent_block_uploads;

    // entries dirtied during the pass (a fork's parent) get another sweep
    for _ in 0..ctx.config.sync.max_rounds_per_entry {
        let dirty: Vec<EntryId> = ctx
            .cache
            .dirty_entries()
            .await?
            .into_iter()
            .filter(|id| !attempted.contains(id))
            .collect();
        if dirty.is_empty() {
            break;
        }
        debug!(entries = dirty.len(), "Outbound sweep");

        let levels = group_by_depth(ctx, dirty).await?;
        for (_, ids) in levels.into_iter().rev() {
            let attempts: Vec<_> = ids
                .into_iter()
                .map(|id| async move { (id, sync_entry(ctx, id).await) })
                .collect();
            let results: Vec<(EntryId, Result<EntrySyncOutcome>)> = stream::iter(attempts)
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for (id, result) in results {
                attempted.insert(id);
                match result {
                    Ok(outcome) => {
                        report.conflicts += outcome.conflicts;
                        if outcome.remote_version.is_some() {
                            report.synced += 1;
                        }
                    }
                    Err(e) if e.is_fatal() || matches!(e, WorkspaceError::Cancelled) => {
                        return Err(e)
                    }
                    Err(e) => {
                        warn!(entry_id = %id, error = %e, "Outbound sync failed");
                        ctx.events.emit(WorkspaceEvent::SyncFailed {
                            workspace_id: ctx.workspace_id,
                            entry_id: id,
                            error: e.to_string(),
                            transient: e.is_transient(),
                        });
                        report.failed.push((id, e.to_string()));
                    }
                }
            }
        }
    }
    Ok(report)
}
