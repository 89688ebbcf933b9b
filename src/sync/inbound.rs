//! Inbound sync: apply remote changes to clean local entries
//!
//! Candidates come from the remote change feed (from the stored checkpoint)
//! and from explicit notifications. Entries never fetched locally are left
//! alone, they are fetched on demand. Entries with local changes are handed
//! to the outbound side, which merges.

use crate::error::{Result, WorkspaceError};
use crate::events::WorkspaceEvent;
use crate::models::EntryId;
use crate::sync::merge::adopt_remote;
use crate::sync::outbound::fetch_newer;
use crate::sync::report::SyncReport;
use crate::utils::retry::{retry_transient, with_timeout};
use crate::workspace::WorkspaceContext;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Applied(u64),
    /// Dirty locally: left to the outbound merge.
    Deferred,
    Skipped,
}

/// Apply the remote version of one entry if it is newer and the entry clean.
pub async fn apply_remote_change(
    ctx: &WorkspaceContext,
    entry_id: EntryId,
    known_version: Option<u64>,
) -> Result<InboundOutcome> {
    let Some(local) = ctx.manifests.try_get(entry_id).await? else {
        return Ok(InboundOutcome::Skipped);
    };
    if local.confined || local.tombstone {
        return Ok(InboundOutcome::Skipped);
    }
    if known_version.is_some_and(|v| v <= local.base_version) {
        return Ok(InboundOutcome::Skipped);
    }
    if local.need_sync {
        ctx.outbound_wakeup.notify_one();
        return Ok(InboundOutcome::Deferred);
    }

    let Some(remote) = fetch_newer(ctx, entry_id, local.base_version).await? else {
        return Ok(InboundOutcome::Skipped);
    };

    let _guard = ctx.locks.lock(entry_id).await;
    let current = ctx.manifests.get(entry_id).await?;
    if current.need_sync {
        ctx.outbound_wakeup.notify_one();
        return Ok(InboundOutcome::Deferred);
    }
    if current.tombstone || current.base_version >= remote.version {
        return Ok(InboundOutcome::Skipped);
    }

    let remote_version = remote.version;
    let updated = adopt_remote(&current, remote, ctx.manifests.confinement())?;
    ctx.manifests.put(updated, current.version).await?;

    debug!(entry_id = %entry_id, remote_version, "Applied remote version");
    ctx.events.emit(WorkspaceEvent::InboundSyncDone {
        workspace_id: ctx.workspace_id,
        entry_id,
        remote_version,
    });
    ctx.events.emit(WorkspaceEvent::EntryUpdated {
        workspace_id: ctx.workspace_id,
        entry_id,
    });
    Ok(InboundOutcome::Applied(remote_version))
}

/// One inbound pass. The checkpoint only advances when every change was
/// handled, so a failed entry is seen again by the next pass.
pub async fn inbound_pass(ctx: &WorkspaceContext) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let checkpoint = ctx.cache.checkpoint().await?;
    let limit = ctx.remote_timeout();

    let feed = retry_transient(&ctx.retry, "poll_changes", move || async move {
        with_timeout(limit, ctx.remote.poll_changes(checkpoint))
            .await
            .map_err(WorkspaceError::from)
    })
    .await?;

    let mut candidates: BTreeMap<EntryId, Option<u64>> = BTreeMap::new();
    for (entry_id, version) in &feed.changes {
        let known = candidates.entry(*entry_id).or_insert(Some(*version));
        *known = known.map(|v| v.max(*version));
    }
    let notified = ctx.take_remote_changes();
    for entry_id in &notified {
        // version unknown: fetch whatever is newer than the local base
        candidates.insert(*entry_id, None);
    }

    let mut complete = true;
    for (entry_id, known_version) in candidates {
        match apply_remote_change(ctx, entry_id, known_version).await {
            Ok(InboundOutcome::Applied(_)) => report.applied += 1,
            Ok(InboundOutcome::Deferred) | Ok(InboundOutcome::Skipped) => {}
            Err(e) if e.is_fatal() || matches!(e, WorkspaceError::Cancelled) => return Err(e),
            Err(e) => {
                warn!(entry_id = %entry_id, error = %e, "Inbound sync failed");
                ctx.events.emit(WorkspaceEvent::SyncFailed {
                    workspace_id: ctx.workspace_id,
                    entry_id,
                    error: e.to_string(),
                    transient: e.is_transient(),
                });
                report.failed.push((entry_id, e.to_string()));
                if notified.contains(&entry_id) {
                    ctx.requeue_remote_change(entry_id);
                }
                complete = false;
            }
        }
    }

    if complete && feed.checkpoint != checkpoint {
        ctx.cache.set_checkpoint(feed.checkpoint).await?;
    }
    if report.applied > 0 {
        info!(applied = report.applied, checkpoint = feed.checkpoint, "Inbound pass done");
    }
    Ok(report)
}
