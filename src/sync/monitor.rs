//! Background sync monitors of a workspace session
//!
//! - the outbound monitor wakes on local changes, lets a burst of writes
//!   settle for `outbound_debounce_ms`, then runs an outbound pass; entries
//!   left dirty by transient failures are retried every poll interval
//! - the inbound monitor runs an inbound pass every poll interval and on
//!   remote change notifications
//!
//! A fatal error stops both monitors and is published as `SyncHalted`; local
//! filesystem operations keep working.

use crate::error::{Result, WorkspaceError};
use crate::events::WorkspaceEvent;
use crate::sync::inbound::inbound_pass;
use crate::sync::outbound::outbound_pass;
use crate::sync::report::SyncReport;
use crate::utils::cancellation::cancellable;
use crate::workspace::WorkspaceContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub fn spawn_monitors(ctx: Arc<WorkspaceContext>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(outbound_monitor(ctx.clone())),
        tokio::spawn(inbound_monitor(ctx)),
    ]
}

/// Stop syncing the workspace after a fatal error.
pub fn halt(ctx: &WorkspaceContext, err: &WorkspaceError) {
    error!(
        workspace_id = %ctx.workspace_id,
        error = %err,
        "Fatal error, halting workspace sync"
    );
    ctx.events.emit(WorkspaceEvent::SyncHalted {
        workspace_id: ctx.workspace_id,
        error: err.to_string(),
    });
    ctx.sync_token.cancel();
}

/// Outcome of a pass run by a monitor: `None` means stop monitoring.
fn handle_pass(ctx: &WorkspaceContext, direction: &str, result: Result<SyncReport>) -> Option<bool> {
    match result {
        Ok(report) => Some(!report.is_clean()),
        Err(WorkspaceError::Cancelled) => None,
        Err(e) if e.is_fatal() => {
            halt(ctx, &e);
            None
        }
        Err(e) => {
            warn!(direction, error = %e, "Sync pass failed");
            Some(true)
        }
    }
}

async fn outbound_monitor(ctx: Arc<WorkspaceContext>) {
    let debounce = Duration::from_millis(ctx.config.sync.outbound_debounce_ms);
    let retry_after = Duration::from_millis(ctx.config.sync.inbound_poll_interval_ms);
    let mut has_failures = false;
    info!(workspace_id = %ctx.workspace_id, "Outbound sync monitor started");

    loop {
        let retry_timer = async {
            if has_failures {
                tokio::time::sleep(retry_after).await
            } else {
                std::future::pending::<()>().await
            }
        };
        tokio::select! {
            _ = ctx.sync_token.cancelled() => break,
            _ = ctx.outbound_wakeup.notified() => {}
            _ = retry_timer => {}
        }
        tokio::select! {
            _ = ctx.sync_token.cancelled() => break,
            _ = tokio::time::sleep(debounce) => {}
        }

        let result = cancellable(&ctx.sync_token, outbound_pass(&ctx)).await;
        match handle_pass(&ctx, "outbound", result) {
            Some(failures) => has_failures = failures,
            None => break,
        }
    }
    info!(workspace_id = %ctx.workspace_id, "Outbound sync monitor stopped");
}

async fn inbound_monitor(ctx: Arc<WorkspaceContext>) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(ctx.config.sync.inbound_poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(workspace_id = %ctx.workspace_id, "Inbound sync monitor started");

    loop {
        tokio::select! {
            _ = ctx.sync_token.cancelled() => break,
            _ = ticker.tick() => {}
            _ = ctx.inbound_wakeup.notified() => {}
        }

        let result = cancellable(&ctx.sync_token, inbound_pass(&ctx)).await;
        if handle_pass(&ctx, "inbound", result).is_none() {
            break;
        }
    }
    info!(workspace_id = %ctx.workspace_id, "Inbound sync monitor stopped");
}
