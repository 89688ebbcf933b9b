//! Session Lifecycle Tests
//!
//! Start/stop, persistence of the local cache across sessions, cache
//! eviction, history and event delivery.


use workspace_sync::{
    BlockUnavailableReason, DeviceId, OpenOptions, WorkspaceError, WorkspaceEvent,
    WorkspaceSession,
};
use workspace_test_helpers::{payload, read_file, test_config, write_file, SharedWorkspace};

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_stopped_session_rejects_operations() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        write_file(session, "/f.txt", b"x").await.unwrap();
        let fd = session
            .open_file("/f.txt", OpenOptions::read_only())
            .await
            .unwrap();

        session.stop().await.unwrap();
        // idempotent
        session.stop().await.unwrap();

        assert!(matches!(
            session.stat_entry("/f.txt").await,
            Err(WorkspaceError::Stopped)
        ));
        assert!(matches!(session.sync_now().await, Err(WorkspaceError::Stopped)));
        assert!(matches!(
            session.fd_read(fd, 0, 1).await,
            Err(WorkspaceError::Stopped)
        ));
        // descriptors were closed with the session
        assert!(matches!(
            session.fd_close(fd).await,
            Err(WorkspaceError::BadFileDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let workspace = SharedWorkspace::new();
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.storage.block_size = 100;

        let result = WorkspaceSession::start(
            config,
            workspace.workspace_id,
            workspace.key.clone(),
            DeviceId::new(),
            workspace.remote.clone(),
        )
        .await;
        assert!(matches!(result, Err(WorkspaceError::Config(_))));
    }

    #[tokio::test]
    async fn test_local_changes_survive_restart() {
        let workspace = SharedWorkspace::new();
        workspace.remote.set_offline(true);
        let device = workspace.device().await.unwrap();

        device.session.create_folder("/notes").await.unwrap();
        write_file(&device.session, "/notes/today.md", b"unsynced")
            .await
            .unwrap();
        let mut dirty = device.session.dirty_entries().await.unwrap();
        dirty.sort();
        assert_eq!(dirty.len(), 3);

        let device = workspace.restart(device).await.unwrap();
        let mut after = device.session.dirty_entries().await.unwrap();
        after.sort();
        assert_eq!(after, dirty);
        assert_eq!(
            read_file(&device.session, "/notes/today.md").await.unwrap(),
            b"unsynced"
        );

        workspace.remote.set_offline(false);
        device.session.sync_now().await.unwrap();
        assert!(device.session.dirty_entries().await.unwrap().is_empty());

        let other = workspace.device().await.unwrap();
        assert_eq!(
            read_file(&other.session, "/notes/today.md").await.unwrap(),
            b"unsynced"
        );
        device.session.stop().await.unwrap();
        other.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_report_local_changes() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let mut events = device.session.subscribe();

        let id = device.session.create_file("/watched.txt").await.unwrap();
        let mut seen = false;
        while let Ok(event) = events.try_recv() {
            if event == (WorkspaceEvent::EntryUpdated {
                workspace_id: workspace.workspace_id,
                entry_id: id,
            }) {
                seen = true;
            }
        }
        assert!(seen);

        device.session.sync_now().await.unwrap();
        let mut pushed = false;
        while let Ok(event) = events.try_recv() {
            if let WorkspaceEvent::OutboundSyncDone {
                entry_id,
                remote_version,
                ..
            } = event
            {
                if entry_id == id {
                    assert_eq!(remote_version, 1);
                    pushed = true;
                }
            }
        }
        assert!(pushed);
        device.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_unpushed_blocks_are_never_evicted() {
        let workspace = SharedWorkspace::new();
        workspace.remote.set_offline(true);
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        let data = payload(1_500_000, 9);
        write_file(session, "/large.bin", &data).await.unwrap();

        let usage = session.cache_usage().await.unwrap();
        assert!(usage.bytes > usage.budget);
        assert!(usage.disk_bytes >= usage.bytes);
        assert_eq!(session.evict_to_budget().await.unwrap(), 0);
        assert_eq!(read_file(session, "/large.bin").await.unwrap(), data);

        workspace.remote.set_offline(false);
        session.sync_now().await.unwrap();
        assert!(session.evict_to_budget().await.unwrap() > 0);
        let usage = session.cache_usage().await.unwrap();
        assert!(usage.bytes <= usage.budget);

        // evicted blocks come back from the remote
        assert_eq!(read_file(session, "/large.bin").await.unwrap(), data);
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_block_is_reported() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/remote.bin", &payload(5000, 2))
            .await
            .unwrap();
        alice.session.sync_now().await.unwrap();

        let bob = workspace.device().await.unwrap();
        let fd = bob
            .session
            .open_file("/remote.bin", OpenOptions::read_only())
            .await
            .unwrap();
        workspace.remote.set_offline(true);

        let err = bob.session.fd_read(fd, 0, 5000).await.unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::BlockUnavailable {
                reason: BlockUnavailableReason::Unreachable,
                ..
            }
        ));

        workspace.remote.set_offline(false);
        assert_eq!(bob.session.fd_read(fd, 0, 5000).await.unwrap(), payload(5000, 2));
        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod history_tests {
    use super::*;

    #[tokio::test]
    async fn test_history_keeps_previous_versions() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        write_file(session, "/doc.txt", b"first draft").await.unwrap();
        let first = session.stat_entry("/doc.txt").await.unwrap();
        write_file(session, "/doc.txt", b"second").await.unwrap();

        let history = session.entry_history("/doc.txt").await.unwrap();
        assert!(history.len() >= 3);
        assert!(history.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(history.last().unwrap().size, 6);
        assert!(history.iter().all(|v| !v.tombstone));

        assert_eq!(
            session
                .read_file_version(first.id, first.version, 0, 100)
                .await
                .unwrap(),
            b"first draft"
        );
        assert!(matches!(
            session.read_file_version(first.id, 999, 0, 10).await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_history_from_second_device() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/doc.txt", b"one").await.unwrap();
        alice.session.sync_now().await.unwrap();
        write_file(&alice.session, "/doc.txt", b"two!!").await.unwrap();
        alice.session.sync_now().await.unwrap();
        let id = alice.session.stat_entry("/doc.txt").await.unwrap().id;

        let bob = workspace.device().await.unwrap();
        bob.session.sync_now().await.unwrap();
        assert_eq!(bob.session.stat_entry("/doc.txt").await.unwrap().id, id);
        let history = bob.session.remote_history(id).await.unwrap();
        assert_eq!(
            history.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(history.iter().all(|v| v.author == alice.device_id));
        assert_eq!(history[0].size, 3);
        assert_eq!(history[1].size, 5);

        // bob never had the first version locally
        assert_eq!(
            bob.session.read_remote_version(id, 1, 0, 100).await.unwrap(),
            b"one"
        );
        assert_eq!(
            bob.session.read_remote_version(id, 2, 1, 2).await.unwrap(),
            b"wo"
        );
        assert!(matches!(
            bob.session.read_remote_version(id, 3, 0, 10).await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));
        assert!(matches!(
            bob.session.remote_history(workspace_sync::EntryId::new()).await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));

        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_entry_history_ends_with_tombstone() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        write_file(session, "/gone.txt", b"bye").await.unwrap();
        let stat = session.stat_entry("/gone.txt").await.unwrap();
        session.sync_now().await.unwrap();
        session.remove_file("/gone.txt").await.unwrap();

        let history = session.entry_history_by_id(stat.id).await.unwrap();
        let last = history.last().unwrap();
        assert!(last.tombstone);
        assert!(!last.need_sync);
        assert!(matches!(
            session.entry_history("/gone.txt").await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));

        // removals are not pushed: the remote keeps the last synced version
        session.sync_now().await.unwrap();
        assert_eq!(workspace.remote.latest_version(stat.id), Some(1));
        assert!(matches!(
            session.entry_history_by_id(workspace_sync::EntryId::new()).await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));
        device.session.stop().await.unwrap();
    }
}
