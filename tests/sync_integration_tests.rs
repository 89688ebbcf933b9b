//! Sync Integration Tests
//!
//! Several devices of one workspace sharing an in-memory remote. Background
//! monitors are slowed down, every exchange is driven with `sync_now`, and
//! assertions check the converged state rather than pass counters.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use workspace_sync::sync::CONTENT_CONFLICT_SUFFIX;
use workspace_sync::{MoveEntryMode, OpenOptions, WorkspaceError, WorkspaceEvent};
use workspace_test_helpers::{list, payload, read_file, write_file, SharedWorkspace};

#[cfg(test)]
mod propagation_tests {
    use super::*;

    #[tokio::test]
    async fn test_changes_reach_second_device() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        let bob = workspace.device().await.unwrap();

        alice.session.create_folder("/shared/docs").await.unwrap();
        write_file(&alice.session, "/shared/docs/plan.md", b"# plan")
            .await
            .unwrap();
        let report = alice.session.sync_now().await.unwrap();
        assert!(report.is_clean());
        assert!(alice.session.dirty_entries().await.unwrap().is_empty());

        bob.session.sync_now().await.unwrap();
        assert_eq!(list(&bob.session, "/").await.unwrap(), vec!["shared"]);
        assert_eq!(
            read_file(&bob.session, "/shared/docs/plan.md").await.unwrap(),
            b"# plan"
        );

        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_and_removal_propagate() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/a.txt", b"v1").await.unwrap();
        write_file(&alice.session, "/b.txt", b"keep").await.unwrap();
        alice.session.sync_now().await.unwrap();

        let bob = workspace.device().await.unwrap();
        assert_eq!(read_file(&bob.session, "/a.txt").await.unwrap(), b"v1");

        write_file(&alice.session, "/a.txt", b"v2").await.unwrap();
        alice.session.remove_file("/b.txt").await.unwrap();
        alice.session.sync_now().await.unwrap();

        bob.session.sync_now().await.unwrap();
        assert_eq!(read_file(&bob.session, "/a.txt").await.unwrap(), b"v2");
        assert_eq!(list(&bob.session, "/").await.unwrap(), vec!["a.txt"]);

        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_notification_is_applied() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/note.txt", b"first").await.unwrap();
        alice.session.sync_now().await.unwrap();

        let bob = workspace.device().await.unwrap();
        let id = bob.session.stat_entry("/note.txt").await.unwrap().id;

        write_file(&alice.session, "/note.txt", b"second").await.unwrap();
        alice.session.sync_now().await.unwrap();

        bob.session.notify_remote_change(id);
        bob.session.sync_now().await.unwrap();
        assert_eq!(read_file(&bob.session, "/note.txt").await.unwrap(), b"second");

        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_move_pushes_no_blocks() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/data.bin", &payload(3 * 4096, 1))
            .await
            .unwrap();
        alice.session.sync_now().await.unwrap();
        assert_eq!(workspace.remote.block_push_count(), 3);

        alice.session.create_folder("/archive").await.unwrap();
        alice
            .session
            .move_entry(
                "/data.bin",
                "/archive/data.bin",
                workspace_sync::MoveEntryMode::NoReplace,
            )
            .await
            .unwrap();
        alice.session.sync_now().await.unwrap();
        assert_eq!(workspace.remote.block_push_count(), 3);

        let bob = workspace.device().await.unwrap();
        assert_eq!(
            read_file(&bob.session, "/archive/data.bin").await.unwrap(),
            payload(3 * 4096, 1)
        );
        assert_eq!(list(&bob.session, "/").await.unwrap(), vec!["archive"]);
        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod conflict_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_creations_are_unioned() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        let bob = workspace.device().await.unwrap();

        write_file(&alice.session, "/from-alice.txt", b"a").await.unwrap();
        write_file(&bob.session, "/from-bob.txt", b"b").await.unwrap();

        alice.session.sync_now().await.unwrap();
        bob.session.sync_now().await.unwrap();
        alice.session.sync_now().await.unwrap();

        let expected = vec!["from-alice.txt", "from-bob.txt"];
        assert_eq!(list(&alice.session, "/").await.unwrap(), expected);
        assert_eq!(list(&bob.session, "/").await.unwrap(), expected);
        assert_eq!(read_file(&alice.session, "/from-bob.txt").await.unwrap(), b"b");

        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_name_creations_keep_both() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        let bob = workspace.device().await.unwrap();

        write_file(&alice.session, "/doc.txt", b"alice").await.unwrap();
        write_file(&bob.session, "/doc.txt", b"bob").await.unwrap();

        alice.session.sync_now().await.unwrap();
        let report = bob.session.sync_now().await.unwrap();
        assert!(report.conflicts >= 1);
        alice.session.sync_now().await.unwrap();

        let names = list(&alice.session, "/").await.unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"doc.txt".to_string()));
        assert_eq!(names, list(&bob.session, "/").await.unwrap());

        let mut contents = HashSet::new();
        for name in &names {
            contents.insert(read_file(&alice.session, &format!("/{}", name)).await.unwrap());
        }
        let expected: HashSet<Vec<u8>> = [b"alice".to_vec(), b"bob".to_vec()].into();
        assert_eq!(contents, expected);

        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_edits_fork_the_file() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/shared.txt", b"base").await.unwrap();
        alice.session.sync_now().await.unwrap();

        let bob = workspace.device().await.unwrap();
        assert_eq!(read_file(&bob.session, "/shared.txt").await.unwrap(), b"base");
        let mut events = bob.session.subscribe();

        write_file(&alice.session, "/shared.txt", b"from alice").await.unwrap();
        write_file(&bob.session, "/shared.txt", b"from bob").await.unwrap();
        alice.session.sync_now().await.unwrap();
        bob.session.sync_now().await.unwrap();
        alice.session.sync_now().await.unwrap();

        let fork_name = format!("shared ({}).txt", CONTENT_CONFLICT_SUFFIX);
        for session in [&alice.session, &bob.session] {
            assert_eq!(
                list(session, "/").await.unwrap(),
                vec![fork_name.clone(), "shared.txt".to_string()]
            );
            assert_eq!(read_file(session, "/shared.txt").await.unwrap(), b"from alice");
            assert_eq!(
                read_file(session, &format!("/{}", fork_name)).await.unwrap(),
                b"from bob"
            );
        }

        let mut forked = false;
        while let Ok(event) = events.try_recv() {
            if let WorkspaceEvent::EntryForked { fork_name: name, .. } = event {
                assert_eq!(name, fork_name);
                forked = true;
            }
        }
        assert!(forked);

        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod crossed_move_tests {
    use super::*;

    #[tokio::test]
    async fn test_crossed_folder_moves_keep_both_folders() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        let bob = workspace.device().await.unwrap();

        alice.session.create_folder("/x").await.unwrap();
        alice.session.create_folder("/y").await.unwrap();
        alice.session.sync_now().await.unwrap();
        bob.session.sync_now().await.unwrap();
        assert_eq!(list(&bob.session, "/").await.unwrap(), vec!["x", "y"]);
        let x_id = alice.session.stat_entry("/x").await.unwrap().id;
        let y_id = alice.session.stat_entry("/y").await.unwrap().id;

        // each move alone is valid, together they would form a cycle
        alice
            .session
            .move_entry("/x", "/y/x", MoveEntryMode::NoReplace)
            .await
            .unwrap();
        bob.session
            .move_entry("/y", "/x/y", MoveEntryMode::NoReplace)
            .await
            .unwrap();

        alice.session.sync_now().await.unwrap();
        let report = bob.session.sync_now().await.unwrap();
        assert!(report.conflicts >= 1);
        alice.session.sync_now().await.unwrap();

        for session in [&alice.session, &bob.session] {
            assert_eq!(list(session, "/").await.unwrap(), vec!["y"]);
            assert_eq!(list(session, "/y").await.unwrap(), vec!["x"]);
            assert!(list(session, "/y/x").await.unwrap().is_empty());
            assert_eq!(session.stat_entry("/y").await.unwrap().id, y_id);
            assert_eq!(session.stat_entry("/y/x").await.unwrap().id, x_id);
        }
        assert!(bob.session.dirty_entries().await.unwrap().is_empty());

        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_runs_on_spawned_task() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/spawned.txt", b"x").await.unwrap();

        let session = Arc::new(alice.session);
        let report = tokio::spawn({
            let session = session.clone();
            async move { session.sync_now().await }
        })
        .await
        .unwrap()
        .unwrap();
        assert!(report.is_clean());
        assert!(session.dirty_entries().await.unwrap().is_empty());
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutation_waits_for_entry_upload() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/big.bin", &payload(2 * 4096, 3))
            .await
            .unwrap();
        let id = alice.session.stat_entry("/big.bin").await.unwrap().id;
        let fd = alice
            .session
            .open_file("/big.bin", OpenOptions::read_write())
            .await
            .unwrap();
        let session = Arc::new(alice.session);

        workspace.remote.hold_block_pushes(true);
        let sync = tokio::spawn({
            let session = session.clone();
            async move { session.sync_now().await }
        });
        while workspace.remote.held_block_push_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // the parent folder stays available while its child uploads
        tokio::time::timeout(Duration::from_secs(5), session.create_file("/other.txt"))
            .await
            .unwrap()
            .unwrap();

        let writer = tokio::spawn({
            let session = session.clone();
            async move { session.fd_write(fd, 0, b"new").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());

        workspace.remote.hold_block_pushes(false);
        let report = sync.await.unwrap().unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(writer.await.unwrap().unwrap(), 3);

        // the queued write landed after the push and is pending again
        assert_eq!(workspace.remote.latest_version(id), Some(1));
        assert!(session.dirty_entries().await.unwrap().contains(&id));
        assert_eq!(session.fd_read(fd, 0, 3).await.unwrap(), b"new");
        session.fd_close(fd).await.unwrap();

        session.sync_now().await.unwrap();
        assert_eq!(workspace.remote.latest_version(id), Some(2));
        let bob = workspace.device().await.unwrap();
        let mut expected = payload(2 * 4096, 3);
        expected[..3].copy_from_slice(b"new");
        assert_eq!(read_file(&bob.session, "/big.bin").await.unwrap(), expected);

        session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_child_does_not_block_parent() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        alice.session.create_folder("/docs").await.unwrap();
        write_file(&alice.session, "/docs/ok.txt", b"fine").await.unwrap();
        write_file(&alice.session, "/docs/locked.txt", b"nope")
            .await
            .unwrap();
        let docs = alice.session.stat_entry("/docs").await.unwrap().id;
        let ok = alice.session.stat_entry("/docs/ok.txt").await.unwrap().id;
        let locked = alice.session.stat_entry("/docs/locked.txt").await.unwrap().id;

        workspace.remote.deny_manifest_pushes_for(locked);
        let report = alice.session.sync_now().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, locked);
        assert!(!alice.session.is_sync_halted());

        assert_eq!(workspace.remote.latest_version(ok), Some(1));
        assert_eq!(workspace.remote.latest_version(docs), Some(1));
        assert_eq!(workspace.remote.latest_version(locked), None);
        assert_eq!(alice.session.dirty_entries().await.unwrap(), vec![locked]);
        alice.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod resilience_tests {
    use super::*;

    #[tokio::test]
    async fn test_lost_reply_does_not_duplicate_version() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        alice.session.sync_now().await.unwrap();

        write_file(&alice.session, "/once.txt", b"payload").await.unwrap();
        let id = alice.session.stat_entry("/once.txt").await.unwrap().id;
        workspace.remote.lose_next_manifest_replies(1);

        let report = alice.session.sync_now().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(workspace.remote.latest_version(id), Some(1));
        assert!(alice.session.dirty_entries().await.unwrap().is_empty());

        let stat = alice.session.stat_entry("/once.txt").await.unwrap();
        assert_eq!(stat.base_version, 1);
        assert_eq!(
            alice.session.stat_folder_children("/").await.unwrap().len(),
            1
        );
        alice.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_sync_leaves_entries_dirty() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/later.txt", b"not yet").await.unwrap();
        let id = alice.session.stat_entry("/later.txt").await.unwrap().id;

        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            alice.session.sync_now_until(&cancel).await,
            Err(WorkspaceError::Cancelled)
        ));
        assert!(alice.session.dirty_entries().await.unwrap().contains(&id));
        assert_eq!(workspace.remote.latest_version(id), None);

        let report = alice
            .session
            .sync_now_until(&tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(workspace.remote.latest_version(id), Some(1));
        alice.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_push_failures_are_retried() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/retry.txt", b"x").await.unwrap();
        let id = alice.session.stat_entry("/retry.txt").await.unwrap().id;

        workspace.remote.fail_next_manifest_pushes(2);
        let report = alice.session.sync_now().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(workspace.remote.latest_version(id), Some(1));
        assert!(alice.session.dirty_entries().await.unwrap().is_empty());
        alice.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_keeps_entries_dirty() {
        let workspace = SharedWorkspace::new();
        workspace.remote.set_offline(true);
        let alice = workspace.device().await.unwrap();

        // everything works locally
        write_file(&alice.session, "/offline.txt", b"local").await.unwrap();
        assert_eq!(read_file(&alice.session, "/offline.txt").await.unwrap(), b"local");
        assert!(matches!(
            alice.session.sync_now().await,
            Err(WorkspaceError::Offline(_))
        ));
        assert!(!alice.session.dirty_entries().await.unwrap().is_empty());

        workspace.remote.set_offline(false);
        alice.session.sync_now().await.unwrap();
        assert!(alice.session.dirty_entries().await.unwrap().is_empty());

        let bob = workspace.device().await.unwrap();
        assert_eq!(read_file(&bob.session, "/offline.txt").await.unwrap(), b"local");
        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_denied_writes_leave_entries_dirty() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();
        write_file(&alice.session, "/guarded.txt", b"x").await.unwrap();

        workspace.remote.deny_writes(Some("reader role".to_string()));
        let report = alice.session.sync_now().await.unwrap();
        assert!(!report.is_clean());
        assert!(!alice.session.is_sync_halted());
        assert!(!alice.session.dirty_entries().await.unwrap().is_empty());

        workspace.remote.deny_writes(None);
        let report = alice.session.sync_now().await.unwrap();
        assert!(report.is_clean());
        assert!(alice.session.dirty_entries().await.unwrap().is_empty());
        alice.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod confinement_tests {
    use super::*;

    #[tokio::test]
    async fn test_confined_entries_stay_local() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();

        write_file(&alice.session, "/draft.tmp", b"scratch").await.unwrap();
        write_file(&alice.session, "/final.txt", b"done").await.unwrap();
        let draft = alice.session.stat_entry("/draft.tmp").await.unwrap();
        assert!(draft.confined);

        alice.session.sync_now().await.unwrap();
        assert_eq!(workspace.remote.latest_version(draft.id), None);
        assert!(alice.session.dirty_entries().await.unwrap().is_empty());
        assert_eq!(
            list(&alice.session, "/").await.unwrap(),
            vec!["draft.tmp", "final.txt"]
        );

        let bob = workspace.device().await.unwrap();
        assert_eq!(list(&bob.session, "/").await.unwrap(), vec!["final.txt"]);
        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_moving_out_of_confinement_syncs_entry() {
        let workspace = SharedWorkspace::new();
        let alice = workspace.device().await.unwrap();

        write_file(&alice.session, "/report.tmp", b"body").await.unwrap();
        alice.session.sync_now().await.unwrap();
        alice
            .session
            .move_entry(
                "/report.tmp",
                "/report.txt",
                workspace_sync::MoveEntryMode::NoReplace,
            )
            .await
            .unwrap();
        let stat = alice.session.stat_entry("/report.txt").await.unwrap();
        assert!(!stat.confined);
        assert!(stat.need_sync);

        alice.session.sync_now().await.unwrap();
        let bob = workspace.device().await.unwrap();
        assert_eq!(read_file(&bob.session, "/report.txt").await.unwrap(), b"body");
        alice.session.stop().await.unwrap();
        bob.session.stop().await.unwrap();
    }
}
