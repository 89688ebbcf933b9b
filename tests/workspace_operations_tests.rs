//! Workspace Operations Tests
//!
//! Path level operations on a single device: create, stat, list, remove,
//! move, and the file descriptor lifecycle.


use workspace_sync::{EntryKind, MoveEntryMode, OpenOptions, WorkspaceError, MAX_READ_SIZE};
use workspace_test_helpers::{list, payload, read_file, write_file, SharedWorkspace};

#[cfg(test)]
mod entry_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_stat_entries() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        let folder_id = session.create_folder("/docs").await.unwrap();
        let file_id = session.create_file("/docs/notes.md").await.unwrap();

        let folder = session.stat_entry("/docs").await.unwrap();
        assert_eq!(folder.id, folder_id);
        assert_eq!(folder.kind, EntryKind::Folder);
        assert_eq!(folder.parent, session.root_id());
        assert_eq!(folder.children.len(), 1);
        assert!(folder.need_sync);

        let file = session.stat_entry("/docs/notes.md").await.unwrap();
        assert_eq!(file.id, file_id);
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.parent, folder_id);
        assert_eq!(file.size, 0);

        assert_eq!(session.stat_entry_by_id(file_id).await.unwrap(), file);
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_listing_is_sorted_by_name() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        for name in ["zeta.txt", "alpha.txt", "Mid.txt"] {
            session.create_file(&format!("/{}", name)).await.unwrap();
        }
        session.create_folder("/beta").await.unwrap();

        assert_eq!(
            list(session, "/").await.unwrap(),
            vec!["Mid.txt", "alpha.txt", "beta", "zeta.txt"]
        );
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_folder_makes_missing_parents() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        let leaf = session.create_folder("/a/b/c").await.unwrap();
        assert_eq!(session.stat_entry("/a/b/c").await.unwrap().id, leaf);
        assert_eq!(list(session, "/a").await.unwrap(), vec!["b"]);

        // existing folder: same id, nothing new
        assert_eq!(session.create_folder("/a/b/c").await.unwrap(), leaf);
        assert_eq!(list(session, "/a/b").await.unwrap(), vec!["c"]);
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_errors() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        session.create_file("/file.txt").await.unwrap();
        assert!(matches!(
            session.create_file("/file.txt").await,
            Err(WorkspaceError::EntryExists { .. })
        ));
        assert!(matches!(
            session.create_folder("/file.txt").await,
            Err(WorkspaceError::EntryExists { .. })
        ));
        assert!(matches!(
            session.create_folder("/file.txt/sub").await,
            Err(WorkspaceError::NotADirectory { .. })
        ));
        assert!(matches!(
            session.create_file("/missing/file.txt").await,
            Err(WorkspaceError::ParentNotFound { .. })
        ));
        assert!(matches!(
            session.create_file("relative.txt").await,
            Err(WorkspaceError::InvalidPath(_))
        ));
        assert!(matches!(
            session.stat_entry("/nope").await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_entries() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        session.create_folder("/tree/branch").await.unwrap();
        let leaf = session.create_file("/tree/branch/leaf.txt").await.unwrap();
        session.create_file("/keep.txt").await.unwrap();

        assert!(matches!(
            session.remove_file("/tree").await,
            Err(WorkspaceError::NotAFile { .. })
        ));
        assert!(matches!(
            session.remove_folder_all("/keep.txt").await,
            Err(WorkspaceError::NotADirectory { .. })
        ));
        assert!(matches!(
            session.remove_folder_all("/").await,
            Err(WorkspaceError::CannotRemoveRoot)
        ));

        session.remove_folder_all("/tree").await.unwrap();
        assert_eq!(list(session, "/").await.unwrap(), vec!["keep.txt"]);
        assert!(matches!(
            session.stat_entry("/tree/branch/leaf.txt").await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));
        assert!(matches!(
            session.stat_entry_by_id(leaf).await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));

        session.remove_file("/keep.txt").await.unwrap();
        assert!(list(session, "/").await.unwrap().is_empty());
        device.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod move_tests {
    use super::*;

    #[tokio::test]
    async fn test_rename_keeps_identity_and_content() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        write_file(session, "/draft.txt", b"hello").await.unwrap();
        let id = session.stat_entry("/draft.txt").await.unwrap().id;
        session.create_folder("/final").await.unwrap();

        session
            .move_entry("/draft.txt", "/final/report.txt", MoveEntryMode::NoReplace)
            .await
            .unwrap();

        let moved = session.stat_entry("/final/report.txt").await.unwrap();
        assert_eq!(moved.id, id);
        assert_eq!(read_file(session, "/final/report.txt").await.unwrap(), b"hello");
        assert_eq!(list(session, "/").await.unwrap(), vec!["final"]);
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_move_onto_itself_is_noop() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        session.create_file("/same.txt").await.unwrap();
        let before = session.stat_entry("/same.txt").await.unwrap();
        session
            .move_entry("/same.txt", "/same.txt", MoveEntryMode::NoReplace)
            .await
            .unwrap();
        assert_eq!(session.stat_entry("/same.txt").await.unwrap(), before);
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_move_modes() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        write_file(session, "/new.txt", b"new").await.unwrap();
        write_file(session, "/old.txt", b"old").await.unwrap();
        let old_id = session.stat_entry("/old.txt").await.unwrap().id;

        assert!(matches!(
            session
                .move_entry("/new.txt", "/old.txt", MoveEntryMode::NoReplace)
                .await,
            Err(WorkspaceError::DestinationExists { .. })
        ));

        session
            .move_entry("/new.txt", "/old.txt", MoveEntryMode::CanReplace)
            .await
            .unwrap();
        assert_eq!(read_file(session, "/old.txt").await.unwrap(), b"new");
        assert_eq!(list(session, "/").await.unwrap(), vec!["old.txt"]);

        // the replaced entry is a tombstone with its history kept
        let history = session.entry_history_by_id(old_id).await.unwrap();
        assert!(history.last().unwrap().tombstone);
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_moves() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        session.create_folder("/outer/inner").await.unwrap();
        session.create_folder("/full").await.unwrap();
        session.create_file("/full/item.txt").await.unwrap();
        session.create_file("/plain.txt").await.unwrap();

        assert!(matches!(
            session
                .move_entry("/outer", "/outer/inner/outer", MoveEntryMode::NoReplace)
                .await,
            Err(WorkspaceError::InvalidMove(_))
        ));
        assert!(matches!(
            session.move_entry("/", "/elsewhere", MoveEntryMode::NoReplace).await,
            Err(WorkspaceError::InvalidMove(_))
        ));
        assert!(matches!(
            session
                .move_entry("/outer", "/full", MoveEntryMode::CanReplace)
                .await,
            Err(WorkspaceError::FolderNotEmpty { .. })
        ));
        assert!(matches!(
            session
                .move_entry("/plain.txt", "/outer", MoveEntryMode::CanReplace)
                .await,
            Err(WorkspaceError::NotAFile { .. })
        ));
        assert!(matches!(
            session
                .move_entry("/missing.txt", "/x.txt", MoveEntryMode::NoReplace)
                .await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_folder_move_carries_subtree() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        session.create_folder("/src/nested").await.unwrap();
        write_file(session, "/src/nested/data.bin", &payload(10_000, 3))
            .await
            .unwrap();
        session.create_folder("/dst").await.unwrap();

        session
            .move_entry("/src", "/dst/moved", MoveEntryMode::NoReplace)
            .await
            .unwrap();
        assert_eq!(
            read_file(session, "/dst/moved/nested/data.bin").await.unwrap(),
            payload(10_000, 3)
        );
        assert!(matches!(
            session.stat_entry("/src").await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));
        device.session.stop().await.unwrap();
    }
}

#[cfg(test)]
mod descriptor_tests {
    use super::*;

    #[tokio::test]
    async fn test_open_flags() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        assert!(matches!(
            session.open_file("/absent.txt", OpenOptions::read_only()).await,
            Err(WorkspaceError::EntryNotFound { .. })
        ));

        write_file(session, "/f.txt", b"0123456789").await.unwrap();
        assert!(matches!(
            session
                .open_file("/f.txt", OpenOptions::read_write().with_create_new())
                .await,
            Err(WorkspaceError::EntryExists { .. })
        ));

        // create on an existing file keeps its content
        let fd = session
            .open_file("/f.txt", OpenOptions::read_write().with_create())
            .await
            .unwrap();
        assert_eq!(session.fd_stat(fd).await.unwrap().size, 10);
        session.fd_close(fd).await.unwrap();

        let fd = session
            .open_file("/f.txt", OpenOptions::read_write().with_truncate())
            .await
            .unwrap();
        assert_eq!(session.fd_stat(fd).await.unwrap().size, 0);
        session.fd_close(fd).await.unwrap();

        session.create_folder("/dir").await.unwrap();
        assert!(matches!(
            session.open_file("/dir", OpenOptions::read_only()).await,
            Err(WorkspaceError::NotAFile { .. })
        ));
        assert!(matches!(
            session
                .open_file("/f.txt", OpenOptions::read_only().with_truncate())
                .await,
            Err(WorkspaceError::InvalidOpenOptions(_))
        ));
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_write_at_offsets() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        let fd = session
            .open_file("/sparse.bin", OpenOptions::read_write().with_create_new())
            .await
            .unwrap();
        assert_eq!(session.fd_write(fd, 5000, b"tail").await.unwrap(), 4);

        let stat = session.fd_stat(fd).await.unwrap();
        assert_eq!(stat.size, 5004);
        assert_eq!(stat.cursor, 5004);

        // the gap reads as zeros
        let head = session.fd_read(fd, 0, 10).await.unwrap();
        assert_eq!(head, vec![0u8; 10]);
        assert_eq!(session.fd_read(fd, 5000, 100).await.unwrap(), b"tail");
        assert!(session.fd_read(fd, 6000, 10).await.unwrap().is_empty());

        session.fd_write(fd, 4998, b"XY").await.unwrap();
        assert_eq!(session.fd_read(fd, 4996, 8).await.unwrap(), b"\0\0XYtail");

        session.fd_resize(fd, 4999).await.unwrap();
        assert_eq!(session.fd_stat(fd).await.unwrap().size, 4999);
        assert_eq!(session.fd_read(fd, 4996, 8).await.unwrap(), b"\0\0X");
        session.fd_close(fd).await.unwrap();
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_offsets_near_u64_max() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        let fd = session
            .open_file("/big.bin", OpenOptions::read_write().with_create_new())
            .await
            .unwrap();
        session.fd_write(fd, 0, b"head").await.unwrap();

        assert!(matches!(
            session.fd_write(fd, u64::MAX - 1, b"abcd").await,
            Err(WorkspaceError::FileTooLarge { .. })
        ));
        let stat = session.fd_stat(fd).await.unwrap();
        assert_eq!(stat.size, 4);
        assert_eq!(session.fd_read(fd, 0, 4).await.unwrap(), b"head");

        // a huge sparse file is read in bounded chunks
        session.fd_resize(fd, 1 << 40).await.unwrap();
        let chunk = session.fd_read(fd, 0, u64::MAX).await.unwrap();
        assert_eq!(chunk.len() as u64, MAX_READ_SIZE);
        assert_eq!(&chunk[..4], b"head");
        session.fd_close(fd).await.unwrap();
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_writes_at_end() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        write_file(session, "/log.txt", b"one\n").await.unwrap();
        let fd = session
            .open_file("/log.txt", OpenOptions::read_only().with_append())
            .await
            .unwrap();
        session.fd_write(fd, 0, b"two\n").await.unwrap();
        session.fd_write(fd, 0, b"three\n").await.unwrap();
        session.fd_close(fd).await.unwrap();

        assert_eq!(read_file(session, "/log.txt").await.unwrap(), b"one\ntwo\nthree\n");
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_descriptor_modes_and_close() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        write_file(session, "/f.txt", b"data").await.unwrap();
        let reader = session
            .open_file("/f.txt", OpenOptions::read_only())
            .await
            .unwrap();
        assert!(matches!(
            session.fd_write(reader, 0, b"x").await,
            Err(WorkspaceError::ReadOnlyDescriptor(_))
        ));

        let writer = session
            .open_file("/f.txt", OpenOptions::default().with_append())
            .await
            .unwrap();
        assert!(matches!(
            session.fd_read(writer, 0, 4).await,
            Err(WorkspaceError::WriteOnlyDescriptor(_))
        ));

        // writes are visible to every descriptor at once
        session.fd_write(writer, 0, b"!").await.unwrap();
        assert_eq!(session.fd_read(reader, 0, 10).await.unwrap(), b"data!");

        session.fd_close(reader).await.unwrap();
        assert!(matches!(
            session.fd_read(reader, 0, 1).await,
            Err(WorkspaceError::BadFileDescriptor(_))
        ));
        assert!(matches!(
            session.fd_close(reader).await,
            Err(WorkspaceError::BadFileDescriptor(_))
        ));
        session.fd_flush(writer).await.unwrap();
        session.fd_close(writer).await.unwrap();
        device.session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_block_file_round_trips() {
        let workspace = SharedWorkspace::new();
        let device = workspace.device().await.unwrap();
        let session = &device.session;

        let data = payload(3 * 4096 + 123, 7);
        write_file(session, "/big.bin", &data).await.unwrap();
        assert_eq!(read_file(session, "/big.bin").await.unwrap(), data);

        let fd = session
            .open_file("/big.bin", OpenOptions::read_only())
            .await
            .unwrap();
        // a read spanning a block boundary
        assert_eq!(
            session.fd_read(fd, 4090, 20).await.unwrap(),
            data[4090..4110].to_vec()
        );
        session.fd_close(fd).await.unwrap();
        device.session.stop().await.unwrap();
    }
}
