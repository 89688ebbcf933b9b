//! File descriptor operations
//!
//! Reads and writes go straight to the local cache: they work offline and
//! are visible to every descriptor of the entry as soon as they return.
//! Each write or resize commits one new local version of the file manifest
//! under the entry lock.

use crate::error::{Result, WorkspaceError};
use crate::models::{EntryId, EntryKind, FileDescriptor, FsPath, ManifestContent};
use crate::workspace::fd::OpenOptions;
use crate::workspace::file_ops;
use crate::workspace::session::{retry_on_conflict, WorkspaceSession};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdStat {
    pub entry_id: EntryId,
    pub size: u64,
    pub version: u64,
    pub need_sync: bool,
    pub cursor: u64,
}

impl WorkspaceSession {
    /// Open the file at `path` and return a new descriptor.
    ///
    /// # Errors
    ///
    /// * `InvalidOpenOptions` - truncate on a read-only descriptor
    /// * `EntryNotFound` - missing file without `create`
    /// * `EntryExists` - existing file with `create_new`
    /// * `NotAFile` - the path is a folder
    pub async fn open_file(&self, path: &str, options: OpenOptions) -> Result<FileDescriptor> {
        options.validate()?;
        self.ctx.ensure_running()?;
        let path: FsPath = path.parse()?;
        if path.is_root() {
            return Err(WorkspaceError::NotAFile {
                path: path.to_string(),
            });
        }

        let manifests = &self.ctx.manifests;
        let (entry_id, created) = match manifests.resolve_path(&path).await {
            Ok(_) if options.create_new => {
                return Err(WorkspaceError::EntryExists {
                    path: path.to_string(),
                })
            }
            Ok(manifest) => (manifest.id(), false),
            Err(WorkspaceError::EntryNotFound { .. }) if options.create || options.create_new => {
                let target = &path;
                match retry_on_conflict(move || self.try_create_entry(target, EntryKind::File))
                    .await
                {
                    Ok(id) => (id, true),
                    // lost the race against another creator
                    Err(WorkspaceError::EntryExists { .. }) if !options.create_new => {
                        (manifests.resolve_path(&path).await?.id(), false)
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let manifest = manifests.get(entry_id).await?;
        if manifest.kind() != EntryKind::File {
            return Err(WorkspaceError::NotAFile {
                path: path.to_string(),
            });
        }
        if options.truncate && !created {
            self.resize_entry(entry_id, 0).await?;
        }

        let fd = self.ctx.fds.insert(entry_id, options);
        debug!(fd = %fd, entry_id = %entry_id, path = %path, created, "Opened file");
        Ok(fd)
    }

    /// Read up to `size` bytes at `offset`; an empty result means end of file.
    pub async fn fd_read(&self, fd: FileDescriptor, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.ctx.ensure_running()?;
        let state = self.ctx.fds.get_readable(fd)?;
        let manifest = self.ctx.manifests.get(state.entry_id).await?;
        let ManifestContent::File(file) = &manifest.content else {
            return Err(WorkspaceError::NotAFile {
                path: state.entry_id.to_string(),
            });
        };
        let data = file_ops::read_range(&self.ctx.blocks, file, offset, size).await?;
        self.ctx.fds.set_cursor(fd, offset + data.len() as u64);
        Ok(data)
    }

    /// Write `data` at `offset` (at end of file for an append descriptor).
    ///
    /// Returns the number of bytes written, always `data.len()` on success.
    ///
    /// # Errors
    ///
    /// `ReadOnlyDescriptor` for a descriptor opened without write access,
    /// `FileTooLarge` if the write would end past `u64::MAX`.
    pub async fn fd_write(&self, fd: FileDescriptor, offset: u64, data: &[u8]) -> Result<usize> {
        self.ctx.ensure_running()?;
        let state = self.ctx.fds.get_writable(fd)?;
        if data.is_empty() {
            return Ok(0);
        }
        let at = if state.options.append { None } else { Some(offset) };
        let entry_id = state.entry_id;

        let end = retry_on_conflict(move || self.write_entry(entry_id, at, data)).await?;
        self.ctx.fds.set_cursor(fd, end);
        Ok(data.len())
    }

    pub async fn fd_resize(&self, fd: FileDescriptor, length: u64) -> Result<()> {
        self.ctx.ensure_running()?;
        let state = self.ctx.fds.get_writable(fd)?;
        self.resize_entry(state.entry_id, length).await
    }

    /// Every write is committed when it returns: flushing only checks `fd`.
    pub async fn fd_flush(&self, fd: FileDescriptor) -> Result<()> {
        self.ctx.ensure_running()?;
        self.ctx.fds.get(fd).map(|_| ())
    }

    pub async fn fd_stat(&self, fd: FileDescriptor) -> Result<FdStat> {
        self.ctx.ensure_running()?;
        let state = self.ctx.fds.get(fd)?;
        let manifest = self.ctx.manifests.get(state.entry_id).await?;
        let size = manifest.content.as_file().map(|f| f.size).unwrap_or(0);
        Ok(FdStat {
            entry_id: state.entry_id,
            size,
            version: manifest.version,
            need_sync: manifest.need_sync,
            cursor: state.cursor,
        })
    }

    pub async fn fd_close(&self, fd: FileDescriptor) -> Result<()> {
        let state = self.ctx.fds.close(fd)?;
        debug!(fd = %fd, entry_id = %state.entry_id, "Closed file");
        Ok(())
    }

    /// Commit one write; returns the file offset right after the written bytes.
    async fn write_entry(&self, entry_id: EntryId, offset: Option<u64>, data: &[u8]) -> Result<u64> {
        let ctx = &self.ctx;
        let _guard = ctx.locks.lock(entry_id).await;
        let mut manifest = ctx.manifests.get(entry_id).await?;
        let expected = manifest.version;
        let ManifestContent::File(file) = &mut manifest.content else {
            return Err(WorkspaceError::NotAFile {
                path: entry_id.to_string(),
            });
        };

        let at = offset.unwrap_or(file.size);
        let end = file_ops::write_range(&ctx.blocks, file, at, data).await?;
        file.updated = Utc::now();
        manifest.need_sync = true;
        ctx.manifests.put(manifest, expected).await?;

        ctx.local_change(entry_id);
        Ok(end)
    }

    async fn resize_entry(&self, entry_id: EntryId, length: u64) -> Result<()> {
        retry_on_conflict(move || async move {
            let ctx = &self.ctx;
            let _guard = ctx.locks.lock(entry_id).await;
            let mut manifest = ctx.manifests.get(entry_id).await?;
            let expected = manifest.version;
            let ManifestContent::File(file) = &mut manifest.content else {
                return Err(WorkspaceError::NotAFile {
                    path: entry_id.to_string(),
                });
            };
            if file.size == length {
                return Ok(());
            }

            file_ops::resize(&ctx.blocks, file, length).await?;
            file.updated = Utc::now();
            manifest.need_sync = true;
            ctx.manifests.put(manifest, expected).await?;

            ctx.local_change(entry_id);
            Ok(())
        })
        .await
    }
}
