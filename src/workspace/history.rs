//! Version history of entries
//!
//! Two histories are kept per entry. The local one holds every commit of
//! this device, pushed or not. The remote one holds every version merged by
//! any device and is read back from the remote service up to the entry's
//! `base_version`, so a device sees versions it never had in its cache.

use crate::error::{RemoteError, Result, WorkspaceError};
use crate::models::{DeviceId, EntryId, FsPath, LocalManifest, ManifestContent, RemoteManifest};
use crate::remote::open_manifest;
use crate::utils::retry::{retry_transient, with_timeout};
use crate::workspace::context::WorkspaceContext;
use crate::workspace::file_ops;
use crate::workspace::session::WorkspaceSession;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Remote versions fetched at once when listing a remote history.
const HISTORY_FETCH_CONCURRENCY: usize = 4;

/// One locally committed version of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVersion {
    pub version: u64,
    pub base_version: u64,
    pub updated: DateTime<Utc>,
    pub tombstone: bool,
    pub need_sync: bool,
    /// File size at this version, 0 for a folder.
    pub size: u64,
}

impl From<&LocalManifest> for EntryVersion {
    fn from(manifest: &LocalManifest) -> Self {
        Self {
            version: manifest.version,
            base_version: manifest.base_version,
            updated: manifest.content.updated(),
            tombstone: manifest.tombstone,
            need_sync: manifest.need_sync,
            size: manifest.content.as_file().map(|f| f.size).unwrap_or(0),
        }
    }
}

/// One version of an entry as stored on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntryVersion {
    pub version: u64,
    pub author: DeviceId,
    pub timestamp: DateTime<Utc>,
    /// File size at this version, 0 for a folder.
    pub size: u64,
}

impl From<&RemoteManifest> for RemoteEntryVersion {
    fn from(manifest: &RemoteManifest) -> Self {
        Self {
            version: manifest.version,
            author: manifest.author,
            timestamp: manifest.timestamp,
            size: manifest.content.as_file().map(|f| f.size).unwrap_or(0),
        }
    }
}

fn version_not_found(entry_id: EntryId, version: u64) -> WorkspaceError {
    WorkspaceError::entry_not_found(format!("{} (remote version {})", entry_id, version))
}

async fn fetch_remote_version(
    ctx: &WorkspaceContext,
    entry_id: EntryId,
    version: u64,
) -> Result<RemoteManifest> {
    let limit = ctx.remote_timeout();
    let encrypted = retry_transient(&ctx.retry, "fetch_manifest_version", move || async move {
        match with_timeout(limit, ctx.remote.fetch_manifest_version(entry_id, version)).await {
            Ok(encrypted) => Ok(encrypted),
            Err(RemoteError::NotFound) => Err(version_not_found(entry_id, version)),
            Err(e) => Err(e.into()),
        }
    })
    .await?;
    open_manifest(&ctx.workspace_key, entry_id, &encrypted)
}

impl WorkspaceSession {
    /// Versions of the entry currently at `path`, oldest first.
    pub async fn entry_history(&self, path: &str) -> Result<Vec<EntryVersion>> {
        self.ctx.ensure_running()?;
        let path: FsPath = path.parse()?;
        let entry_id = self.ctx.manifests.resolve_entry_id(&path).await?;
        self.entry_history_by_id(entry_id).await
    }

    /// Versions of an entry, removed ones included.
    pub async fn entry_history_by_id(&self, entry_id: EntryId) -> Result<Vec<EntryVersion>> {
        self.ctx.ensure_running()?;
        let history = self.ctx.manifests.history(entry_id).await?;
        if history.is_empty() {
            return Err(WorkspaceError::entry_not_found(entry_id));
        }
        Ok(history.iter().map(EntryVersion::from).collect())
    }

    /// Read a historical version of a file.
    ///
    /// Blocks of versions that were never pushed may have been dropped from
    /// the cache, such reads fail with `BlockUnavailable`.
    pub async fn read_file_version(
        &self,
        entry_id: EntryId,
        version: u64,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        self.ctx.ensure_running()?;
        let manifest = self.ctx.manifests.load_version(entry_id, version).await?;
        let ManifestContent::File(file) = &manifest.content else {
            return Err(WorkspaceError::NotAFile {
                path: format!("{} (version {})", entry_id, version),
            });
        };
        file_ops::read_range(&self.ctx.blocks, file, offset, size).await
    }

    /// Remote versions of an entry up to the one last merged here, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// `EntryNotFound` if the entry is unknown, transport errors if the
    /// remote cannot be reached.
    pub async fn remote_history(&self, entry_id: EntryId) -> Result<Vec<RemoteEntryVersion>> {
        self.ctx.ensure_running()?;
        let ctx = self.ctx.as_ref();
        let synced = ctx.manifests.get(entry_id).await?.base_version;

        let fetches: Vec<_> = (1..=synced)
            .map(|version| fetch_remote_version(ctx, entry_id, version))
            .collect();
        let versions: Vec<RemoteManifest> = stream::iter(fetches)
            .buffered(HISTORY_FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        debug!(entry_id = %entry_id, versions = versions.len(), "Fetched remote history");
        Ok(versions.iter().map(RemoteEntryVersion::from).collect())
    }

    /// Read a remote version of a file, fetching its blocks as needed.
    ///
    /// # Arguments
    ///
    /// * `entry_id` - The file entry
    /// * `version` - A remote version, at most the entry's `base_version`
    /// * `offset`, `size` - The byte range, clamped like [`fd_read`](Self::fd_read)
    ///
    /// # Errors
    ///
    /// `EntryNotFound` for a version not merged on this device yet, `NotAFile`
    /// if the entry was a folder at that version.
    pub async fn read_remote_version(
        &self,
        entry_id: EntryId,
        version: u64,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        self.ctx.ensure_running()?;
        let ctx = self.ctx.as_ref();
        let synced = ctx.manifests.get(entry_id).await?.base_version;
        if version == 0 || version > synced {
            return Err(version_not_found(entry_id, version));
        }

        let manifest = fetch_remote_version(ctx, entry_id, version).await?;
        let ManifestContent::File(file) = &manifest.content else {
            return Err(WorkspaceError::NotAFile {
                path: format!("{} (remote version {})", entry_id, version),
            });
        };
        file_ops::read_range(&ctx.blocks, file, offset, size).await
    }
}
