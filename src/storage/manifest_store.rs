//! Manifest Store
//!
//! Versioned access to manifests on top of the [`LocalCache`], with an
//! in-memory `moka` cache of decoded manifests in front of it and the remote
//! service behind it for entries never fetched before.
//!
//! All mutations go through [`ManifestStore::put`] / [`ManifestStore::put_many`],
//! the version-check-and-increment path: concurrent writers of one entry see
//! exactly one success and a `VersionConflict` for the others.

use crate::error::{RemoteError, Result, WorkspaceError};
use crate::models::{
    Confinement, EntryId, EntryName, FolderManifest, FsPath, LocalManifest, ManifestContent,
};
use crate::remote::{open_manifest, FetchOutcome, RemoteService};
use crate::storage::crypto::SecretKey;
use crate::storage::local_cache::{LocalCache, ManifestUpdate};
use crate::utils::retry::with_timeout;
use chrono::Utc;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct ManifestStore {
    cache: Arc<LocalCache>,
    memory: Cache<EntryId, Arc<LocalManifest>>,
    remote: Arc<dyn RemoteService>,
    workspace_key: SecretKey,
    root_id: EntryId,
    confinement: Confinement,
    remote_timeout: Duration,
}

impl ManifestStore {
    pub fn new(
        cache: Arc<LocalCache>,
        remote: Arc<dyn RemoteService>,
        workspace_key: SecretKey,
        root_id: EntryId,
        confinement: Confinement,
        memory_capacity: u64,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            memory: Cache::builder().max_capacity(memory_capacity).build(),
            remote,
            workspace_key,
            root_id,
            confinement,
            remote_timeout,
        }
    }

    pub fn root_id(&self) -> EntryId {
        self.root_id
    }

    pub fn confinement(&self) -> &Confinement {
        &self.confinement
    }

    pub fn local_cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// Make sure the workspace root exists locally.
    ///
    /// Uses the remote root when reachable, otherwise starts from an empty
    /// local root that will be merged with the remote one on first sync.
    pub async fn ensure_root(&self) -> Result<LocalManifest> {
        if let Some(root) = self.try_get(self.root_id).await? {
            return Ok(root);
        }
        match self.fetch_and_store(self.root_id, false).await {
            Ok(root) => Ok(root),
            Err(e) if e.is_transient() || matches!(e, WorkspaceError::EntryNotFound { .. }) => {
                info!(root_id = %self.root_id, reason = %e, "Creating local workspace root");
                let now = Utc::now();
                let root = LocalManifest::new_local(
                    ManifestContent::Folder(FolderManifest::new(self.root_id, self.root_id, now)),
                    false,
                );
                match self.put(root, 0).await {
                    Err(WorkspaceError::VersionConflict { .. }) => self.get(self.root_id).await,
                    other => other,
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn try_get(&self, entry_id: EntryId) -> Result<Option<LocalManifest>> {
        if let Some(manifest) = self.memory.get(&entry_id).await {
            return Ok(Some(manifest.as_ref().clone()));
        }
        let loaded = self.cache.load_manifest(entry_id).await?;
        if let Some(manifest) = &loaded {
            self.memory
                .insert(entry_id, Arc::new(manifest.clone()))
                .await;
        }
        Ok(loaded)
    }

    /// Current local manifest of an entry.
    pub async fn get(&self, entry_id: EntryId) -> Result<LocalManifest> {
        self.try_get(entry_id)
            .await?
            .ok_or_else(|| WorkspaceError::entry_not_found(entry_id))
    }

    /// Local manifest, fetched from the remote (and cached clean) if unknown.
    pub async fn get_or_fetch(&self, entry_id: EntryId, confined: bool) -> Result<LocalManifest> {
        match self.try_get(entry_id).await? {
            Some(manifest) => Ok(manifest),
            None => self.fetch_and_store(entry_id, confined).await,
        }
    }

    async fn fetch_and_store(&self, entry_id: EntryId, confined: bool) -> Result<LocalManifest> {
        let fetched = with_timeout(self.remote_timeout, self.remote.fetch_manifest(entry_id, 0))
            .await
            .map_err(|e| match e {
                RemoteError::NotFound => WorkspaceError::entry_not_found(entry_id),
                other => other.into(),
            })?;
        let encrypted = match fetched {
            FetchOutcome::Manifest(encrypted) => encrypted,
            FetchOutcome::NotModified => return Err(WorkspaceError::entry_not_found(entry_id)),
        };

        let remote = open_manifest(&self.workspace_key, entry_id, &encrypted)?;
        debug!(entry_id = %entry_id, version = remote.version, "Fetched missing manifest");

        match self.put(LocalManifest::from_remote(remote, confined), 0).await {
            // fetched concurrently by another task
            Err(WorkspaceError::VersionConflict { .. }) => self.get(entry_id).await,
            other => other,
        }
    }

    pub async fn load_version(&self, entry_id: EntryId, version: u64) -> Result<LocalManifest> {
        self.cache
            .load_manifest_version(entry_id, version)
            .await?
            .ok_or_else(|| {
                WorkspaceError::entry_not_found(format!("{} (version {})", entry_id, version))
            })
    }

    pub async fn history(&self, entry_id: EntryId) -> Result<Vec<LocalManifest>> {
        self.cache.history(entry_id).await
    }

    /// Commit a new version of one manifest.
    pub async fn put(&self, manifest: LocalManifest, expected_version: u64) -> Result<LocalManifest> {
        let mut committed = self
            .put_many(vec![ManifestUpdate::new(manifest, expected_version)])
            .await?;
        committed
            .pop()
            .ok_or_else(|| WorkspaceError::Internal("empty commit result".to_string()))
    }

    /// Commit several manifests atomically.
    pub async fn put_many(&self, updates: Vec<ManifestUpdate>) -> Result<Vec<LocalManifest>> {
        let ids: Vec<EntryId> = updates.iter().map(|u| u.manifest.id()).collect();
        match self.cache.commit_many(updates).await {
            Ok(committed) => {
                for manifest in &committed {
                    self.memory
                        .insert(manifest.id(), Arc::new(manifest.clone()))
                        .await;
                }
                Ok(committed)
            }
            Err(e) => {
                // another writer got there first: drop what we remember
                if matches!(e, WorkspaceError::VersionConflict { .. }) {
                    for id in ids {
                        self.memory.invalidate(&id).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Manifest of the entry at `path`.
    ///
    /// Intermediate components must be folders (`NotADirectory` otherwise);
    /// children never seen locally are fetched from the remote.
    pub async fn resolve_path(&self, path: &FsPath) -> Result<LocalManifest> {
        let mut current = self.get_or_fetch(self.root_id, false).await?;
        let mut walked = FsPath::root();

        for name in path.parts() {
            let folder = match &current.content {
                ManifestContent::Folder(folder) => folder,
                ManifestContent::File(_) => {
                    return Err(WorkspaceError::NotADirectory {
                        path: walked.to_string(),
                    })
                }
            };
            walked = walked.join(name.clone());

            let child_id = *folder
                .children
                .get(name)
                .ok_or_else(|| WorkspaceError::entry_not_found(&walked))?;
            let confined = self.confinement.child_confined(current.confined, name);

            let child = self
                .get_or_fetch(child_id, confined)
                .await
                .map_err(|e| match e {
                    WorkspaceError::EntryNotFound { .. } => WorkspaceError::entry_not_found(&walked),
                    other => other,
                })?;
            if child.tombstone {
                return Err(WorkspaceError::entry_not_found(&walked));
            }
            current = child;
        }
        Ok(current)
    }

    pub async fn resolve_entry_id(&self, path: &FsPath) -> Result<EntryId> {
        self.resolve_path(path).await.map(|m| m.id())
    }

    /// Parent folder manifest of `path` and the last component of `path`.
    pub async fn resolve_parent(&self, path: &FsPath) -> Result<(LocalManifest, EntryName)> {
        let (Some(parent_path), Some(name)) = (path.parent(), path.name()) else {
            return Err(WorkspaceError::InvalidPath(
                "the workspace root has no parent".to_string(),
            ));
        };
        let parent = self
            .resolve_path(&parent_path)
            .await
            .map_err(|e| match e {
                WorkspaceError::EntryNotFound { .. } => WorkspaceError::ParentNotFound {
                    path: parent_path.to_string(),
                },
                other => other,
            })?;
        if parent.content.as_folder().is_none() {
            return Err(WorkspaceError::NotADirectory {
                path: parent_path.to_string(),
            });
        }
        Ok((parent, name.clone()))
    }

    /// Path of an entry, rebuilt by walking parents up to the root.
    pub async fn path_of(&self, entry_id: EntryId) -> Result<FsPath> {
        let mut names = Vec::new();
        let mut current = self.get(entry_id).await?;
        let mut hops = 0usize;
        while current.id() != self.root_id {
            let parent = self.get(current.content.parent()).await?;
            let name = parent
                .content
                .as_folder()
                .and_then(|folder| folder.child_name(current.id()))
                .ok_or_else(|| WorkspaceError::entry_not_found(current.id()))?;
            names.push(name.clone());
            current = parent;
            hops += 1;
            if hops > 4096 {
                return Err(WorkspaceError::Corrupted(format!(
                    "parent chain of {} does not reach the root",
                    entry_id
                )));
            }
        }
        let mut path = FsPath::root();
        for name in names.into_iter().rev() {
            path = path.join(name);
        }
        Ok(path)
    }

    /// Distance from the root (root is 0), following local parent links.
    pub async fn depth_of(&self, entry_id: EntryId) -> Result<usize> {
        let mut depth = 0usize;
        let mut current = entry_id;
        while current != self.root_id {
            current = self.get(current).await?.content.parent();
            depth += 1;
            if depth > 4096 {
                return Err(WorkspaceError::Corrupted(format!(
                    "parent chain of {} does not reach the root",
                    entry_id
                )));
            }
        }
        Ok(depth)
    }
}
