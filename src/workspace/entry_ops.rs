//! Path level operations: stat, create, remove and move entries
//!
//! Every mutation follows the same shape: resolve the paths without locks,
//! lock every entry involved at once, re-read them and check the resolution
//! still holds, then commit all touched manifests in one transaction. A
//! stale resolution surfaces as `VersionConflict` and the whole operation is
//! retried by [`retry_on_conflict`].

use crate::error::{Result, WorkspaceError};
use crate::events::WorkspaceEvent;
use crate::models::{
    EntryId, EntryKind, EntryName, FileManifest, FolderManifest, FsPath, LocalManifest,
    ManifestContent,
};
use crate::storage::ManifestUpdate;
use crate::workspace::session::{retry_on_conflict, WorkspaceSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Metadata of one entry as seen locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStat {
    pub id: EntryId,
    pub parent: EntryId,
    pub kind: EntryKind,
    /// Always 0 for a folder.
    pub size: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub version: u64,
    pub base_version: u64,
    pub need_sync: bool,
    pub confined: bool,
    /// Child names of a folder, sorted; empty for a file.
    pub children: Vec<EntryName>,
}

impl EntryStat {
    pub fn from_manifest(manifest: &LocalManifest) -> Self {
        let (size, children) = match &manifest.content {
            ManifestContent::File(file) => (file.size, Vec::new()),
            ManifestContent::Folder(folder) => (0, folder.children.keys().cloned().collect()),
        };
        Self {
            id: manifest.id(),
            parent: manifest.content.parent(),
            kind: manifest.kind(),
            size,
            created: manifest.content.created(),
            updated: manifest.content.updated(),
            version: manifest.version,
            base_version: manifest.base_version,
            need_sync: manifest.need_sync,
            confined: manifest.confined,
            children,
        }
    }
}

/// Behaviour of [`WorkspaceSession::move_entry`] when the destination exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveEntryMode {
    /// Fail with `DestinationExists`.
    NoReplace,
    /// Replace the destination, which must be of the same kind (and empty
    /// for a folder).
    CanReplace,
}

fn stale(manifest: &LocalManifest, expected: u64) -> WorkspaceError {
    WorkspaceError::VersionConflict {
        entry_id: manifest.id(),
        expected,
        actual: manifest.version,
    }
}

impl WorkspaceSession {
    pub async fn stat_entry(&self, path: &str) -> Result<EntryStat> {
        self.ctx.ensure_running()?;
        let path: FsPath = path.parse()?;
        let manifest = self.ctx.manifests.resolve_path(&path).await?;
        Ok(EntryStat::from_manifest(&manifest))
    }

    pub async fn stat_entry_by_id(&self, entry_id: EntryId) -> Result<EntryStat> {
        self.ctx.ensure_running()?;
        let manifest = self.ctx.manifests.get(entry_id).await?;
        if manifest.tombstone {
            return Err(WorkspaceError::entry_not_found(entry_id));
        }
        Ok(EntryStat::from_manifest(&manifest))
    }

    /// Immediate children of a folder, ordered by name.
    pub async fn stat_folder_children(&self, path: &str) -> Result<Vec<(EntryName, EntryStat)>> {
        self.ctx.ensure_running()?;
        let path: FsPath = path.parse()?;
        let manifests = &self.ctx.manifests;
        let folder = manifests.resolve_path(&path).await?;
        let ManifestContent::Folder(content) = &folder.content else {
            return Err(WorkspaceError::NotADirectory {
                path: path.to_string(),
            });
        };

        let mut listing = Vec::with_capacity(content.children.len());
        for (name, child_id) in &content.children {
            let confined = manifests.confinement().child_confined(folder.confined, name);
            let child = manifests.get_or_fetch(*child_id, confined).await?;
            if child.tombstone {
                continue;
            }
            listing.push((name.clone(), EntryStat::from_manifest(&child)));
        }
        Ok(listing)
    }

    /// Create a folder and its missing ancestors, like `mkdir -p`.
    ///
    /// Succeeds if the folder already exists; fails with `EntryExists` if the
    /// path is a file.
    pub async fn create_folder(&self, path: &str) -> Result<EntryId> {
        self.ctx.ensure_running()?;
        let path: FsPath = path.parse()?;
        let manifests = &self.ctx.manifests;
        let depth = path.parts().len();

        let mut current = FsPath::root();
        let mut folder_id = manifests.root_id();
        for (index, name) in path.parts().iter().enumerate() {
            current = current.join(name.clone());
            let existing = match manifests.resolve_path(&current).await {
                Ok(manifest) => Some(manifest),
                Err(WorkspaceError::EntryNotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            let existing = match existing {
                Some(manifest) => manifest,
                None => {
                    let target = &current;
                    match retry_on_conflict(move || self.try_create_entry(target, EntryKind::Folder))
                        .await
                    {
                        Ok(id) => {
                            folder_id = id;
                            continue;
                        }
                        // created concurrently
                        Err(WorkspaceError::EntryExists { .. }) => {
                            manifests.resolve_path(&current).await?
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            folder_id = match existing.kind() {
                EntryKind::Folder => existing.id(),
                EntryKind::File if index + 1 == depth => {
                    return Err(WorkspaceError::EntryExists {
                        path: current.to_string(),
                    })
                }
                EntryKind::File => {
                    return Err(WorkspaceError::NotADirectory {
                        path: current.to_string(),
                    })
                }
            };
        }
        Ok(folder_id)
    }

    /// Create an empty file; fails with `EntryExists` if the path resolves.
    pub async fn create_file(&self, path: &str) -> Result<EntryId> {
        self.ctx.ensure_running()?;
        let path: FsPath = path.parse()?;
        if path.is_root() {
            return Err(WorkspaceError::EntryExists {
                path: path.to_string(),
            });
        }
        let target = &path;
        retry_on_conflict(move || self.try_create_entry(target, EntryKind::File)).await
    }

    pub(crate) async fn try_create_entry(&self, path: &FsPath, kind: EntryKind) -> Result<EntryId> {
        let ctx = &self.ctx;
        let (parent, name) = ctx.manifests.resolve_parent(path).await?;
        let parent_id = parent.id();

        let _guard = ctx.locks.lock(parent_id).await;
        let mut parent = ctx.manifests.get(parent_id).await?;
        if parent.tombstone {
            return Err(WorkspaceError::ParentNotFound {
                path: path.parent().unwrap_or_default().to_string(),
            });
        }
        let confined = ctx
            .manifests
            .confinement()
            .child_confined(parent.confined, &name);

        let now = Utc::now();
        let ManifestContent::Folder(folder) = &mut parent.content else {
            return Err(WorkspaceError::NotADirectory {
                path: path.parent().unwrap_or_default().to_string(),
            });
        };
        if folder.children.contains_key(&name) {
            return Err(WorkspaceError::EntryExists {
                path: path.to_string(),
            });
        }

        let id = EntryId::new();
        folder.children.insert(name, id);
        folder.updated = now;
        // a confined child is invisible remotely
        parent.need_sync |= !confined;

        let content = match kind {
            EntryKind::File => ManifestContent::File(FileManifest::new(
                id,
                parent_id,
                ctx.config.storage.block_size,
                now,
            )),
            EntryKind::Folder => ManifestContent::Folder(FolderManifest::new(id, parent_id, now)),
        };
        ctx.manifests
            .put_many(vec![
                ManifestUpdate::on_top(parent),
                ManifestUpdate::new(LocalManifest::new_local(content, confined), 0),
            ])
            .await?;

        debug!(entry_id = %id, path = %path, kind = ?kind, confined, "Created entry");
        ctx.local_change(parent_id);
        ctx.local_change(id);
        Ok(id)
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.ctx.ensure_running()?;
        let path: FsPath = path.parse()?;
        if path.is_root() {
            return Err(WorkspaceError::NotAFile {
                path: path.to_string(),
            });
        }
        let target = &path;
        retry_on_conflict(move || self.try_remove(target, EntryKind::File)).await
    }

    /// Remove a folder and everything below it.
    pub async fn remove_folder_all(&self, path: &str) -> Result<()> {
        self.ctx.ensure_running()?;
        let path: FsPath = path.parse()?;
        if path.is_root() {
            return Err(WorkspaceError::CannotRemoveRoot);
        }
        let target = &path;
        retry_on_conflict(move || self.try_remove(target, EntryKind::Folder)).await
    }

    /// Locally cached entries below `entry_id`, breadth first.
    async fn cached_descendants(&self, entry_id: EntryId) -> Result<Vec<EntryId>> {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([entry_id]);
        while let Some(id) = queue.pop_front() {
            let Some(manifest) = self.ctx.manifests.try_get(id).await? else {
                // never fetched: nothing local to remove
                continue;
            };
            if id != entry_id {
                found.push(id);
            }
            if let ManifestContent::Folder(folder) = &manifest.content {
                queue.extend(folder.children.values().copied());
            }
        }
        Ok(found)
    }

    async fn try_remove(&self, path: &FsPath, kind: EntryKind) -> Result<()> {
        let ctx = &self.ctx;
        let (parent, name) = ctx.manifests.resolve_parent(path).await?;
        let target = ctx.manifests.resolve_path(path).await?;
        match (kind, target.kind()) {
            (EntryKind::File, EntryKind::Folder) => {
                return Err(WorkspaceError::NotAFile {
                    path: path.to_string(),
                })
            }
            (EntryKind::Folder, EntryKind::File) => {
                return Err(WorkspaceError::NotADirectory {
                    path: path.to_string(),
                })
            }
            _ => {}
        }

        let descendants = self.cached_descendants(target.id()).await?;
        let mut ids = vec![parent.id(), target.id()];
        ids.extend(descendants.iter().copied());
        let _guards = ctx.locks.lock_many(ids).await;

        let mut current_parent = ctx.manifests.get(parent.id()).await?;
        let now = Utc::now();
        let ManifestContent::Folder(folder) = &mut current_parent.content else {
            return Err(stale(&current_parent, parent.version));
        };
        if folder.children.get(&name) != Some(&target.id()) {
            return Err(stale(&current_parent, parent.version));
        }
        // a child created meanwhile would escape the removal
        let locked: HashSet<EntryId> = descendants.iter().copied().collect();
        if self
            .cached_descendants(target.id())
            .await?
            .iter()
            .any(|id| !locked.contains(id))
        {
            return Err(stale(&target, target.version));
        }

        let removed = ctx.manifests.get(target.id()).await?;
        folder.children.remove(&name);
        folder.updated = now;
        current_parent.need_sync |= !removed.confined;
        let parent_id = current_parent.id();

        let mut updates = vec![ManifestUpdate::on_top(current_parent)];
        let mut tombstoned = Vec::with_capacity(descendants.len() + 1);
        for id in std::iter::once(target.id()).chain(descendants) {
            let mut manifest = ctx.manifests.get(id).await?;
            if manifest.tombstone {
                continue;
            }
            manifest.tombstone = true;
            manifest.need_sync = false;
            manifest.content.set_updated(now);
            tombstoned.push(id);
            updates.push(ManifestUpdate::on_top(manifest));
        }
        ctx.manifests.put_many(updates).await?;

        info!(path = %path, entries = tombstoned.len(), "Removed entry");
        ctx.local_change(parent_id);
        for id in tombstoned {
            ctx.events.emit(WorkspaceEvent::EntryUpdated {
                workspace_id: ctx.workspace_id,
                entry_id: id,
            });
        }
        Ok(())
    }

    /// Move or rename an entry.
    ///
    /// Moving an entry onto itself is a no-op. With
    /// [`MoveEntryMode::CanReplace`] the previous destination becomes a
    /// tombstone: unreachable by path, still listed in its history.
    ///
    /// # Errors
    ///
    /// `InvalidMove` when moving the root or a folder below itself,
    /// `DestinationExists` under [`MoveEntryMode::NoReplace`].
    pub async fn move_entry(&self, src: &str, dst: &str, mode: MoveEntryMode) -> Result<()> {
        self.ctx.ensure_running()?;
        let src: FsPath = src.parse()?;
        let dst: FsPath = dst.parse()?;
        if src.is_root() || dst.is_root() {
            return Err(WorkspaceError::InvalidMove(
                "the workspace root cannot be moved or replaced".to_string(),
            ));
        }
        if src == dst {
            self.ctx.manifests.resolve_path(&src).await?;
            return Ok(());
        }
        if src.is_ancestor_or_self_of(&dst) {
            return Err(WorkspaceError::InvalidMove(format!(
                "cannot move {} inside itself",
                src
            )));
        }
        let (src, dst) = (&src, &dst);
        retry_on_conflict(move || self.try_move(src, dst, mode)).await
    }

    async fn try_move(&self, src: &FsPath, dst: &FsPath, mode: MoveEntryMode) -> Result<()> {
        let ctx = &self.ctx;
        let (src_parent, src_name) = ctx.manifests.resolve_parent(src).await?;
        let entry = ctx.manifests.resolve_path(src).await?;
        let (dst_parent, dst_name) = ctx.manifests.resolve_parent(dst).await?;

        let replaced = match dst_parent
            .content
            .as_folder()
            .and_then(|folder| folder.children.get(&dst_name))
        {
            None => None,
            Some(_) if mode == MoveEntryMode::NoReplace => {
                return Err(WorkspaceError::DestinationExists {
                    path: dst.to_string(),
                })
            }
            Some(_) => Some(ctx.manifests.resolve_path(dst).await?),
        };
        if let Some(existing) = &replaced {
            check_replaceable(&entry, existing, dst)?;
        }

        let subtree = match entry.kind() {
            EntryKind::Folder => self.cached_descendants(entry.id()).await?,
            EntryKind::File => Vec::new(),
        };
        let mut ids = vec![src_parent.id(), dst_parent.id(), entry.id()];
        ids.extend(replaced.as_ref().map(|m| m.id()));
        ids.extend(subtree.iter().copied());
        let _guards = ctx.locks.lock_many(ids).await;

        // re-check everything resolved above
        let mut current_src_parent = ctx.manifests.get(src_parent.id()).await?;
        if current_src_parent
            .content
            .as_folder()
            .and_then(|folder| folder.children.get(&src_name))
            != Some(&entry.id())
        {
            return Err(stale(&current_src_parent, src_parent.version));
        }
        let current_dst_parent = ctx.manifests.get(dst_parent.id()).await?;
        let dst_child = current_dst_parent
            .content
            .as_folder()
            .and_then(|folder| folder.children.get(&dst_name))
            .copied();
        if current_dst_parent.tombstone || dst_child != replaced.as_ref().map(|m| m.id()) {
            return Err(stale(&current_dst_parent, dst_parent.version));
        }
        let replaced = match replaced {
            Some(existing) => {
                let current = ctx.manifests.get(existing.id()).await?;
                check_replaceable(&entry, &current, dst)?;
                Some(current)
            }
            None => None,
        };

        let now = Utc::now();
        let mut moved = ctx.manifests.get(entry.id()).await?;
        let confined = ctx
            .manifests
            .confinement()
            .child_confined(current_dst_parent.confined, &dst_name);
        let reconfined = confined != moved.confined;
        moved.content.set_parent(dst_parent.id());
        moved.content.set_updated(now);
        moved.confined = confined;
        moved.need_sync = true;

        let mut updates = Vec::new();
        if src_parent.id() == dst_parent.id() {
            if let ManifestContent::Folder(folder) = &mut current_src_parent.content {
                folder.children.remove(&src_name);
                folder.children.insert(dst_name.clone(), entry.id());
                folder.updated = now;
            }
            current_src_parent.need_sync = true;
            updates.push(ManifestUpdate::on_top(current_src_parent));
        } else {
            let mut current_dst_parent = current_dst_parent;
            if let ManifestContent::Folder(folder) = &mut current_src_parent.content {
                folder.children.remove(&src_name);
                folder.updated = now;
            }
            if let ManifestContent::Folder(folder) = &mut current_dst_parent.content {
                folder.children.insert(dst_name.clone(), entry.id());
                folder.updated = now;
            }
            current_src_parent.need_sync = true;
            current_dst_parent.need_sync = true;
            updates.push(ManifestUpdate::on_top(current_src_parent));
            updates.push(ManifestUpdate::on_top(current_dst_parent));
        }

        if let Some(mut old) = replaced.clone() {
            old.tombstone = true;
            old.need_sync = false;
            old.content.set_updated(now);
            updates.push(ManifestUpdate::on_top(old));
        }
        if reconfined {
            let moved_folder = moved.content.as_folder().cloned();
            updates.extend(self.reconfine_subtree(moved_folder, confined, &subtree).await?);
        }
        let moved_id = moved.id();
        updates.push(ManifestUpdate::on_top(moved));
        let touched: Vec<EntryId> = updates.iter().map(|u| u.manifest.id()).collect();
        ctx.manifests.put_many(updates).await?;

        info!(
            entry_id = %moved_id,
            from = %src,
            to = %dst,
            replaced = replaced.is_some(),
            "Moved entry"
        );
        for id in touched {
            ctx.local_change(id);
        }
        Ok(())
    }

    /// Recompute the confinement of the cached entries below a moved folder.
    ///
    /// Entries leaving confinement become dirty: they were never pushed.
    async fn reconfine_subtree(
        &self,
        folder: Option<FolderManifest>,
        confined: bool,
        locked: &[EntryId],
    ) -> Result<Vec<ManifestUpdate>> {
        let Some(folder) = folder else {
            return Ok(Vec::new());
        };
        let locked: HashSet<EntryId> = locked.iter().copied().collect();
        let confinement = self.ctx.manifests.confinement();
        let mut updates = Vec::new();
        let mut queue: VecDeque<(BTreeMap<EntryName, EntryId>, bool)> =
            VecDeque::from([(folder.children, confined)]);

        while let Some((children, parent_confined)) = queue.pop_front() {
            for (name, id) in children {
                if !locked.contains(&id) {
                    continue;
                }
                let Some(mut child) = self.ctx.manifests.try_get(id).await? else {
                    continue;
                };
                let child_confined = confinement.child_confined(parent_confined, &name);
                if let ManifestContent::Folder(sub) = &child.content {
                    queue.push_back((sub.children.clone(), child_confined));
                }
                if child.tombstone || child.confined == child_confined {
                    continue;
                }
                child.confined = child_confined;
                if !child_confined {
                    child.need_sync = true;
                }
                updates.push(ManifestUpdate::on_top(child));
            }
        }
        Ok(updates)
    }
}

/// POSIX `rename` rules for replacing an existing destination.
fn check_replaceable(entry: &LocalManifest, existing: &LocalManifest, dst: &FsPath) -> Result<()> {
    match (&entry.content, &existing.content) {
        (ManifestContent::File(_), ManifestContent::Folder(_)) => Err(WorkspaceError::NotAFile {
            path: dst.to_string(),
        }),
        (ManifestContent::Folder(_), ManifestContent::File(_)) => {
            Err(WorkspaceError::NotADirectory {
                path: dst.to_string(),
            })
        }
        (ManifestContent::Folder(_), ManifestContent::Folder(folder))
            if !folder.children.is_empty() =>
        {
            Err(WorkspaceError::FolderNotEmpty {
                path: dst.to_string(),
            })
        }
        _ => Ok(()),
    }
}
