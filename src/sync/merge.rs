//! Reconciliation of a local manifest with a newer remote version
//!
//! Folder children are merged three-way (base, local, remote) per entry id:
//!
//! - an entry added on either side is kept
//! - an entry removed on either side is removed
//! - an entry renamed on both sides takes the remote name
//!
//! Two different entries ending up under the same name is a true collision:
//! the side whose folder was updated last keeps the name (ties go to the
//! smaller entry id) and the other entry is renamed `"<stem> (name conflict).<ext>"`.
//!
//! File content is never merged. When both sides changed it, the entry takes
//! the remote content and the local content is forked into a new entry named
//! `"<stem> (content conflict).<ext>"` next to it.

use crate::error::{Result, WorkspaceError};
use crate::models::{
    Confinement, DeviceId, EntryId, EntryName, FileManifest, FolderManifest, LocalManifest,
    ManifestContent, RemoteManifest, MAX_ENTRY_NAME_BYTES,
};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

pub const NAME_CONFLICT_SUFFIX: &str = "name conflict";
pub const CONTENT_CONFLICT_SUFFIX: &str = "content conflict";

/// Result of merging a remote version into a local manifest.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// New local state of the entry, based on the remote version.
    pub manifest: LocalManifest,
    /// Local file content preserved under a new entry id.
    pub fork: Option<FileManifest>,
    pub name_conflicts: usize,
}

impl MergeOutcome {
    pub fn conflicts(&self) -> usize {
        self.name_conflicts + usize::from(self.fork.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildrenMerge {
    pub children: BTreeMap<EntryName, EntryId>,
    pub conflicts: usize,
}

/// Split at the first dot, a leading dot being part of the stem.
fn split_name(name: &str) -> (&str, &str) {
    let skip = usize::from(name.starts_with('.'));
    match name[skip..].find('.') {
        Some(pos) => name.split_at(skip + pos),
        None => (name, ""),
    }
}

fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `"report.txt"` → `"report (suffix).txt"`, then `"report (suffix 2).txt"`...
pub fn rename_with_suffix(name: &EntryName, suffix: &str, attempt: usize) -> Result<EntryName> {
    let (stem, ext) = split_name(name.as_str());
    let tag = if attempt <= 1 {
        format!(" ({})", suffix)
    } else {
        format!(" ({} {})", suffix, attempt)
    };

    let (stem, ext) = if tag.len() + ext.len() >= MAX_ENTRY_NAME_BYTES {
        (name.as_str(), "")
    } else {
        (stem, ext)
    };
    let room = MAX_ENTRY_NAME_BYTES.saturating_sub(tag.len() + ext.len());
    let stem = truncate_to_boundary(stem, room);
    EntryName::try_from(format!("{}{}{}", stem, tag, ext))
}

/// First suffixed variant of `name` for which `is_taken` is false.
pub fn get_conflict_filename(
    name: &EntryName,
    suffix: &str,
    is_taken: impl Fn(&EntryName) -> bool,
) -> Result<EntryName> {
    let mut attempt = 1;
    loop {
        let candidate = rename_with_suffix(name, suffix, attempt)?;
        if !is_taken(&candidate) {
            return Ok(candidate);
        }
        attempt += 1;
    }
}

fn by_id(children: &BTreeMap<EntryName, EntryId>) -> HashMap<EntryId, &EntryName> {
    children.iter().map(|(name, id)| (*id, name)).collect()
}

/// Three-way merge of a folder's children map.
pub fn merge_children(
    base: &BTreeMap<EntryName, EntryId>,
    local: &BTreeMap<EntryName, EntryId>,
    remote: &BTreeMap<EntryName, EntryId>,
    local_updated: DateTime<Utc>,
    remote_updated: DateTime<Utc>,
) -> Result<ChildrenMerge> {
    let base_names = by_id(base);
    let local_names = by_id(local);
    let remote_names = by_id(remote);

    // Names coming from the remote side are unique among themselves, and so
    // are the names coming from the local side.
    let mut from_remote: Vec<(EntryId, EntryName)> = Vec::new();
    let mut from_local: Vec<(EntryId, EntryName)> = Vec::new();

    for (remote_name, id) in remote {
        match local_names.get(id) {
            Some(local_name) if *local_name == remote_name => {
                from_remote.push((*id, remote_name.clone()))
            }
            Some(local_name) => {
                if base_names.get(id) == Some(&remote_name) {
                    from_local.push((*id, (*local_name).clone()));
                } else {
                    from_remote.push((*id, remote_name.clone()));
                }
            }
            // removed locally
            None if base_names.contains_key(id) => {}
            None => from_remote.push((*id, remote_name.clone())),
        }
    }
    for (local_name, id) in local {
        if !remote_names.contains_key(id) && !base_names.contains_key(id) {
            from_local.push((*id, local_name.clone()));
        }
    }

    let mut merged: BTreeMap<EntryName, EntryId> = from_remote
        .into_iter()
        .map(|(id, name)| (name, id))
        .collect();
    let mut losers: Vec<(EntryId, EntryName)> = Vec::new();

    for (local_id, name) in from_local {
        match merged.get(&name).copied() {
            None => {
                merged.insert(name, local_id);
            }
            Some(remote_id) => {
                let local_wins = match local_updated.cmp(&remote_updated) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => local_id < remote_id,
                };
                if local_wins {
                    merged.insert(name.clone(), local_id);
                    losers.push((remote_id, name));
                } else {
                    losers.push((local_id, name));
                }
            }
        }
    }

    losers.sort();
    let conflicts = losers.len();
    for (id, name) in losers {
        let renamed = get_conflict_filename(&name, NAME_CONFLICT_SUFFIX, |candidate| {
            merged.contains_key(candidate)
        })?;
        merged.insert(renamed, id);
    }

    Ok(ChildrenMerge {
        children: merged,
        conflicts,
    })
}

/// Parent after a merge: a move on one side wins, remote wins if both moved.
pub fn merge_parent(base: Option<EntryId>, local: EntryId, remote: EntryId) -> EntryId {
    match base {
        Some(base) if local == base => remote,
        Some(base) if remote == base => local,
        _ => remote,
    }
}

/// Content as sent to the remote: confined children are left out.
pub fn visible_content(content: &ManifestContent, confinement: &Confinement) -> ManifestContent {
    match content {
        ManifestContent::Folder(folder) => {
            let mut folder = folder.clone();
            folder.children.retain(|name, _| !confinement.matches(name));
            ManifestContent::Folder(folder)
        }
        ManifestContent::File(_) => content.clone(),
    }
}

/// Local state for an entry taking the remote version as is.
///
/// Confined children only exist locally and are carried over.
pub fn adopt_remote(
    local: &LocalManifest,
    remote: RemoteManifest,
    confinement: &Confinement,
) -> Result<LocalManifest> {
    let mut content = remote.content.clone();
    if let (ManifestContent::Folder(target), ManifestContent::Folder(current)) =
        (&mut content, &local.content)
    {
        keep_confined_children(target, current, confinement)?;
    }
    Ok(LocalManifest {
        content,
        version: local.version,
        base_version: remote.version,
        base: Some(remote.content),
        base_author: Some(remote.author),
        need_sync: false,
        confined: local.confined,
        tombstone: false,
    })
}

fn keep_confined_children(
    target: &mut FolderManifest,
    current: &FolderManifest,
    confinement: &Confinement,
) -> Result<()> {
    for (name, id) in &current.children {
        if !confinement.matches(name) || target.children.values().any(|c| c == id) {
            continue;
        }
        let name = if target.children.contains_key(name) {
            get_conflict_filename(name, NAME_CONFLICT_SUFFIX, |n| target.children.contains_key(n))?
        } else {
            name.clone()
        };
        target.children.insert(name, *id);
    }
    Ok(())
}

/// Merge a remote version newer than the local base into the local manifest.
///
/// A remote version authored by `device_id` descends from the local history
/// (it was pushed from here), so it stands in for the base: this is what
/// makes a push retried after a lost reply acknowledge itself.
pub fn merge_remote_into_local(
    local: &LocalManifest,
    remote: &RemoteManifest,
    device_id: DeviceId,
    confinement: &Confinement,
    now: DateTime<Utc>,
) -> Result<MergeOutcome> {
    let base = if remote.author == device_id {
        Some(&remote.content)
    } else {
        local.base.as_ref()
    };
    let parent = merge_parent(
        base.map(|b| b.parent()),
        local.content.parent(),
        remote.content.parent(),
    );

    let mut fork = None;
    let mut name_conflicts = 0;

    let mut content = match (&local.content, &remote.content) {
        (ManifestContent::Folder(l), ManifestContent::Folder(r)) => {
            let empty = BTreeMap::new();
            let base_children = base
                .and_then(|b| b.as_folder())
                .map(|f| &f.children)
                .unwrap_or(&empty);
            let merged = merge_children(base_children, &l.children, &r.children, l.updated, r.updated)?;
            name_conflicts = merged.conflicts;
            ManifestContent::Folder(FolderManifest {
                id: l.id,
                parent,
                created: r.created,
                updated: l.updated.max(r.updated),
                children: merged.children,
            })
        }
        (ManifestContent::File(l), ManifestContent::File(r)) => {
            let base_file = base.and_then(|b| b.as_file());
            let local_changed = base_file.map_or(true, |b| !l.same_content(b));
            let remote_changed = base_file.map_or(true, |b| !r.same_content(b));

            let mut merged = if l.same_content(r) || !local_changed {
                r.clone()
            } else if !remote_changed {
                l.clone()
            } else {
                fork = Some(FileManifest {
                    id: EntryId::new(),
                    parent: l.parent,
                    created: now,
                    updated: now,
                    ..l.clone()
                });
                r.clone()
            };
            merged.parent = parent;
            ManifestContent::File(merged)
        }
        _ => {
            return Err(WorkspaceError::Corrupted(format!(
                "entry {} is a {:?} locally but a {:?} on the remote",
                local.id(),
                local.kind(),
                remote.content.kind()
            )))
        }
    };

    let need_sync = !visible_content(&content, confinement).same_data(&remote.content);
    if !need_sync {
        content.set_updated(remote.content.updated());
    }

    Ok(MergeOutcome {
        manifest: LocalManifest {
            content,
            version: local.version,
            base_version: remote.version,
            base: Some(remote.content.clone()),
            base_author: Some(remote.author),
            need_sync,
            confined: local.confined,
            tombstone: false,
        },
        fork,
        name_conflicts,
    })
}
