//! Manifest data model
//!
//! A manifest is the versioned metadata of one entry: the children map of a
//! folder, or the size and block references of a file. Manifests exist in two
//! flavours:
//!
//! - [`RemoteManifest`]: an immutable version as stored by the remote service
//!   (remote version, author, timestamp, content).
//! - [`LocalManifest`]: the local view of an entry, carrying the current
//!   content plus the remote snapshot it was derived from (`base`) and the
//!   bookkeeping needed by the sync engine (`need_sync`, `confined`, ...).

use crate::error::{Result, WorkspaceError};
use crate::models::ids::{BlockDigest, DeviceId, EntryId};
use crate::models::path::EntryName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Symmetric block key encrypted under the workspace key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey(pub Vec<u8>);

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

/// Reference from a file manifest to one immutable block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub digest: BlockDigest,
    /// Offset of the block's first byte inside the file (multiple of the blocksize).
    pub offset: u64,
    /// Plaintext length of the block.
    pub size: u64,
    pub key: WrappedKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub id: EntryId,
    pub parent: EntryId,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub size: u64,
    pub blocksize: u64,
    /// Sorted by offset; areas without a block read as zeros.
    pub blocks: Vec<BlockRef>,
}

impl FileManifest {
    pub fn new(id: EntryId, parent: EntryId, blocksize: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            parent,
            created: now,
            updated: now,
            size: 0,
            blocksize,
            blocks: Vec::new(),
        }
    }

    /// Block covering the blocksize area `index`, if that area is not a hole.
    pub fn block_at(&self, index: u64) -> Option<&BlockRef> {
        let offset = index * self.blocksize;
        self.blocks
            .binary_search_by_key(&offset, |block| block.offset)
            .ok()
            .map(|pos| &self.blocks[pos])
    }

    /// Insert or replace the block of its blocksize area, keeping blocks sorted.
    pub fn set_block(&mut self, block: BlockRef) {
        match self
            .blocks
            .binary_search_by_key(&block.offset, |existing| existing.offset)
        {
            Ok(pos) => self.blocks[pos] = block,
            Err(pos) => self.blocks.insert(pos, block),
        }
    }

    /// Compare the actual file content (size and blocks), ignoring metadata.
    pub fn same_content(&self, other: &FileManifest) -> bool {
        self.size == other.size && self.blocksize == other.blocksize && self.blocks == other.blocks
    }

    pub fn validate(&self) -> Result<()> {
        if self.blocksize == 0 {
            return Err(WorkspaceError::Corrupted(format!(
                "file {} has a zero blocksize",
                self.id
            )));
        }
        let mut previous: Option<u64> = None;
        for block in &self.blocks {
            let misplaced = block.offset % self.blocksize != 0
                || block.size == 0
                || block.size > self.blocksize
                || block
                    .offset
                    .checked_add(block.size)
                    .map_or(true, |end| end > self.size)
                || previous.is_some_and(|prev| prev >= block.offset);
            if misplaced {
                return Err(WorkspaceError::Corrupted(format!(
                    "file {} has an invalid block at offset {}",
                    self.id, block.offset
                )));
            }
            previous = Some(block.offset);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderManifest {
    pub id: EntryId,
    /// The workspace root is its own parent.
    pub parent: EntryId,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub children: BTreeMap<EntryName, EntryId>,
}

impl FolderManifest {
    pub fn new(id: EntryId, parent: EntryId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            parent,
            created: now,
            updated: now,
            children: BTreeMap::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == self.parent
    }

    pub fn child_name(&self, child: EntryId) -> Option<&EntryName> {
        self.children
            .iter()
            .find(|(_, id)| **id == child)
            .map(|(name, _)| name)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::with_capacity(self.children.len());
        for (name, id) in &self.children {
            if *id == self.id {
                return Err(WorkspaceError::Corrupted(format!(
                    "folder {} lists itself as child {}",
                    self.id, name
                )));
            }
            if !seen.insert(*id) {
                return Err(WorkspaceError::Corrupted(format!(
                    "folder {} lists child {} twice",
                    self.id, id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestContent {
    File(FileManifest),
    Folder(FolderManifest),
}

impl ManifestContent {
    pub fn id(&self) -> EntryId {
        match self {
            Self::File(m) => m.id,
            Self::Folder(m) => m.id,
        }
    }

    pub fn parent(&self) -> EntryId {
        match self {
            Self::File(m) => m.parent,
            Self::Folder(m) => m.parent,
        }
    }

    pub fn set_parent(&mut self, parent: EntryId) {
        match self {
            Self::File(m) => m.parent = parent,
            Self::Folder(m) => m.parent = parent,
        }
    }

    pub fn created(&self) -> DateTime<Utc> {
        match self {
            Self::File(m) => m.created,
            Self::Folder(m) => m.created,
        }
    }

    pub fn updated(&self) -> DateTime<Utc> {
        match self {
            Self::File(m) => m.updated,
            Self::Folder(m) => m.updated,
        }
    }

    pub fn set_updated(&mut self, now: DateTime<Utc>) {
        match self {
            Self::File(m) => m.updated = now,
            Self::Folder(m) => m.updated = now,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Self::File(_) => EntryKind::File,
            Self::Folder(_) => EntryKind::Folder,
        }
    }

    pub fn as_file(&self) -> Option<&FileManifest> {
        match self {
            Self::File(m) => Some(m),
            Self::Folder(_) => None,
        }
    }

    pub fn as_folder(&self) -> Option<&FolderManifest> {
        match self {
            Self::Folder(m) => Some(m),
            Self::File(_) => None,
        }
    }

    /// Equality on synchronized data only: timestamps are ignored.
    pub fn same_data(&self, other: &ManifestContent) -> bool {
        match (self, other) {
            (Self::File(a), Self::File(b)) => a.parent == b.parent && a.same_content(b),
            (Self::Folder(a), Self::Folder(b)) => a.parent == b.parent && a.children == b.children,
            _ => false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::File(m) => m.validate(),
            Self::Folder(m) => m.validate(),
        }
    }
}

/// One immutable version as stored by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteManifest {
    pub version: u64,
    pub author: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub content: ManifestContent,
}

/// Local view of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalManifest {
    pub content: ManifestContent,
    /// Local commit counter; strictly increases with every committed mutation.
    pub version: u64,
    /// Remote version this manifest derives from, 0 if never synced.
    pub base_version: u64,
    /// Remote content at `base_version`.
    pub base: Option<ManifestContent>,
    /// Author of the remote version at `base_version`.
    pub base_author: Option<DeviceId>,
    pub need_sync: bool,
    /// Excluded from synchronization by the prevent-sync pattern.
    pub confined: bool,
    /// The entry was removed; kept as a history marker.
    pub tombstone: bool,
}

impl LocalManifest {
    /// A brand new entry created locally, not yet committed.
    pub fn new_local(content: ManifestContent, confined: bool) -> Self {
        Self {
            content,
            version: 0,
            base_version: 0,
            base: None,
            base_author: None,
            need_sync: true,
            confined,
            tombstone: false,
        }
    }

    /// A clean local copy of a remote version.
    pub fn from_remote(remote: RemoteManifest, confined: bool) -> Self {
        Self {
            content: remote.content.clone(),
            version: 0,
            base_version: remote.version,
            base: Some(remote.content),
            base_author: Some(remote.author),
            need_sync: false,
            confined,
            tombstone: false,
        }
    }

    pub fn id(&self) -> EntryId {
        self.content.id()
    }

    pub fn kind(&self) -> EntryKind {
        self.content.kind()
    }

    /// Entries the sync engine should push.
    pub fn is_syncable(&self) -> bool {
        self.need_sync && !self.confined && !self.tombstone
    }
}
