//! Remote storage service contract
//!
//! The engine never talks to a concrete server: everything goes through the
//! [`RemoteService`] trait. Production code plugs a network client in here,
//! tests use [`InMemoryRemote`].
//!
//! The remote only ever sees ciphertext: manifests are sealed with the
//! workspace key before being pushed, blocks are already encrypted by the
//! block store.

pub mod memory;

use crate::error::{RemoteError, Result, WorkspaceError};
use crate::models::{BlockDigest, EntryId, RemoteManifest};
use crate::storage::crypto::SecretKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryRemote;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// A manifest version as stored by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedManifest {
    pub version: u64,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Manifest(EncryptedManifest),
    /// The latest remote version is not newer than the one asked for.
    NotModified,
}

/// Changes reported by [`RemoteService::poll_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteChanges {
    pub checkpoint: u64,
    /// `(entry, new remote version)` pairs, oldest first.
    pub changes: Vec<(EntryId, u64)>,
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Latest version of `entry_id` if it is newer than `since_version`.
    async fn fetch_manifest(
        &self,
        entry_id: EntryId,
        since_version: u64,
    ) -> RemoteResult<FetchOutcome>;

    /// A specific historical version.
    async fn fetch_manifest_version(
        &self,
        entry_id: EntryId,
        version: u64,
    ) -> RemoteResult<EncryptedManifest>;

    /// Store `manifest` as version `expected_base_version + 1`.
    ///
    /// Fails with [`RemoteError::VersionConflict`] if the remote is not at
    /// `expected_base_version` anymore.
    async fn push_manifest(
        &self,
        entry_id: EntryId,
        expected_base_version: u64,
        manifest: EncryptedManifest,
    ) -> RemoteResult<()>;

    async fn fetch_block(&self, digest: &BlockDigest) -> RemoteResult<Vec<u8>>;

    /// Fails with [`RemoteError::AlreadyExists`] if the block is already stored.
    async fn push_block(&self, digest: &BlockDigest, ciphertext: Vec<u8>) -> RemoteResult<()>;

    /// Entries changed since `checkpoint`.
    async fn poll_changes(&self, checkpoint: u64) -> RemoteResult<RemoteChanges>;
}

/// Encrypt a manifest version for the remote service.
pub fn seal_manifest(key: &SecretKey, manifest: &RemoteManifest) -> Result<EncryptedManifest> {
    let raw = bincode::serialize(manifest)?;
    Ok(EncryptedManifest {
        version: manifest.version,
        blob: key.encrypt(&raw)?,
    })
}

/// Decrypt and check a manifest version fetched from the remote service.
pub fn open_manifest(
    key: &SecretKey,
    entry_id: EntryId,
    encrypted: &EncryptedManifest,
) -> Result<RemoteManifest> {
    let raw = key.decrypt(&encrypted.blob)?;
    let manifest: RemoteManifest = bincode::deserialize(&raw)?;
    if manifest.version != encrypted.version || manifest.content.id() != entry_id {
        return Err(WorkspaceError::Corrupted(format!(
            "remote manifest {} v{} does not match its envelope (v{}, id {})",
            entry_id,
            encrypted.version,
            manifest.version,
            manifest.content.id()
        )));
    }
    manifest.content.validate()?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceId, FolderManifest, ManifestContent};
    use chrono::Utc;

    fn sample(id: EntryId, version: u64) -> RemoteManifest {
        RemoteManifest {
            version,
            author: DeviceId::new(),
            timestamp: Utc::now(),
            content: ManifestContent::Folder(FolderManifest::new(id, id, Utc::now())),
        }
    }

    #[test]
    fn test_seal_and_open() {
        let key = SecretKey::generate();
        let id = EntryId::new();
        let manifest = sample(id, 3);
        let sealed = seal_manifest(&key, &manifest).unwrap();
        assert_eq!(sealed.version, 3);
        assert_eq!(open_manifest(&key, id, &sealed).unwrap(), manifest);
    }

    #[test]
    fn test_open_rejects_mismatched_envelope() {
        let key = SecretKey::generate();
        let id = EntryId::new();
        let mut sealed = seal_manifest(&key, &sample(id, 3)).unwrap();
        sealed.version = 4;
        assert!(matches!(
            open_manifest(&key, id, &sealed),
            Err(WorkspaceError::Corrupted(_))
        ));
        let sealed = seal_manifest(&key, &sample(id, 3)).unwrap();
        assert!(open_manifest(&key, EntryId::new(), &sealed).is_err());
    }

    #[test]
    fn test_open_with_wrong_key() {
        let id = EntryId::new();
        let sealed = seal_manifest(&SecretKey::generate(), &sample(id, 1)).unwrap();
        assert!(matches!(
            open_manifest(&SecretKey::generate(), id, &sealed),
            Err(WorkspaceError::Decryption(_))
        ));
    }
}
