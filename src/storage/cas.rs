//! Content-Addressed Block Store
//!
//! Two layers live here:
//!
//! - [`ObjectStore`]: Git-style sharded object files on disk, keyed by the
//!   SHA-256 of their (encrypted) content.
//! - [`BlockStore`]: turns plaintext into encrypted, content-addressed blocks
//!   and back, using the local cache first and the remote service on a miss.
//!
//! ## Storage Layout
//!
//! ```text
//! objects/
//!   a3/
//!     f2e1d4c5b6a7... (rest of the digest as filename)
//!   b7/
//!     e145a3b2c9d8...
//! ```

use crate::error::{BlockUnavailableReason, RemoteError, Result, WorkspaceError};
use crate::models::{BlockDigest, BlockRef};
use crate::remote::RemoteService;
use crate::storage::crypto::SecretKey;
use crate::storage::local_cache::LocalCache;
use crate::utils::retry::with_timeout;
use dashmap::DashSet;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Sharded on-disk object files.
///
/// Writes are atomic with respect to concurrent writers of the same object
/// (`create_new`); a torn write left by a crash is detected on read by the
/// digest check in [`LocalCache::load_block`].
#[derive(Debug, Clone)]
pub struct ObjectStore {
    objects_dir: PathBuf,
    /// In-memory cache for object existence checks
    existence_cache: Arc<DashSet<String>>,
}

impl ObjectStore {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self {
            objects_dir: workspace_dir.join("objects"),
            existence_cache: Arc::new(DashSet::new()),
        }
    }

    /// Lowercase hex SHA-256 of `content`.
    pub fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        format!("{:x}", hasher.finalize())
    }

    /// Path of an object: first 2 hash characters as directory name.
    pub fn get_object_path(&self, hash: &str) -> PathBuf {
        let (prefix, suffix) = if hash.len() > 2 {
            hash.split_at(2)
        } else {
            warn!(hash = %hash, "Invalid hash length, using full hash as filename");
            ("00", hash)
        };
        self.objects_dir.join(prefix).join(suffix)
    }

    pub async fn store(&self, hash: &str, content: &[u8]) -> Result<()> {
        if self.existence_cache.contains(hash) {
            debug!(hash = %hash, "Object already exists (cached), skipping write");
            return Ok(());
        }

        let object_path = self.get_object_path(hash);
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                WorkspaceError::io_error(
                    format!("Failed to create object directory: {}", e),
                    Some(parent.to_path_buf()),
                )
            })?;
        }

        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_EXCL: atomic check-and-create
            .open(&object_path)
            .await
        {
            Ok(mut file) => {
                file.write_all(content).await.map_err(|e| {
                    WorkspaceError::io_error(
                        format!("Failed to write object file: {}", e),
                        Some(object_path.clone()),
                    )
                })?;
                file.sync_all().await.map_err(|e| {
                    WorkspaceError::io_error(
                        format!("Failed to sync object file: {}", e),
                        Some(object_path.clone()),
                    )
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(hash = %hash, "Object already exists (concurrent write detected), skipping");
            }
            Err(e) => {
                return Err(WorkspaceError::io_error(
                    format!("Failed to create object file: {}", e),
                    Some(object_path),
                ));
            }
        }

        self.existence_cache.insert(hash.to_string());
        Ok(())
    }

    /// Object content, `None` if it is not stored.
    pub async fn read(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let object_path = self.get_object_path(hash);
        match fs::read(&object_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.existence_cache.remove(hash);
                Ok(None)
            }
            Err(e) => Err(WorkspaceError::io_error(
                format!("Failed to read object {}: {}", hash, e),
                Some(object_path),
            )),
        }
    }

    pub async fn remove(&self, hash: &str) -> Result<()> {
        self.existence_cache.remove(hash);
        let object_path = self.get_object_path(hash);
        match fs::remove_file(&object_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::io_error(
                format!("Failed to remove object {}: {}", hash, e),
                Some(object_path),
            )),
        }
    }

    /// Total size of the object files on disk.
    pub fn storage_size(&self) -> u64 {
        if !self.objects_dir.exists() {
            return 0;
        }
        WalkDir::new(&self.objects_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.metadata().map(|m| m.len()).unwrap_or(0))
            .sum()
    }
}

/// Encrypted block store of one workspace.
pub struct BlockStore {
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteService>,
    workspace_key: SecretKey,
    remote_timeout: Duration,
}

impl BlockStore {
    pub fn new(
        cache: Arc<LocalCache>,
        remote: Arc<dyn RemoteService>,
        workspace_key: SecretKey,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            remote,
            workspace_key,
            remote_timeout,
        }
    }

    /// Encrypt `plaintext` with a fresh block key and persist it locally.
    ///
    /// The returned reference is placed at `offset` in its file. The block is
    /// not yet on the remote and stays pinned in the cache until pushed.
    pub async fn write(&self, offset: u64, plaintext: &[u8]) -> Result<BlockRef> {
        let block_key = SecretKey::generate();
        let ciphertext = block_key.encrypt(plaintext)?;
        let digest = BlockDigest::from_hex(ObjectStore::compute_hash(&ciphertext));

        self.cache.store_block(&digest, &ciphertext, false).await?;

        debug!(
            digest = %digest,
            offset,
            size = plaintext.len(),
            "Stored new block"
        );

        Ok(BlockRef {
            digest,
            offset,
            size: plaintext.len() as u64,
            key: self.workspace_key.wrap(&block_key)?,
        })
    }

    /// Plaintext of a block, fetched from the remote on a cache miss.
    pub async fn read(&self, block: &BlockRef) -> Result<Vec<u8>> {
        let ciphertext = match self.cache.load_block(&block.digest).await? {
            Some(data) => data,
            None => self.fetch_remote(&block.digest).await?,
        };

        let block_key = self.workspace_key.unwrap_key(&block.key)?;
        let plaintext = block_key.decrypt(&ciphertext)?;
        if plaintext.len() as u64 != block.size {
            return Err(WorkspaceError::Corrupted(format!(
                "block {} holds {} bytes, manifest expects {}",
                block.digest,
                plaintext.len(),
                block.size
            )));
        }
        Ok(plaintext)
    }

    async fn fetch_remote(&self, digest: &BlockDigest) -> Result<Vec<u8>> {
        let fetched = with_timeout(self.remote_timeout, self.remote.fetch_block(digest)).await;
        let ciphertext = match fetched {
            Ok(data) => data,
            Err(RemoteError::NotFound) => {
                return Err(WorkspaceError::BlockUnavailable {
                    digest: digest.clone(),
                    reason: BlockUnavailableReason::Missing,
                })
            }
            Err(RemoteError::Offline(_)) | Err(RemoteError::Timeout(_)) => {
                return Err(WorkspaceError::BlockUnavailable {
                    digest: digest.clone(),
                    reason: BlockUnavailableReason::Unreachable,
                })
            }
            Err(other) => return Err(other.into()),
        };

        if ObjectStore::compute_hash(&ciphertext) != digest.as_str() {
            return Err(WorkspaceError::Corrupted(format!(
                "remote block {} does not match its digest",
                digest
            )));
        }

        self.cache.store_block(digest, &ciphertext, true).await?;
        debug!(digest = %digest, size = ciphertext.len(), "Fetched block from remote");
        Ok(ciphertext)
    }

    /// Upload a block unless the remote already has it.
    ///
    /// Returns `false` when nothing had to be sent.
    ///
    /// # Errors
    ///
    /// `Corrupted` if an unpushed block is missing from the cache; transport
    /// errors are returned as is for the caller to retry.
    pub async fn push(&self, digest: &BlockDigest) -> Result<bool> {
        if self.cache.is_block_pushed(digest).await? {
            return Ok(false);
        }
        let ciphertext = self.cache.load_block(digest).await?.ok_or_else(|| {
            WorkspaceError::Corrupted(format!(
                "block {} was never pushed but is missing from the cache",
                digest
            ))
        })?;

        match with_timeout(
            self.remote_timeout,
            self.remote.push_block(digest, ciphertext),
        )
        .await
        {
            Ok(()) => {
                info!(digest = %digest, "Pushed block");
            }
            Err(RemoteError::AlreadyExists) => {
                debug!(digest = %digest, "Block already on remote");
            }
            Err(e) => return Err(e.into()),
        }

        self.cache.mark_block_pushed(digest).await?;
        Ok(true)
    }
}
