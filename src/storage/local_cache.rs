//! SQLite-backed local cache of one workspace
//!
//! Persists every committed manifest version, the per-entry bookkeeping the
//! sync engine relies on (current version, base version, dirty flag) and the
//! index of cached blocks. Block content itself lives in the sharded
//! [`ObjectStore`] next to the database.
//!
//! ## Database Schema
//!
//! - `manifest_versions`: encrypted manifest per (entry, local version)
//! - `entries`: current version and sync flags of each entry (the Dirty Set
//!   is `need_sync = 1`)
//! - `blocks`: cached block digests with size, LRU clock and pushed flag
//! - `sync_state`: small key/value store (remote change checkpoint)
//!
//! ## Crash safety
//!
//! A manifest version and its entry row are written in one transaction, so a
//! version is never visible without its dirty flag or the other way round.

use crate::error::{Result, WorkspaceError};
use crate::models::{BlockDigest, EntryId, LocalManifest, WorkspaceId};
use crate::storage::cas::ObjectStore;
use crate::storage::crypto::SecretKey;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const CHECKPOINT_KEY: &str = "remote_checkpoint";

/// One manifest to commit, checked against the entry's current local version.
#[derive(Debug, Clone)]
pub struct ManifestUpdate {
    pub manifest: LocalManifest,
    /// 0 when the entry is not yet known locally.
    pub expected_version: u64,
}

impl ManifestUpdate {
    pub fn new(manifest: LocalManifest, expected_version: u64) -> Self {
        Self {
            manifest,
            expected_version,
        }
    }

    /// Update on top of the manifest's own version.
    pub fn on_top(manifest: LocalManifest) -> Self {
        let expected_version = manifest.version;
        Self::new(manifest, expected_version)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub blocks: u64,
    /// Indexed block bytes, the figure compared with the budget.
    pub bytes: u64,
    /// Object files actually on disk, orphans of interrupted writes included.
    pub disk_bytes: u64,
    pub budget: u64,
}

pub struct LocalCache {
    pool: SqlitePool,
    objects: ObjectStore,
    key: SecretKey,
    cache_budget: u64,
    workspace_dir: PathBuf,
    /// Logical LRU clock, more precise than wall time.
    access_clock: AtomicU64,
    /// Serializes writers: a commit reads versions then writes, and SQLite
    /// refuses to upgrade a read snapshot that another writer made stale.
    write_lock: tokio::sync::Mutex<()>,
    /// Blocks written locally but not yet referenced by a committed manifest.
    uncommitted_blocks: parking_lot::Mutex<HashSet<BlockDigest>>,
}

impl LocalCache {
    /// Open (or create) the cache of `workspace_id` under `data_dir`.
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Parent directory; the cache lives in a per-workspace subdirectory
    /// * `key` - Workspace key sealing the stored manifests and blocks
    /// * `cache_budget` - Size the clean block cache is evicted down to
    pub async fn open(
        data_dir: &Path,
        workspace_id: WorkspaceId,
        key: SecretKey,
        cache_budget: u64,
    ) -> Result<Self> {
        let workspace_dir = data_dir.join(workspace_id.to_string());
        tokio::fs::create_dir_all(&workspace_dir)
            .await
            .map_err(|e| {
                WorkspaceError::io_error(
                    format!("Failed to create workspace directory: {}", e),
                    Some(workspace_dir.clone()),
                )
            })?;

        let db_path = workspace_dir.join("cache.db");
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

        info!(path = %db_path.display(), "Opening local cache");

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&db_url)
            .await
            .map_err(|e| {
                WorkspaceError::database_error(format!("Failed to connect to database: {}", e))
            })?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(|e| {
                WorkspaceError::database_error(format!("Failed to enable WAL mode: {}", e))
            })?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await
            .map_err(|e| {
                WorkspaceError::database_error(format!("Failed to set synchronous mode: {}", e))
            })?;

        Self::init_schema(&pool).await?;

        let clock: i64 = sqlx::query("SELECT COALESCE(MAX(last_access), 0) AS clock FROM blocks")
            .fetch_one(&pool)
            .await?
            .get("clock");

        Ok(Self {
            pool,
            objects: ObjectStore::new(workspace_dir.clone()),
            key,
            cache_budget,
            workspace_dir,
            access_clock: AtomicU64::new(clock as u64),
            write_lock: tokio::sync::Mutex::new(()),
            uncommitted_blocks: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS manifest_versions (
                entry_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                blob BLOB NOT NULL,
                committed_at INTEGER NOT NULL,
                PRIMARY KEY (entry_id, version)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| {
            WorkspaceError::database_error(format!(
                "Failed to create manifest_versions table: {}",
                e
            ))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                entry_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                base_version INTEGER NOT NULL,
                need_sync INTEGER NOT NULL,
                confined INTEGER NOT NULL,
                tombstone INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| {
            WorkspaceError::database_error(format!("Failed to create entries table: {}", e))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                digest TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                last_access INTEGER NOT NULL,
                pushed INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| {
            WorkspaceError::database_error(format!("Failed to create blocks table: {}", e))
        })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_state (key TEXT PRIMARY KEY, value INTEGER NOT NULL)",
        )
        .execute(pool)
        .await
        .map_err(|e| {
            WorkspaceError::database_error(format!("Failed to create sync_state table: {}", e))
        })?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_need_sync ON entries(need_sync)")
            .execute(pool)
            .await
            .map_err(|e| WorkspaceError::database_error(format!("Failed to create index: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blocks_last_access ON blocks(last_access)")
            .execute(pool)
            .await
            .map_err(|e| WorkspaceError::database_error(format!("Failed to create index: {}", e)))?;

        Ok(())
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    fn encode(&self, manifest: &LocalManifest) -> Result<Vec<u8>> {
        let raw = bincode::serialize(manifest)?;
        self.key.encrypt(&raw)
    }

    fn decode(&self, entry_id: EntryId, version: u64, blob: &[u8]) -> Result<LocalManifest> {
        let raw = self.key.decrypt(blob)?;
        let manifest: LocalManifest = bincode::deserialize(&raw).map_err(|e| {
            WorkspaceError::Corrupted(format!("manifest {} v{}: {}", entry_id, version, e))
        })?;
        if manifest.id() != entry_id || manifest.version != version {
            return Err(WorkspaceError::Corrupted(format!(
                "manifest row {} v{} holds {} v{}",
                entry_id,
                version,
                manifest.id(),
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Current version of an entry.
    pub async fn load_manifest(&self, entry_id: EntryId) -> Result<Option<LocalManifest>> {
        let row = sqlx::query(
            r#"
            SELECT mv.version AS version, mv.blob AS blob
            FROM entries e
            JOIN manifest_versions mv
              ON mv.entry_id = e.entry_id AND mv.version = e.version
            WHERE e.entry_id = ?
            "#,
        )
        .bind(entry_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let version: i64 = row.get("version");
                let blob: Vec<u8> = row.get("blob");
                self.decode(entry_id, version as u64, &blob).map(Some)
            }
            None => Ok(None),
        }
    }

    pub async fn load_manifest_version(
        &self,
        entry_id: EntryId,
        version: u64,
    ) -> Result<Option<LocalManifest>> {
        let row = sqlx::query(
            "SELECT blob FROM manifest_versions WHERE entry_id = ? AND version = ?",
        )
        .bind(entry_id.to_string())
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let blob: Vec<u8> = row.get("blob");
                self.decode(entry_id, version, &blob).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Every locally committed version of an entry, oldest first.
    pub async fn history(&self, entry_id: EntryId) -> Result<Vec<LocalManifest>> {
        let rows = sqlx::query(
            "SELECT version, blob FROM manifest_versions WHERE entry_id = ? ORDER BY version",
        )
        .bind(entry_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let version: i64 = row.get("version");
                let blob: Vec<u8> = row.get("blob");
                self.decode(entry_id, version as u64, &blob)
            })
            .collect()
    }

    pub async fn commit(&self, update: ManifestUpdate) -> Result<LocalManifest> {
        let mut committed = self.commit_many(vec![update]).await?;
        committed
            .pop()
            .ok_or_else(|| WorkspaceError::Internal("empty commit result".to_string()))
    }

    /// Commit several manifests atomically.
    ///
    /// Each manifest is stored as `expected_version + 1`; if any entry is not
    /// at its expected version nothing is written and `VersionConflict` is
    /// returned.
    pub async fn commit_many(&self, updates: Vec<ManifestUpdate>) -> Result<Vec<LocalManifest>> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(|e| {
            WorkspaceError::database_error(format!("Failed to begin transaction: {}", e))
        })?;
        let now = chrono::Utc::now().timestamp();
        let mut committed = Vec::with_capacity(updates.len());

        for update in updates {
            let mut manifest = update.manifest;
            let entry_id = manifest.id();
            manifest.content.validate()?;

            let actual: i64 = sqlx::query("SELECT version FROM entries WHERE entry_id = ?")
                .bind(entry_id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get("version"))
                .unwrap_or(0);

            if actual as u64 != update.expected_version {
                return Err(WorkspaceError::VersionConflict {
                    entry_id,
                    expected: update.expected_version,
                    actual: actual as u64,
                });
            }

            manifest.version = update.expected_version + 1;
            let blob = self.encode(&manifest)?;

            sqlx::query(
                r#"
                INSERT INTO manifest_versions (entry_id, version, blob, committed_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(entry_id.to_string())
            .bind(manifest.version as i64)
            .bind(blob)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                WorkspaceError::database_error(format!("Failed to insert manifest: {}", e))
            })?;

            sqlx::query(
                r#"
                INSERT INTO entries (entry_id, version, base_version, need_sync, confined, tombstone)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(entry_id) DO UPDATE SET
                    version = excluded.version,
                    base_version = excluded.base_version,
                    need_sync = excluded.need_sync,
                    confined = excluded.confined,
                    tombstone = excluded.tombstone
                "#,
            )
            .bind(entry_id.to_string())
            .bind(manifest.version as i64)
            .bind(manifest.base_version as i64)
            .bind(manifest.need_sync)
            .bind(manifest.confined)
            .bind(manifest.tombstone)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                WorkspaceError::database_error(format!("Failed to update entry: {}", e))
            })?;

            debug!(
                entry_id = %entry_id,
                version = manifest.version,
                base_version = manifest.base_version,
                need_sync = manifest.need_sync,
                "Committed manifest"
            );
            committed.push(manifest);
        }

        tx.commit().await.map_err(|e| {
            WorkspaceError::database_error(format!("Failed to commit transaction: {}", e))
        })?;

        let mut uncommitted = self.uncommitted_blocks.lock();
        for manifest in &committed {
            if let Some(file) = manifest.content.as_file() {
                for block in &file.blocks {
                    uncommitted.remove(&block.digest);
                }
            }
        }
        drop(uncommitted);
        Ok(committed)
    }

    /// Entries with local changes to push, excluding confined and removed ones.
    pub async fn dirty_entries(&self) -> Result<Vec<EntryId>> {
        let rows = sqlx::query(
            "SELECT entry_id FROM entries WHERE need_sync = 1 AND confined = 0 AND tombstone = 0",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("entry_id");
                raw.parse::<EntryId>().map_err(|e| {
                    WorkspaceError::Corrupted(format!("invalid entry id {:?}: {}", raw, e))
                })
            })
            .collect()
    }

    /// Remote version the local copy of an entry derives from, if known.
    pub async fn base_version(&self, entry_id: EntryId) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT base_version FROM entries WHERE entry_id = ?")
            .bind(entry_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("base_version") as u64))
    }

    fn tick(&self) -> i64 {
        (self.access_clock.fetch_add(1, Ordering::SeqCst) + 1) as i64
    }

    /// Persist a block; `pushed` is true when the remote is known to hold it.
    pub async fn store_block(&self, digest: &BlockDigest, data: &[u8], pushed: bool) -> Result<()> {
        if !pushed {
            // not evictable until a manifest points at it
            self.uncommitted_blocks.lock().insert(digest.clone());
        }
        self.objects.store(digest.as_str(), data).await?;

        let write = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO blocks (digest, size, last_access, pushed)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(digest) DO UPDATE SET
                last_access = excluded.last_access,
                pushed = MAX(pushed, excluded.pushed)
            "#,
        )
        .bind(digest.as_str())
        .bind(data.len() as i64)
        .bind(self.tick())
        .bind(pushed)
        .execute(&self.pool)
        .await
        .map_err(|e| WorkspaceError::database_error(format!("Failed to index block: {}", e)))?;
        drop(write);

        self.evict_to_budget().await?;
        Ok(())
    }

    /// Cached ciphertext of a block. A corrupted object is dropped and
    /// reported as missing so it gets fetched again.
    pub async fn load_block(&self, digest: &BlockDigest) -> Result<Option<Vec<u8>>> {
        let Some(data) = self.objects.read(digest.as_str()).await? else {
            return Ok(None);
        };

        if ObjectStore::compute_hash(&data) != digest.as_str() {
            warn!(digest = %digest, "Cached block does not match its digest, dropping it");
            self.forget_block(digest).await?;
            return Ok(None);
        }

        let _write = self.write_lock.lock().await;
        sqlx::query("UPDATE blocks SET last_access = ? WHERE digest = ?")
            .bind(self.tick())
            .bind(digest.as_str())
            .execute(&self.pool)
            .await?;
        Ok(Some(data))
    }

    pub async fn is_block_pushed(&self, digest: &BlockDigest) -> Result<bool> {
        let row = sqlx::query("SELECT pushed FROM blocks WHERE digest = ?")
            .bind(digest.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<bool, _>("pushed")).unwrap_or(false))
    }

    pub async fn mark_block_pushed(&self, digest: &BlockDigest) -> Result<()> {
        self.uncommitted_blocks.lock().remove(digest);
        let _write = self.write_lock.lock().await;
        sqlx::query("UPDATE blocks SET pushed = 1 WHERE digest = ?")
            .bind(digest.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn forget_block(&self, digest: &BlockDigest) -> Result<()> {
        let _write = self.write_lock.lock().await;
        self.objects.remove(digest.as_str()).await?;
        sqlx::query("DELETE FROM blocks WHERE digest = ?")
            .bind(digest.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number and total size of the indexed blocks.
    async fn indexed_usage(&self) -> Result<(u64, u64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS blocks, COALESCE(SUM(size), 0) AS bytes FROM blocks",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.get::<i64, _>("blocks") as u64,
            row.get::<i64, _>("bytes") as u64,
        ))
    }

    pub async fn cache_usage(&self) -> Result<CacheUsage> {
        let (blocks, bytes) = self.indexed_usage().await?;
        let objects = self.objects.clone();
        let disk_bytes = tokio::task::spawn_blocking(move || objects.storage_size())
            .await
            .map_err(|e| WorkspaceError::Internal(format!("Disk usage scan failed: {}", e)))?;
        Ok(CacheUsage {
            blocks,
            bytes,
            disk_bytes,
            budget: self.cache_budget,
        })
    }

    /// Digests that exist only locally and are referenced by the current
    /// version of an entry with unpushed changes.
    async fn pinned_blocks(&self) -> Result<HashSet<BlockDigest>> {
        let rows = sqlx::query(
            r#"
            SELECT mv.entry_id AS entry_id, mv.version AS version, mv.blob AS blob
            FROM entries e
            JOIN manifest_versions mv
              ON mv.entry_id = e.entry_id AND mv.version = e.version
            WHERE e.need_sync = 1 AND e.tombstone = 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pinned = HashSet::new();
        for row in rows {
            let raw_id: String = row.get("entry_id");
            let entry_id: EntryId = raw_id.parse().map_err(|e| {
                WorkspaceError::Corrupted(format!("invalid entry id {:?}: {}", raw_id, e))
            })?;
            let version: i64 = row.get("version");
            let blob: Vec<u8> = row.get("blob");
            let manifest = self.decode(entry_id, version as u64, &blob)?;
            if let Some(file) = manifest.content.as_file() {
                pinned.extend(file.blocks.iter().map(|b| b.digest.clone()));
            }
        }
        Ok(pinned)
    }

    /// Evict least recently used blocks until the cache fits its budget.
    ///
    /// Blocks that only exist locally and are still needed by a dirty
    /// manifest are never evicted, even if the budget stays exceeded.
    pub async fn evict_to_budget(&self) -> Result<usize> {
        let (_, indexed_bytes) = self.indexed_usage().await?;
        if indexed_bytes <= self.cache_budget {
            return Ok(0);
        }

        let mut pinned = self.pinned_blocks().await?;
        pinned.extend(self.uncommitted_blocks.lock().iter().cloned());
        let rows = sqlx::query("SELECT digest, size, pushed FROM blocks ORDER BY last_access ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut bytes = indexed_bytes;
        let mut evicted = 0usize;
        for row in rows {
            if bytes <= self.cache_budget {
                break;
            }
            let digest = BlockDigest::from_hex(row.get::<String, _>("digest"));
            let pushed: bool = row.get("pushed");
            if !pushed && pinned.contains(&digest) {
                continue;
            }
            self.forget_block(&digest).await?;
            bytes = bytes.saturating_sub(row.get::<i64, _>("size") as u64);
            evicted += 1;
        }

        if evicted > 0 {
            info!(
                evicted,
                bytes,
                budget = self.cache_budget,
                "Evicted blocks from local cache"
            );
        }
        if bytes > self.cache_budget {
            warn!(
                bytes,
                budget = self.cache_budget,
                "Cache budget exceeded by blocks awaiting upload"
            );
        }
        Ok(evicted)
    }

    pub async fn checkpoint(&self) -> Result<u64> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?")
            .bind(CHECKPOINT_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("value") as u64).unwrap_or(0))
    }

    pub async fn set_checkpoint(&self, checkpoint: u64) -> Result<()> {
        let _write = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CHECKPOINT_KEY)
        .bind(checkpoint as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
