//! Configuration management
//!
//! Engine configuration is layered: built-in defaults, then an optional
//! TOML/JSON file, then `WSYNC_`-prefixed environment variables
//! (`WSYNC_SYNC__MAX_RETRIES=8`). The merged result is validated before use.

use crate::error::{Result, WorkspaceError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

const ENV_PREFIX: &str = "WSYNC";

/// Root of the engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    #[validate(nested)]
    pub storage: StorageConfig,

    #[validate(nested)]
    pub sync: SyncConfig,

    #[validate(nested)]
    pub confinement: ConfinementConfig,

    #[validate(nested)]
    pub events: EventsConfig,

    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Local cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; each workspace gets its own subdirectory.
    pub data_dir: PathBuf,

    #[validate(range(min = 4096, max = 67108864))]
    pub block_size: u64,

    #[validate(range(min = 1048576))]
    pub cache_budget_bytes: u64,

    #[validate(range(min = 16, max = 1000000))]
    pub manifest_cache_capacity: u64,
}

/// Sync timing, retry and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SyncConfig {
    #[validate(range(max = 32))]
    pub max_retries: usize,

    #[validate(range(min = 1, max = 60000))]
    pub initial_backoff_ms: u64,

    #[validate(range(min = 1, max = 600000))]
    pub max_backoff_ms: u64,

    #[validate(range(max = 60000))]
    pub outbound_debounce_ms: u64,

    #[validate(range(min = 10, max = 3600000))]
    pub inbound_poll_interval_ms: u64,

    /// Fetch-merge-push rounds for one entry before giving up in a pass.
    #[validate(range(min = 1, max = 100))]
    pub max_rounds_per_entry: usize,

    #[validate(range(min = 1, max = 600000))]
    pub remote_timeout_ms: u64,

    #[validate(range(min = 1, max = 64))]
    pub max_concurrent_block_uploads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConfinementConfig {
    /// Entries whose name matches are never synchronized.
    #[validate(custom(function = "validate_pattern"))]
    pub prevent_sync_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EventsConfig {
    #[validate(range(min = 1, max = 1000000))]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    #[validate(length(min = 1, max = 100))]
    pub level: String,

    pub json: bool,

    /// Daily rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            block_size: 512 * 1024,
            cache_budget_bytes: 256 * 1024 * 1024,
            manifest_cache_capacity: 10_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            outbound_debounce_ms: 200,
            inbound_poll_interval_ms: 5_000,
            max_rounds_per_entry: 8,
            remote_timeout_ms: 30_000,
            max_concurrent_block_uploads: 4,
        }
    }
}

impl Default for ConfinementConfig {
    fn default() -> Self {
        // Editor swap and lock files
        Self {
            prevent_sync_pattern: Some(r"^(\.~lock\..*#|.*\.swp|~\$.*|.*\.tmp)$".to_string()),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_dir: None,
        }
    }
}

fn validate_pattern(pattern: &str) -> std::result::Result<(), validator::ValidationError> {
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|_| validator::ValidationError::new("invalid_regex"))
}

impl EngineConfig {
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| WorkspaceError::Config(format!("Invalid configuration: {}", e)))?;
        if self.sync.initial_backoff_ms > self.sync.max_backoff_ms {
            return Err(WorkspaceError::Config(
                "sync.initial_backoff_ms exceeds sync.max_backoff_ms".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Builds an [`EngineConfig`] from defaults, a file and the environment.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(file: Option<&Path>) -> Result<EngineConfig> {
        let defaults = config::Config::try_from(&EngineConfig::default())
            .map_err(|e| WorkspaceError::Config(format!("Failed to encode defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            if !path.exists() {
                return Err(WorkspaceError::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let merged: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WorkspaceError::Config(format!("Failed to load configuration: {}", e)))?;

        merged.validated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default().validated().unwrap();
        assert_eq!(config.storage.block_size, 512 * 1024);
        assert_eq!(config.storage.cache_budget_bytes, 256 * 1024 * 1024);
        assert_eq!(config.sync.max_retries, 4);
        assert_eq!(config.sync.remote_timeout_ms, 30_000);
        assert_eq!(config.events.channel_capacity, 1000);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut config = EngineConfig::default();
        config.storage.block_size = 10;
        assert!(matches!(
            config.validated(),
            Err(WorkspaceError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let mut config = EngineConfig::default();
        config.confinement.prevent_sync_pattern = Some("(unclosed".to_string());
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = EngineConfig::default();
        config.sync.initial_backoff_ms = 20_000;
        config.sync.max_backoff_ms = 1_000;
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "[storage]\nblock_size = 65536\n\n[sync]\nremote_timeout_ms = 5000\n",
        )
        .unwrap();

        let config = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(config.storage.block_size, 65536);
        assert_eq!(config.sync.remote_timeout_ms, 5000);
        // untouched keys keep their defaults
        assert_eq!(config.sync.max_retries, 4);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = ConfigLoader::load(Some(Path::new("/nonexistent/engine.toml")));
        assert!(matches!(result, Err(WorkspaceError::Config(_))));
    }
}
