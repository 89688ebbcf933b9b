use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::{BlockDigest, EntryId};

/// Why a block could not be produced by the block store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockUnavailableReason {
    /// Neither the local cache nor the remote service holds the block.
    Missing,
    /// The block is not cached and the remote service could not be reached.
    Unreachable,
}

impl std::fmt::Display for BlockUnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => f.write_str("missing"),
            Self::Unreachable => f.write_str("remote unreachable"),
        }
    }
}

/// Coarse error taxonomy used by callers to decide between retrying,
/// reporting to the user and tearing down the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Resource,
    Transport,
    Fatal,
    Usage,
}

/**
 * Workspace engine error type
 *
 * Every public operation of the filesystem layer and of the sync engine
 * returns this enum; nothing panics across the public boundary.
 */
#[derive(Error, Debug, Diagnostic)]
pub enum WorkspaceError {
    #[error("Entry not found: {path}")]
    #[diagnostic(code(wsync::entry_not_found))]
    EntryNotFound { path: String },

    #[error("Parent folder not found: {path}")]
    #[diagnostic(
        code(wsync::parent_not_found),
        help("Create the parent folder first (create_folder creates intermediate folders)")
    )]
    ParentNotFound { path: String },

    #[error("Block {digest} unavailable ({reason})")]
    #[diagnostic(code(wsync::block_unavailable))]
    BlockUnavailable {
        digest: BlockDigest,
        reason: BlockUnavailableReason,
    },

    #[error("Not a directory: {path}")]
    #[diagnostic(code(wsync::not_a_directory))]
    NotADirectory { path: String },

    #[error("Not a file: {path}")]
    #[diagnostic(code(wsync::not_a_file))]
    NotAFile { path: String },

    #[error("Entry already exists: {path}")]
    #[diagnostic(code(wsync::entry_exists))]
    EntryExists { path: String },

    #[error("Destination already exists: {path}")]
    #[diagnostic(
        code(wsync::destination_exists),
        help("Use MoveEntryMode::CanReplace to overwrite the destination")
    )]
    DestinationExists { path: String },

    #[error("Version conflict on {entry_id}: expected {expected}, found {actual}")]
    #[diagnostic(code(wsync::version_conflict))]
    VersionConflict {
        entry_id: EntryId,
        expected: u64,
        actual: u64,
    },

    #[error("Bad file descriptor: {0}")]
    #[diagnostic(code(wsync::bad_file_descriptor))]
    BadFileDescriptor(u32),

    #[error("Invalid open options: {0}")]
    #[diagnostic(
        code(wsync::invalid_open_options),
        help("`truncate` requires `write`, and at least one of `read`/`write`/`append` must be set")
    )]
    InvalidOpenOptions(String),

    #[error("File descriptor {0} is not open for writing")]
    #[diagnostic(code(wsync::read_only_descriptor))]
    ReadOnlyDescriptor(u32),

    #[error("File descriptor {0} is not open for reading")]
    #[diagnostic(code(wsync::write_only_descriptor))]
    WriteOnlyDescriptor(u32),

    #[error("Partial write: {written} of {expected} bytes")]
    #[diagnostic(code(wsync::partial_write))]
    PartialWrite { written: usize, expected: usize },

    #[error("File too large: {len} bytes at offset {offset} pass the maximum file size")]
    #[diagnostic(code(wsync::file_too_large))]
    FileTooLarge { offset: u64, len: u64 },

    #[error("Invalid entry name: {0}")]
    #[diagnostic(code(wsync::invalid_entry_name))]
    InvalidEntryName(String),

    #[error("Invalid path: {0}")]
    #[diagnostic(
        code(wsync::invalid_path),
        help("Paths are absolute and slash separated, e.g. /docs/report.txt")
    )]
    InvalidPath(String),

    #[error("The workspace root cannot be removed")]
    #[diagnostic(code(wsync::cannot_remove_root))]
    CannotRemoveRoot,

    #[error("Invalid move: {0}")]
    #[diagnostic(code(wsync::invalid_move))]
    InvalidMove(String),

    #[error("Folder not empty: {path}")]
    #[diagnostic(code(wsync::folder_not_empty))]
    FolderNotEmpty { path: String },

    #[error("Remote service unreachable: {0}")]
    #[diagnostic(code(wsync::offline))]
    Offline(String),

    #[error("Remote operation timed out after {0} ms")]
    #[diagnostic(code(wsync::timeout))]
    Timeout(u64),

    #[error("Permission denied: {0}")]
    #[diagnostic(code(wsync::permission_denied))]
    PermissionDenied(String),

    #[error("Operation cancelled")]
    #[diagnostic(code(wsync::cancelled))]
    Cancelled,

    #[error("Workspace session is stopped")]
    #[diagnostic(code(wsync::stopped))]
    Stopped,

    #[error("Local cache corrupted: {0}")]
    #[diagnostic(
        code(wsync::corrupted),
        help("The workspace sync loop was halted; the local cache must be rebuilt")
    )]
    Corrupted(String),

    #[error("Decryption failed: {0}")]
    #[diagnostic(code(wsync::decryption))]
    Decryption(String),

    #[error("Database error: {0}")]
    #[diagnostic(
        code(wsync::database_error),
        help("Check database connection and schema integrity")
    )]
    Database(String),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(wsync::serialization))]
    Serialization(String),

    #[error("IO error: {message}")]
    #[diagnostic(code(wsync::io_error))]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Configuration error: {0}")]
    #[diagnostic(code(wsync::config_error))]
    Config(String),

    #[error("Internal error: {0}")]
    #[diagnostic(code(wsync::internal_error))]
    Internal(String),
}

impl WorkspaceError {
    /// Map the error onto the taxonomy exposed to callers.
    pub fn category(&self) -> ErrorCategory {
        use WorkspaceError::*;
        match self {
            EntryNotFound { .. } | ParentNotFound { .. } => ErrorCategory::NotFound,
            VersionConflict { .. } | EntryExists { .. } | DestinationExists { .. } => {
                ErrorCategory::Conflict
            }
            BadFileDescriptor(_)
            | BlockUnavailable { .. }
            | ReadOnlyDescriptor(_)
            | WriteOnlyDescriptor(_)
            | PartialWrite { .. }
            | Stopped
            | Cancelled => ErrorCategory::Resource,
            Offline(_) | Timeout(_) => ErrorCategory::Transport,
            Corrupted(_) | Decryption(_) | Database(_) | Serialization(_) | Io { .. }
            | Internal(_) => ErrorCategory::Fatal,
            NotADirectory { .. }
            | NotAFile { .. }
            | InvalidOpenOptions(_)
            | InvalidEntryName(_)
            | InvalidPath(_)
            | CannotRemoveRoot
            | InvalidMove(_)
            | FileTooLarge { .. }
            | FolderNotEmpty { .. }
            | PermissionDenied(_)
            | Config(_) => ErrorCategory::Usage,
        }
    }

    /// Transport failures are the only errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }

    /// Fatal errors halt the workspace sync loop.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }

    pub fn entry_not_found(path: impl std::fmt::Display) -> Self {
        WorkspaceError::EntryNotFound {
            path: path.to_string(),
        }
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        WorkspaceError::Database(message.into())
    }

    pub fn io_error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        WorkspaceError::Io {
            message: message.into(),
            path,
        }
    }

    pub fn serialization(message: impl std::fmt::Display) -> Self {
        WorkspaceError::Serialization(message.to_string())
    }
}

impl From<std::io::Error> for WorkspaceError {
    fn from(err: std::io::Error) -> Self {
        WorkspaceError::io_error(err.to_string(), None)
    }
}

impl From<sqlx::Error> for WorkspaceError {
    fn from(err: sqlx::Error) -> Self {
        WorkspaceError::database_error(err.to_string())
    }
}

impl From<bincode::Error> for WorkspaceError {
    fn from(err: bincode::Error) -> Self {
        WorkspaceError::serialization(err)
    }
}

/// Errors of the remote storage service contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("not found on remote")]
    NotFound,
    #[error("remote version conflict (current version {current})")]
    VersionConflict { current: u64 },
    #[error("already exists on remote")]
    AlreadyExists,
    #[error("remote unreachable: {0}")]
    Offline(String),
    #[error("remote call timed out after {0} ms")]
    Timeout(u64),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("remote internal error: {0}")]
    Internal(String),
}

impl From<RemoteError> for WorkspaceError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Offline(msg) => WorkspaceError::Offline(msg),
            RemoteError::Timeout(ms) => WorkspaceError::Timeout(ms),
            RemoteError::PermissionDenied(msg) => WorkspaceError::PermissionDenied(msg),
            other => WorkspaceError::Internal(format!("unexpected remote reply: {}", other)),
        }
    }
}

/// Unified result type for the engine.
pub type Result<T> = std::result::Result<T, WorkspaceError>;
