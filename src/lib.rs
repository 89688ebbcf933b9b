//! Workspace synchronization and encrypted local storage engine
//!
//! A workspace is a tree of files and folders kept in an encrypted local
//! cache and synchronized with a remote storage service:
//!
//! - [`storage`]: the SQLite local cache, the content addressed block store
//!   and the versioned manifest store
//! - [`workspace`]: filesystem operations on a started [`WorkspaceSession`]
//! - [`sync`]: outbound and inbound reconciliation with the remote
//! - [`remote`]: the remote service contract and an in-process double
//! - [`events`]: observational events published per session
//!
//! ```no_run
//! # async fn demo() -> workspace_sync::Result<()> {
//! use std::sync::Arc;
//! use workspace_sync::{
//!     DeviceId, EngineConfig, InMemoryRemote, OpenOptions, SecretKey, WorkspaceId,
//!     WorkspaceSession,
//! };
//!
//! let session = WorkspaceSession::start(
//!     EngineConfig::default(),
//!     WorkspaceId::new(),
//!     SecretKey::generate(),
//!     DeviceId::new(),
//!     Arc::new(InMemoryRemote::new()),
//! )
//! .await?;
//!
//! let fd = session
//!     .open_file("/notes.txt", OpenOptions::read_write().with_create())
//!     .await?;
//! session.fd_write(fd, 0, b"hello").await?;
//! session.fd_close(fd).await?;
//! session.sync_now().await?;
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod infrastructure;
pub mod logging;
pub mod models;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod workspace;

pub use error::{BlockUnavailableReason, ErrorCategory, RemoteError, Result, WorkspaceError};
pub use events::{EventBus, WorkspaceEvent};
pub use infrastructure::config::{ConfigLoader, EngineConfig};
pub use logging::init_tracing;
pub use models::{
    Confinement, DeviceId, EntryId, EntryKind, EntryName, FileDescriptor, FsPath, WorkspaceId,
};
pub use remote::{InMemoryRemote, RemoteService};
pub use storage::{CacheUsage, SecretKey};
pub use sync::SyncReport;
pub use workspace::{
    EntryStat, EntryVersion, FdStat, MoveEntryMode, OpenOptions, RemoteEntryVersion,
    WorkspaceSession, MAX_READ_SIZE,
};
