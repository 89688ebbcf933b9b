//! Workspace filesystem operations
//!
//! The operation layer exposed to callers: path based entry operations,
//! file descriptors and history, all implemented on [`WorkspaceSession`].

pub mod context;
pub mod entry_ops;
pub mod fd;
pub mod fd_ops;
pub mod file_ops;
pub mod history;
pub mod locks;
pub mod session;


pub use context::WorkspaceContext;
pub use entry_ops::{EntryStat, MoveEntryMode};
pub use fd::OpenOptions;
pub use fd_ops::FdStat;
pub use file_ops::MAX_READ_SIZE;
pub use history::{EntryVersion, RemoteEntryVersion};
pub use session::WorkspaceSession;
