//! Open file descriptors
//!
//! A descriptor is a process-local handle on (entry, open mode, cursor). It
//! becomes invalid once closed; every later use fails with
//! `BadFileDescriptor`.

use crate::error::{Result, WorkspaceError};
use crate::models::{EntryId, FileDescriptor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Flags of [`crate::workspace::WorkspaceSession::open_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    /// Writes always go to the end of the file. Implies `write`.
    pub append: bool,
    /// Resize to zero on open. Requires `write`.
    pub truncate: bool,
    /// Create the file if missing.
    pub create: bool,
    /// Create the file, failing with `EntryExists` if the path resolves.
    pub create_new: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }

    pub fn with_create_new(mut self) -> Self {
        self.create_new = true;
        self
    }

    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn with_append(mut self) -> Self {
        self.append = true;
        self
    }

    pub fn writable(&self) -> bool {
        self.write || self.append
    }

    pub fn validate(&self) -> Result<()> {
        if !self.read && !self.writable() {
            return Err(WorkspaceError::InvalidOpenOptions(
                "one of read, write or append is required".to_string(),
            ));
        }
        if self.truncate && !self.writable() {
            return Err(WorkspaceError::InvalidOpenOptions(
                "truncate requires write".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdState {
    pub entry_id: EntryId,
    pub options: OpenOptions,
    /// Position after the last read or write.
    pub cursor: u64,
}

pub struct FdTable {
    next: AtomicU32,
    open: Mutex<HashMap<u32, FdState>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, entry_id: EntryId, options: OpenOptions) -> FileDescriptor {
        let fd = self.next.fetch_add(1, Ordering::SeqCst);
        self.open.lock().insert(
            fd,
            FdState {
                entry_id,
                options,
                cursor: 0,
            },
        );
        FileDescriptor(fd)
    }

    pub fn get(&self, fd: FileDescriptor) -> Result<FdState> {
        self.open
            .lock()
            .get(&fd.0)
            .copied()
            .ok_or(WorkspaceError::BadFileDescriptor(fd.0))
    }

    /// State of `fd`, checking it was opened for reading.
    pub fn get_readable(&self, fd: FileDescriptor) -> Result<FdState> {
        let state = self.get(fd)?;
        if !state.options.read {
            return Err(WorkspaceError::WriteOnlyDescriptor(fd.0));
        }
        Ok(state)
    }

    /// State of `fd`, checking it was opened for writing.
    pub fn get_writable(&self, fd: FileDescriptor) -> Result<FdState> {
        let state = self.get(fd)?;
        if !state.options.writable() {
            return Err(WorkspaceError::ReadOnlyDescriptor(fd.0));
        }
        Ok(state)
    }

    pub fn set_cursor(&self, fd: FileDescriptor, cursor: u64) {
        if let Some(state) = self.open.lock().get_mut(&fd.0) {
            state.cursor = cursor;
        }
    }

    pub fn close(&self, fd: FileDescriptor) -> Result<FdState> {
        self.open
            .lock()
            .remove(&fd.0)
            .ok_or(WorkspaceError::BadFileDescriptor(fd.0))
    }

    pub fn close_all(&self) -> usize {
        let mut open = self.open.lock();
        let count = open.len();
        open.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
