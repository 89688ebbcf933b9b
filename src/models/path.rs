//! Entry names and workspace paths

use crate::error::{Result, WorkspaceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length in bytes of a single entry name.
pub const MAX_ENTRY_NAME_BYTES: usize = 255;

/// A validated name of a folder child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryName(String);

impl EntryName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntryName {
    type Error = WorkspaceError;

    fn try_from(raw: String) -> Result<Self> {
        if raw.is_empty() {
            return Err(WorkspaceError::InvalidEntryName("empty name".to_string()));
        }
        if raw == "." || raw == ".." {
            return Err(WorkspaceError::InvalidEntryName(raw));
        }
        if raw.contains('/') || raw.contains('\0') {
            return Err(WorkspaceError::InvalidEntryName(format!(
                "{:?} contains a forbidden character",
                raw
            )));
        }
        if raw.len() > MAX_ENTRY_NAME_BYTES {
            return Err(WorkspaceError::InvalidEntryName(format!(
                "name is {} bytes long (max {})",
                raw.len(),
                MAX_ENTRY_NAME_BYTES
            )));
        }
        Ok(Self(raw))
    }
}

impl FromStr for EntryName {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s.to_string())
    }
}

impl From<EntryName> for String {
    fn from(name: EntryName) -> Self {
        name.0
    }
}

impl AsRef<str> for EntryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute path inside a workspace, e.g. `/docs/report.txt`.
///
/// Duplicated slashes and a trailing slash are accepted and normalised away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FsPath {
    parts: Vec<EntryName>,
}

impl FsPath {
    pub fn root() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[EntryName] {
        &self.parts
    }

    /// Last component, `None` for the root.
    pub fn name(&self) -> Option<&EntryName> {
        self.parts.last()
    }

    /// Parent path, `None` for the root.
    pub fn parent(&self) -> Option<FsPath> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Self {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, name: EntryName) -> FsPath {
        let mut parts = self.parts.clone();
        parts.push(name);
        Self { parts }
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn is_ancestor_or_self_of(&self, other: &FsPath) -> bool {
        other.parts.len() >= self.parts.len() && other.parts[..self.parts.len()] == self.parts[..]
    }
}

impl FromStr for FsPath {
    type Err = WorkspaceError;

    fn from_str(raw: &str) -> Result<Self> {
        if !raw.starts_with('/') {
            return Err(WorkspaceError::InvalidPath(format!(
                "{:?} is not absolute",
                raw
            )));
        }
        let parts = raw
            .split('/')
            .filter(|part| !part.is_empty())
            .map(EntryName::from_str)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| WorkspaceError::InvalidPath(format!("{:?}: {}", raw, e)))?;
        Ok(Self { parts })
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return f.write_str("/");
        }
        for part in &self.parts {
            write!(f, "/{}", part)?;
        }
        Ok(())
    }
}
