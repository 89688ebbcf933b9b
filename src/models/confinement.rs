//! Prevent-sync pattern
//!
//! Entries whose name matches the pattern, and everything below them, are
//! kept local: they are never pushed and never listed in a folder manifest
//! sent to the remote.

use crate::error::{Result, WorkspaceError};
use crate::models::path::EntryName;
use regex::Regex;

#[derive(Debug, Clone, Default)]
pub struct Confinement {
    pattern: Option<Regex>,
}

impl Confinement {
    pub fn new(pattern: Option<&str>) -> Result<Self> {
        let pattern = pattern
            .map(|raw| {
                Regex::new(raw).map_err(|e| {
                    WorkspaceError::Config(format!("Invalid prevent-sync pattern: {}", e))
                })
            })
            .transpose()?;
        Ok(Self { pattern })
    }

    pub fn disabled() -> Self {
        Self { pattern: None }
    }

    pub fn matches(&self, name: &EntryName) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|re| re.is_match(name.as_str()))
    }

    /// Confinement of a child named `name` inside a folder.
    pub fn child_confined(&self, parent_confined: bool, name: &EntryName) -> bool {
        parent_confined || self.matches(name)
    }
}
