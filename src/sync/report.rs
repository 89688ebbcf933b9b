use crate::models::EntryId;
use serde::{Deserialize, Serialize};

/// Outcome of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Entries pushed, or found already up to date on the remote.
    pub synced: usize,
    /// Remote versions applied to clean local entries.
    pub applied: usize,
    /// Name collisions renamed plus files forked.
    pub conflicts: usize,
    /// Entries left dirty, with the error of their last attempt.
    pub failed: Vec<(EntryId, String)>,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.synced += other.synced;
        self.applied += other.applied;
        self.conflicts += other.conflicts;
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
