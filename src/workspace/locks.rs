//! Per-entry async locks
//!
//! At most one mutation or sync attempt runs per entry at a time. Operations
//! touching several entries take all their locks at once through
//! [`EntryLocks::lock_many`], which acquires them in entry id order so two
//! such operations can never deadlock.

use crate::models::EntryId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<EntryId, Arc<Mutex<()>>>;

/// A lock exists only while some task holds or waits for it.
#[derive(Default)]
pub struct EntryLocks {
    locks: Arc<LockMap>,
}

/// Held locks; released on drop.
pub struct EntryGuards {
    locks: Arc<LockMap>,
    guards: Vec<(EntryId, OwnedMutexGuard<()>)>,
}

impl Drop for EntryGuards {
    fn drop(&mut self) {
        for (entry_id, guard) in self.guards.drain(..) {
            drop(guard);
            // the map holds the last reference: nobody waits for it
            self.locks
                .remove_if(&entry_id, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

impl EntryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, entry_id: EntryId) -> Arc<Mutex<()>> {
        self.locks.entry(entry_id).or_default().clone()
    }

    pub async fn lock(&self, entry_id: EntryId) -> EntryGuards {
        self.lock_many([entry_id]).await
    }

    pub async fn lock_many(&self, entry_ids: impl IntoIterator<Item = EntryId>) -> EntryGuards {
        let mut ids: Vec<EntryId> = entry_ids.into_iter().collect();
        ids.sort();
        ids.dedup();

        let mut held = EntryGuards {
            locks: self.locks.clone(),
            guards: Vec::with_capacity(ids.len()),
        };
        for id in ids {
            let guard = self.mutex(id).lock_owned().await;
            held.guards.push((id, guard));
        }
        held
    }

    /// True when no lock is held or awaited.
    pub(crate) fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
