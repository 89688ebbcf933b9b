//! Sync engine
//!
//! Reconciles the local cache of a workspace with the remote service in two
//! independent directions: outbound pushes dirty entries, inbound applies
//! remote changes to clean ones. Both work entry by entry under the
//! per-entry lock, so at most one sync attempt runs per entry.

pub mod inbound;
pub mod merge;
pub mod monitor;
pub mod outbound;
pub mod report;


pub use inbound::{apply_remote_change, inbound_pass, InboundOutcome};
pub use merge::{
    get_conflict_filename, merge_children, merge_remote_into_local, rename_with_suffix,
    MergeOutcome, CONTENT_CONFLICT_SUFFIX, NAME_CONFLICT_SUFFIX,
};
pub use outbound::{outbound_pass, sync_entry, EntrySyncOutcome};
pub use report::SyncReport;
