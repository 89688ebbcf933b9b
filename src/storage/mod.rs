//! Local storage of a workspace
//!
//! ```text
//! <data_dir>/<workspace_id>/
//! ├── cache.db             # SQLite: manifest versions, entries, block index
//! └── objects/             # Encrypted blocks (sharded by digest)
//!     ├── a3/
//!     │   └── f2e1d4c5...
//!     └── b7/
//!         └── e145a3b2...
//! ```
//!
//! Everything written here is encrypted: manifests with the workspace key,
//! blocks with their own key (wrapped by the workspace key in the manifest).

pub mod cas;
pub mod crypto;
pub mod local_cache;
pub mod manifest_store;


pub use cas::{BlockStore, ObjectStore};
pub use crypto::SecretKey;
pub use local_cache::{CacheUsage, LocalCache, ManifestUpdate};
pub use manifest_store::ManifestStore;
