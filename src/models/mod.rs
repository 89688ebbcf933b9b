pub mod confinement;
pub mod ids;
pub mod manifest;
pub mod path;

// Re-export core types
pub use confinement::Confinement;
pub use ids::{BlockDigest, DeviceId, EntryId, FileDescriptor, WorkspaceId};
pub use manifest::{
    BlockRef, EntryKind, FileManifest, FolderManifest, LocalManifest, ManifestContent,
    RemoteManifest, WrappedKey,
};
pub use path::{EntryName, FsPath, MAX_ENTRY_NAME_BYTES};
