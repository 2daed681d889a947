// Asset runtime
//
// Typed slot storage with generational handles, reference counting,
// an async load pump and garbage collection under a size budget.

pub mod handle;
pub mod io;
pub mod loader;
pub mod server;
pub mod storage;

pub use handle::{Handle, StrongHandle, WeakHandle};
pub use io::{IoCompletion, IoScheduler, IoSchedulerConfig, LoadPriority, RequestId};
pub use loader::{
    AssetLoader, BytesAsset, BytesLoader, JsonAsset, JsonLoader, LoadContext, TextAsset,
    TextLoader,
};
pub use server::AssetServer;
pub use storage::{AssetRef, AssetStorage};

use crate::util::FixedString;

/// Anything storable in a typed asset storage
pub trait Asset: Send + Sync + 'static {}
impl<T: Send + Sync + 'static> Asset for T {}

/// Asset lifecycle state machine:
/// `NotLoaded → Queued → Loading → {Ready, Failed} → Unloaded`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    NotLoaded,
    /// Waiting on the async IO pump
    Queued,
    Loading,
    Ready,
    Failed,
    Unloaded,
}

/// Transient load fault kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetError {
    NoLoader,
    FileNotFound,
    LoadFailed,
    DecodeFailed,
}

/// Fault stored on the slot, observable via `AssetServer::error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetErrorInfo {
    pub kind: AssetError,
    pub message: FixedString<64>,
}

impl AssetErrorInfo {
    pub fn new(kind: AssetError) -> Self {
        Self {
            kind,
            message: FixedString::new(),
        }
    }

    pub fn with_message(kind: AssetError, message: &str) -> Self {
        Self {
            kind,
            message: FixedString::from_str(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetEventKind {
    Loaded,
    Failed,
    Reloaded,
    Unloaded,
}

/// Per-type event emitted on slot status transitions.
///
/// Carries a weak handle: observing an event must not keep the asset
/// alive.
#[derive(Debug)]
pub struct AssetEvent<T: Asset> {
    pub kind: AssetEventKind,
    pub handle: WeakHandle<T>,
}

impl<T: Asset> Clone for AssetEvent<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Asset> Copy for AssetEvent<T> {}

/// Opaque 128-bit key identifying an immutable blob in the content
/// store. The runtime carries these through; it never derives them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(u128);

impl ContentHash {
    pub const fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub const fn to_bits(self) -> u128 {
        self.0
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Logical path → content hash mapping from a pak's manifest block
#[derive(Debug, Default)]
pub struct AssetManifest {
    entries: ahash::AHashMap<String, ContentHash>,
}

impl AssetManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, hash: ContentHash) {
        self.entries.insert(path.into(), hash);
    }

    pub fn get(&self, path: &str) -> Option<ContentHash> {
        self.entries.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ContentHash)> {
        self.entries.iter().map(|(path, hash)| (path.as_str(), *hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_roundtrip() {
        let bytes = [7u8; 16];
        let hash = ContentHash::from_bytes(bytes);
        assert_eq!(hash.to_bytes(), bytes);
        assert_eq!(format!("{hash}").len(), 32);
    }

    #[test]
    fn test_manifest_lookup() {
        let mut manifest = AssetManifest::new();
        manifest.insert("meshes/crate.nmsh", ContentHash::from_bits(42));

        assert_eq!(
            manifest.get("meshes/crate.nmsh"),
            Some(ContentHash::from_bits(42))
        );
        assert_eq!(manifest.get("missing"), None);
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_error_info_message_truncates() {
        let long = "x".repeat(200);
        let info = AssetErrorInfo::with_message(AssetError::DecodeFailed, &long);
        assert_eq!(info.message.len(), 64);
        assert_eq!(info.kind, AssetError::DecodeFailed);
    }
}
