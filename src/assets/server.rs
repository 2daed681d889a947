//! Asset server: typed storages, path dedup, sync/async loading and
//! the per-frame update pump (IO completions + GC).

use std::any::TypeId;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

#[cfg(feature = "profiling")]
use tracing::info_span;

use super::handle::{Handle, StrongHandle, WeakHandle};
use super::io::{IoScheduler, LoadPriority, RequestId};
use super::loader::AssetLoader;
use super::storage::{AnyAssetStorage, AssetRef, AssetStorage};
use super::{Asset, AssetError, AssetErrorInfo, AssetEvent, AssetStatus};

pub const DEFAULT_STORAGE_CAPACITY: usize = 4096;

struct PendingLoad {
    index: u32,
    generation: u32,
    type_id: TypeId,
    path: String,
}

/// Central asset manager.
///
/// Loads are deduplicated by `(type, path)`; repeated loads of the
/// same path return handles to the same slot with one extra strong
/// reference. With an [`IoScheduler`] attached, `load` queues the read
/// and `update` drains completions; without one, `load` reads and
/// decodes synchronously on the calling thread.
pub struct AssetServer {
    storages: RwLock<AHashMap<TypeId, Arc<dyn AnyAssetStorage>>>,
    path_cache: Mutex<AHashMap<(TypeId, String), (u32, u32)>>,
    base_path: PathBuf,
    io: Option<IoScheduler>,
    pending_loads: Mutex<AHashMap<RequestId, PendingLoad>>,
    gc_grace_frames: AtomicU32,
    storage_capacity: usize,
}

impl AssetServer {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            storages: RwLock::new(AHashMap::new()),
            path_cache: Mutex::new(AHashMap::new()),
            base_path: base_path.into(),
            io: None,
            pending_loads: Mutex::new(AHashMap::new()),
            gc_grace_frames: AtomicU32::new(0),
            storage_capacity: DEFAULT_STORAGE_CAPACITY,
        }
    }

    /// Server with an async IO pump attached; `load` becomes
    /// non-blocking (`Queued` until a later `update` resolves it).
    pub fn with_io(base_path: impl Into<PathBuf>, io: IoScheduler) -> Self {
        let mut server = Self::new(base_path);
        server.io = Some(io);
        server
    }

    pub fn has_io(&self) -> bool {
        self.io.is_some()
    }

    // ========== Registration ==========

    pub fn register_loader<T: Asset, L: AssetLoader<T> + 'static>(&self, loader: L) {
        self.storage::<T>().set_loader(Box::new(loader));
    }

    /// Per-type fallback returned by `get` while an asset is not ready.
    pub fn register_placeholder<T: Asset>(&self, placeholder: T) {
        self.storage::<T>().set_placeholder(placeholder);
    }

    // ========== Loading ==========

    /// Load an asset by path, deduplicating against previous loads.
    pub fn load<T: Asset>(&self, path: &str) -> StrongHandle<T> {
        #[cfg(feature = "profiling")]
        let span = info_span!("asset.load", path);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let storage = self.storage::<T>();
        let type_id = TypeId::of::<T>();
        let key = (type_id, path.to_string());

        if let Some(handle) = self.cached_handle(&storage, &key) {
            return handle;
        }

        if !storage.has_loader() {
            return self.fail_new_slot(storage, key, AssetErrorInfo::new(AssetError::NoLoader));
        }

        let Some(handle) = storage.allocate_slot() else {
            return StrongHandle::null();
        };

        // Async path: queue the read, resolve at a later update
        if let Some(io) = &self.io {
            storage.mark_queued(handle);
            let request = io.submit(self.base_path.join(path), LoadPriority::Normal);
            self.pending_loads.lock().insert(
                request,
                PendingLoad {
                    index: handle.index(),
                    generation: handle.generation(),
                    type_id,
                    path: path.to_string(),
                },
            );
            return self.finish_handle(storage, key, handle);
        }

        // Sync path: read + decode on this thread
        match std::fs::read(self.base_path.join(path)) {
            Ok(bytes) => {
                storage.load_from_bytes(handle, path, &bytes);
            }
            Err(error) => {
                storage.set_failed(
                    handle,
                    AssetErrorInfo::with_message(AssetError::FileNotFound, &error.to_string()),
                );
            }
        }
        self.finish_handle(storage, key, handle)
    }

    /// Load from raw bytes under a logical name. Always synchronous.
    pub fn load_from_memory<T: Asset>(&self, name: &str, bytes: &[u8]) -> StrongHandle<T> {
        let storage = self.storage::<T>();
        let key = (TypeId::of::<T>(), name.to_string());

        if let Some(handle) = self.cached_handle(&storage, &key) {
            return handle;
        }

        if !storage.has_loader() {
            return self.fail_new_slot(storage, key, AssetErrorInfo::new(AssetError::NoLoader));
        }

        let Some(handle) = storage.allocate_slot() else {
            return StrongHandle::null();
        };

        storage.load_from_bytes(handle, name, bytes);
        self.finish_handle(storage, key, handle)
    }

    // ========== Access ==========

    /// The loaded asset if `Ready`, otherwise the registered
    /// placeholder, otherwise `None`.
    pub fn get<'h, T: Asset>(&self, handle: &'h StrongHandle<T>) -> Option<AssetRef<'h, T>> {
        let storage = handle.storage()?;
        storage.get_or_placeholder(handle.raw())
    }

    pub fn status<T: Asset>(&self, handle: &StrongHandle<T>) -> AssetStatus {
        match handle.storage() {
            Some(storage) => storage.status(handle.raw()),
            None => AssetStatus::NotLoaded,
        }
    }

    pub fn is_ready<T: Asset>(&self, handle: &StrongHandle<T>) -> bool {
        self.status(handle) == AssetStatus::Ready
    }

    pub fn error<T: Asset>(&self, handle: &StrongHandle<T>) -> Option<AssetErrorInfo> {
        handle.storage()?.error(handle.raw())
    }

    // ========== Handles ==========

    /// Promote a weak handle. Null when the slot was unloaded or
    /// reused (generation mismatch).
    pub fn lock<T: Asset>(&self, weak: WeakHandle<T>) -> StrongHandle<T> {
        if weak.is_invalid() {
            return StrongHandle::null();
        }
        let Some(storage) = self.find_storage::<T>() else {
            return StrongHandle::null();
        };
        let raw = weak.raw();
        if !storage.is_handle_valid(raw.index(), raw.generation()) {
            return StrongHandle::null();
        }
        storage.increment_ref_validated(raw);
        StrongHandle::new(raw, storage)
    }

    /// Explicitly release a strong handle (sets it to null).
    pub fn release<T: Asset>(&self, handle: &mut StrongHandle<T>) {
        *handle = StrongHandle::null();
    }

    // ========== Hot reload ==========

    /// Swap the asset's contents in place from new bytes; emits a
    /// `Reloaded` event. Handles stay valid.
    pub fn reload<T: Asset>(&self, handle: &StrongHandle<T>, bytes: &[u8]) -> bool {
        match handle.storage() {
            Some(storage) => storage.reload(handle.raw(), "", bytes),
            None => false,
        }
    }

    // ========== Lifecycle ==========

    /// Per-frame pump: drain IO completions into their slots, then run
    /// one GC pass over every storage.
    pub fn update(&self) {
        if let Some(io) = &self.io {
            let mut completions = Vec::new();
            io.drain_completions(&mut completions);
            for completion in completions {
                let Some(pending) = self.pending_loads.lock().remove(&completion.id) else {
                    continue;
                };
                let Some(storage) = self.storages.read().get(&pending.type_id).cloned() else {
                    continue;
                };
                let result = completion.result.map_err(|error| {
                    AssetErrorInfo::with_message(AssetError::FileNotFound, &error.to_string())
                });
                storage.complete_load(pending.index, pending.generation, &pending.path, result);
            }
        }

        let grace = self.gc_grace_frames.load(Ordering::Relaxed);
        let storages: Vec<_> = self.storages.read().values().cloned().collect();
        for storage in storages {
            storage.gc(grace);
        }
    }

    // ========== GC configuration ==========

    pub fn set_gc_grace_frames(&self, frames: u32) {
        self.gc_grace_frames.store(frames, Ordering::Relaxed);
    }

    pub fn gc_grace_frames(&self) -> u32 {
        self.gc_grace_frames.load(Ordering::Relaxed)
    }

    /// Pin an asset: persistent slots are never garbage collected.
    pub fn set_persistent<T: Asset>(&self, handle: &StrongHandle<T>, persistent: bool) {
        if let Some(storage) = handle.storage() {
            storage.set_persistent(handle.raw(), persistent);
        }
    }

    /// Per-type byte budget; exceeding it makes the next GC pass
    /// unload unreferenced assets immediately, grace or not.
    pub fn set_budget<T: Asset>(&self, bytes: usize) {
        self.storage::<T>().set_budget(bytes);
    }

    pub fn bytes_used<T: Asset>(&self) -> usize {
        self.find_storage::<T>().map_or(0, |s| s.bytes_used())
    }

    // ========== Events & stats ==========

    /// Poll one queued event for asset type `T`.
    pub fn poll_events<T: Asset>(&self) -> Option<AssetEvent<T>> {
        self.find_storage::<T>()?.poll_event()
    }

    pub fn total_asset_count(&self) -> usize {
        self.storages
            .read()
            .values()
            .map(|storage| storage.live_count())
            .sum()
    }

    pub fn ref_count<T: Asset>(&self, handle: &StrongHandle<T>) -> u32 {
        match handle.storage() {
            Some(storage) => storage.ref_count(handle.raw().index()),
            None => 0,
        }
    }

    // ========== Internals ==========

    fn storage<T: Asset>(&self) -> Arc<AssetStorage<T>> {
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.storages.read().get(&type_id) {
            return Self::downcast::<T>(existing.clone());
        }

        let mut storages = self.storages.write();
        let entry = storages.entry(type_id).or_insert_with(|| {
            Arc::new(AssetStorage::<T>::new(self.storage_capacity)) as Arc<dyn AnyAssetStorage>
        });
        Self::downcast::<T>(entry.clone())
    }

    fn find_storage<T: Asset>(&self) -> Option<Arc<AssetStorage<T>>> {
        let storage = self.storages.read().get(&TypeId::of::<T>())?.clone();
        Some(Self::downcast::<T>(storage))
    }

    fn downcast<T: Asset>(storage: Arc<dyn AnyAssetStorage>) -> Arc<AssetStorage<T>> {
        storage
            .as_any_arc()
            .downcast::<AssetStorage<T>>()
            .expect("asset storage type confusion")
    }

    fn cached_handle<T: Asset>(
        &self,
        storage: &Arc<AssetStorage<T>>,
        key: &(TypeId, String),
    ) -> Option<StrongHandle<T>> {
        let cache = self.path_cache.lock();
        let &(index, generation) = cache.get(key)?;
        if !storage.is_handle_valid(index, generation) {
            // Stale entry (slot was GC'd); the caller re-loads
            return None;
        }
        let handle = Handle::new(index, generation);
        storage.increment_ref_validated(handle);
        Some(StrongHandle::new(handle, storage.clone()))
    }

    fn finish_handle<T: Asset>(
        &self,
        storage: Arc<AssetStorage<T>>,
        key: (TypeId, String),
        handle: Handle<T>,
    ) -> StrongHandle<T> {
        storage.increment_ref_validated(handle);
        self.path_cache
            .lock()
            .insert(key, (handle.index(), handle.generation()));
        StrongHandle::new(handle, storage)
    }

    fn fail_new_slot<T: Asset>(
        &self,
        storage: Arc<AssetStorage<T>>,
        key: (TypeId, String),
        error: AssetErrorInfo,
    ) -> StrongHandle<T> {
        let Some(handle) = storage.allocate_slot() else {
            return StrongHandle::null();
        };
        storage.set_failed(handle, error);
        self.finish_handle(storage, key, handle)
    }
}

impl Drop for AssetServer {
    fn drop(&mut self) {
        if let Some(io) = &self.io {
            io.shutdown();
        }
    }
}
