//! Typed slot storage for loaded assets.
//!
//! Each slot carries a generation (bumped on reuse), a strong
//! reference count, a GC grace countdown and the lifecycle status.
//! Status transitions into `Ready`/`Failed` emit events exactly once
//! per transition: the from-state guard applies to every transition,
//! so `Failed → Failed` stays silent.

use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use super::handle::{Handle, WeakHandle};
use super::loader::{AssetLoader, LoadContext};
use super::{Asset, AssetError, AssetErrorInfo, AssetEvent, AssetEventKind, AssetStatus};

/// Borrowed view of a loaded asset (holds the storage lock)
pub type AssetRef<'a, T> = MappedMutexGuard<'a, T>;

struct Slot<T> {
    generation: u32,
    next_free: u32,
    ref_count: u32,
    gc_countdown: u32,
    alive: bool,
    persistent: bool,
    status: AssetStatus,
    error: Option<AssetErrorInfo>,
    asset: Option<Box<T>>,
}

impl<T> Slot<T> {
    fn new(next_free: u32) -> Self {
        Self {
            generation: 0,
            next_free,
            ref_count: 0,
            gc_countdown: 0,
            alive: false,
            persistent: false,
            status: AssetStatus::NotLoaded,
            error: None,
            asset: None,
        }
    }
}

struct StorageInner<T: Asset> {
    slots: Vec<Slot<T>>,
    first_free: u32,
    count: usize,
    loader: Option<Box<dyn AssetLoader<T>>>,
    placeholder: Option<Box<T>>,
    events: VecDeque<AssetEvent<T>>,
    bytes_used: usize,
    /// 0 = unlimited
    budget: usize,
}

impl<T: Asset> StorageInner<T> {
    fn valid(&self, index: u32, generation: u32) -> bool {
        match self.slots.get(index as usize) {
            Some(slot) => slot.alive && slot.generation == generation,
            None => false,
        }
    }

    fn emit(&mut self, kind: AssetEventKind, index: u32, generation: u32) {
        self.events.push_back(AssetEvent {
            kind,
            handle: WeakHandle::new(Handle::new(index, generation)),
        });
    }

    /// Transition the slot's status, emitting on the edge only.
    fn set_status(&mut self, index: u32, status: AssetStatus) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        if !slot.alive || slot.status == status {
            return;
        }
        slot.status = status;
        let generation = slot.generation;
        match status {
            AssetStatus::Ready => self.emit(AssetEventKind::Loaded, index, generation),
            AssetStatus::Failed => self.emit(AssetEventKind::Failed, index, generation),
            _ => {}
        }
    }

    fn asset_size(&self, asset: &T) -> usize {
        match &self.loader {
            Some(loader) => loader.size_of(asset),
            None => std::mem::size_of::<T>(),
        }
    }

    fn store_asset(&mut self, index: u32, asset: T) {
        let size = self.asset_size(&asset);
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.asset = Some(Box::new(asset));
            self.bytes_used += size;
        }
    }

    /// Decode bytes into the slot via the registered loader, driving
    /// `Loading → Ready/Failed`.
    fn decode(&mut self, index: u32, generation: u32, path: &str, bytes: &[u8]) -> bool {
        if !self.valid(index, generation) {
            return false;
        }

        if self.loader.is_none() {
            self.set_error(index, AssetErrorInfo::new(AssetError::NoLoader));
            self.set_status(index, AssetStatus::Failed);
            return false;
        }

        self.set_status(index, AssetStatus::Loading);

        let result = {
            // Presence checked above
            let loader = self.loader.as_ref().unwrap();
            loader.load(LoadContext { path, bytes })
        };
        match result {
            Ok(asset) => {
                self.store_asset(index, asset);
                self.set_status(index, AssetStatus::Ready);
                true
            }
            Err(error) => {
                self.set_error(index, error);
                self.set_status(index, AssetStatus::Failed);
                false
            }
        }
    }

    fn set_error(&mut self, index: u32, error: AssetErrorInfo) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            if slot.alive {
                slot.error = Some(error);
            }
        }
    }

    /// Unload and release a slot: drop the asset through the loader,
    /// subtract its size, bump the generation and return the slot to
    /// the free list.
    fn unload(&mut self, index: u32) {
        let generation = match self.slots.get(index as usize) {
            Some(slot) if slot.alive => slot.generation,
            _ => return,
        };
        self.emit(AssetEventKind::Unloaded, index, generation);

        let slot = &mut self.slots[index as usize];
        if let Some(asset) = slot.asset.take() {
            let size = match &self.loader {
                Some(loader) => loader.size_of(&asset),
                None => std::mem::size_of::<T>(),
            };
            self.bytes_used = self.bytes_used.saturating_sub(size);
            if let Some(loader) = &self.loader {
                loader.unload(*asset);
            }
        }

        let slot = &mut self.slots[index as usize];
        slot.alive = false;
        slot.status = AssetStatus::Unloaded;
        slot.error = None;
        slot.ref_count = 0;
        slot.gc_countdown = 0;
        slot.persistent = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.first_free;
        self.first_free = index;
        self.count -= 1;
    }

    /// GC pass. Over budget: eligible slots unload immediately until
    /// usage fits. Otherwise eligible slots count down `grace` frames,
    /// resetting whenever the asset is re-referenced.
    fn collect_garbage(&mut self, grace: u32) -> usize {
        let mut collected = 0;
        let mut over_budget = self.budget > 0 && self.bytes_used > self.budget;

        for index in 0..self.slots.len() as u32 {
            let slot = &mut self.slots[index as usize];
            if !slot.alive {
                continue;
            }

            // Re-referenced while counting down: reset
            if slot.ref_count > 0 && slot.gc_countdown > 0 {
                slot.gc_countdown = 0;
                continue;
            }

            if slot.ref_count != 0 || slot.status != AssetStatus::Ready || slot.persistent {
                continue;
            }

            if over_budget {
                self.unload(index);
                collected += 1;
                over_budget = self.budget > 0 && self.bytes_used > self.budget;
                continue;
            }

            if grace == 0 {
                self.unload(index);
                collected += 1;
                continue;
            }

            if slot.gc_countdown == 0 {
                slot.gc_countdown = grace;
            } else {
                slot.gc_countdown -= 1;
                if slot.gc_countdown == 0 {
                    self.unload(index);
                    collected += 1;
                }
            }
        }
        collected
    }
}

/// Thread-safe typed storage; one per asset type on the server.
pub struct AssetStorage<T: Asset> {
    inner: Mutex<StorageInner<T>>,
}

impl<T: Asset> AssetStorage<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "asset storage capacity must be > 0");
        assert!(capacity <= u32::MAX as usize);

        let mut slots: Vec<Slot<T>> = (0..capacity)
            .map(|i| Slot::new(i as u32 + 1))
            .collect();
        slots[capacity - 1].next_free = u32::MAX;

        Self {
            inner: Mutex::new(StorageInner {
                slots,
                first_free: 0,
                count: 0,
                loader: None,
                placeholder: None,
                events: VecDeque::new(),
                bytes_used: 0,
                budget: 0,
            }),
        }
    }

    pub fn set_loader(&self, loader: Box<dyn AssetLoader<T>>) {
        self.inner.lock().loader = Some(loader);
    }

    pub fn has_loader(&self) -> bool {
        self.inner.lock().loader.is_some()
    }

    pub fn set_placeholder(&self, placeholder: T) {
        self.inner.lock().placeholder = Some(Box::new(placeholder));
    }

    /// Allocate a slot from the free list. `None` when full.
    pub fn allocate_slot(&self) -> Option<Handle<T>> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let index = inner.first_free;
        if index == u32::MAX {
            return None;
        }

        let slot = &mut inner.slots[index as usize];
        inner.first_free = slot.next_free;
        slot.alive = true;
        slot.ref_count = 0;
        slot.gc_countdown = 0;
        slot.persistent = false;
        slot.status = AssetStatus::NotLoaded;
        slot.error = None;
        slot.asset = None;
        let generation = slot.generation;
        inner.count += 1;

        Some(Handle::new(index, generation))
    }

    pub fn is_handle_valid(&self, index: u32, generation: u32) -> bool {
        self.inner.lock().valid(index, generation)
    }

    pub(crate) fn increment_ref_validated(&self, handle: Handle<T>) {
        let mut inner = self.inner.lock();
        if inner.valid(handle.index(), handle.generation()) {
            inner.slots[handle.index() as usize].ref_count += 1;
        }
    }

    pub(crate) fn decrement_ref_validated(&self, handle: Handle<T>) {
        let mut inner = self.inner.lock();
        if inner.valid(handle.index(), handle.generation()) {
            let slot = &mut inner.slots[handle.index() as usize];
            debug_assert!(slot.ref_count > 0, "ref count underflow");
            slot.ref_count = slot.ref_count.saturating_sub(1);
        }
    }

    pub fn ref_count(&self, index: u32) -> u32 {
        let inner = self.inner.lock();
        match inner.slots.get(index as usize) {
            Some(slot) if slot.alive => slot.ref_count,
            _ => 0,
        }
    }

    pub fn status(&self, handle: Handle<T>) -> AssetStatus {
        let inner = self.inner.lock();
        match inner.slots.get(handle.index() as usize) {
            Some(slot) if slot.alive && slot.generation == handle.generation() => slot.status,
            _ => AssetStatus::NotLoaded,
        }
    }

    pub fn error(&self, handle: Handle<T>) -> Option<AssetErrorInfo> {
        let inner = self.inner.lock();
        match inner.slots.get(handle.index() as usize) {
            Some(slot) if slot.alive && slot.generation == handle.generation() => {
                slot.error.clone()
            }
            _ => None,
        }
    }

    /// The loaded asset, only when `Ready`.
    pub fn get(&self, handle: Handle<T>) -> Option<AssetRef<'_, T>> {
        MutexGuard::try_map(self.inner.lock(), |inner| {
            let slot = inner.slots.get_mut(handle.index() as usize)?;
            if !slot.alive
                || slot.generation != handle.generation()
                || slot.status != AssetStatus::Ready
            {
                return None;
            }
            slot.asset.as_deref_mut()
        })
        .ok()
    }

    /// The loaded asset when `Ready`, the registered placeholder
    /// otherwise, `None` when neither exists.
    pub fn get_or_placeholder(&self, handle: Handle<T>) -> Option<AssetRef<'_, T>> {
        MutexGuard::try_map(self.inner.lock(), |inner| {
            let ready = match inner.slots.get(handle.index() as usize) {
                Some(slot) => {
                    slot.alive
                        && slot.generation == handle.generation()
                        && slot.status == AssetStatus::Ready
                        && slot.asset.is_some()
                }
                None => false,
            };
            if ready {
                inner.slots[handle.index() as usize].asset.as_deref_mut()
            } else {
                inner.placeholder.as_deref_mut()
            }
        })
        .ok()
    }

    /// Synchronous decode into an allocated slot.
    pub fn load_from_bytes(&self, handle: Handle<T>, path: &str, bytes: &[u8]) -> bool {
        self.inner
            .lock()
            .decode(handle.index(), handle.generation(), path, bytes)
    }

    /// Mark an allocated slot as waiting on async IO.
    pub fn mark_queued(&self, handle: Handle<T>) {
        self.inner.lock().set_status(handle.index(), AssetStatus::Queued);
    }

    /// Fail an allocated slot with `error`.
    pub fn set_failed(&self, handle: Handle<T>, error: AssetErrorInfo) {
        let mut inner = self.inner.lock();
        if inner.valid(handle.index(), handle.generation()) {
            inner.set_error(handle.index(), error);
            inner.set_status(handle.index(), AssetStatus::Failed);
        }
    }

    /// Swap the asset in place from new bytes, emitting `Reloaded`.
    pub fn reload(&self, handle: Handle<T>, path: &str, bytes: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if !inner.valid(handle.index(), handle.generation()) {
            return false;
        }
        let Some(loader) = &inner.loader else {
            return false;
        };

        let new_asset = match loader.load(LoadContext { path, bytes }) {
            Ok(asset) => asset,
            Err(_) => return false,
        };

        // Unload the old value before the swap
        let index = handle.index() as usize;
        if let Some(old) = inner.slots[index].asset.take() {
            let size = inner.asset_size(&old);
            inner.bytes_used = inner.bytes_used.saturating_sub(size);
            if let Some(loader) = &inner.loader {
                loader.unload(*old);
            }
        }

        inner.store_asset(handle.index(), new_asset);
        inner.slots[index].status = AssetStatus::Ready;
        inner.emit(AssetEventKind::Reloaded, handle.index(), handle.generation());
        true
    }

    /// One GC pass; see `StorageInner::collect_garbage`.
    pub fn collect_garbage(&self, grace: u32) -> usize {
        self.inner.lock().collect_garbage(grace)
    }

    pub fn poll_event(&self) -> Option<AssetEvent<T>> {
        self.inner.lock().events.pop_front()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.lock().bytes_used
    }

    pub fn set_budget(&self, bytes: usize) {
        self.inner.lock().budget = bytes;
    }

    pub fn set_persistent(&self, handle: Handle<T>, persistent: bool) {
        let mut inner = self.inner.lock();
        if inner.valid(handle.index(), handle.generation()) {
            inner.slots[handle.index() as usize].persistent = persistent;
        }
    }

    pub fn gc_countdown(&self, index: u32) -> u32 {
        let inner = self.inner.lock();
        inner
            .slots
            .get(index as usize)
            .map_or(0, |slot| slot.gc_countdown)
    }
}

/// Type-erased face the server stores in its storage map
pub(crate) trait AnyAssetStorage: Send + Sync {
    fn asset_type_id(&self) -> TypeId;
    fn is_valid(&self, index: u32, generation: u32) -> bool;
    fn add_ref(&self, index: u32, generation: u32);
    fn gc(&self, grace: u32) -> usize;
    fn complete_load(
        &self,
        index: u32,
        generation: u32,
        path: &str,
        result: Result<Vec<u8>, AssetErrorInfo>,
    );
    fn live_count(&self) -> usize;
    fn used_bytes(&self) -> usize;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Asset> AnyAssetStorage for AssetStorage<T> {
    fn asset_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn is_valid(&self, index: u32, generation: u32) -> bool {
        self.is_handle_valid(index, generation)
    }

    fn add_ref(&self, index: u32, generation: u32) {
        self.increment_ref_validated(Handle::new(index, generation));
    }

    fn gc(&self, grace: u32) -> usize {
        self.collect_garbage(grace)
    }

    fn complete_load(
        &self,
        index: u32,
        generation: u32,
        path: &str,
        result: Result<Vec<u8>, AssetErrorInfo>,
    ) {
        let handle = Handle::new(index, generation);
        match result {
            Ok(bytes) => {
                self.load_from_bytes(handle, path, &bytes);
            }
            Err(error) => {
                self.set_failed(handle, error);
            }
        }
    }

    fn live_count(&self) -> usize {
        self.count()
    }

    fn used_bytes(&self) -> usize {
        self.bytes_used()
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
