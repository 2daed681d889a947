//! Generational asset handles.
//!
//! `StrongHandle` is RAII: cloning bumps the slot's reference count,
//! dropping decrements it, and a slot with zero strong references is a
//! GC candidate. `WeakHandle` observes without keeping anything alive;
//! `AssetServer::lock` is the only way to look through it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use super::storage::AssetStorage;
use super::Asset;

/// Raw `{index, generation}` slot address
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn invalid() -> Self {
        Self::new(u32::MAX, 0)
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    pub fn is_invalid(self) -> bool {
        self.index == u32::MAX
    }
}

// Manual impls: the handle is Copy regardless of T
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Non-owning observer handle
pub struct WeakHandle<T: Asset> {
    raw: Handle<T>,
}

impl<T: Asset> WeakHandle<T> {
    pub(crate) fn new(raw: Handle<T>) -> Self {
        Self { raw }
    }

    pub fn invalid() -> Self {
        Self {
            raw: Handle::invalid(),
        }
    }

    pub fn raw(self) -> Handle<T> {
        self.raw
    }

    pub fn is_invalid(self) -> bool {
        self.raw.is_invalid()
    }
}

impl<T: Asset> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Asset> Copy for WeakHandle<T> {}

impl<T: Asset> PartialEq for WeakHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T: Asset> Eq for WeakHandle<T> {}

impl<T: Asset> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Weak{:?}", self.raw)
    }
}

/// Owning, reference-counted handle.
///
/// Holds its storage so drop-time decrement needs no server lookup.
pub struct StrongHandle<T: Asset> {
    raw: Handle<T>,
    storage: Option<Arc<AssetStorage<T>>>,
}

impl<T: Asset> StrongHandle<T> {
    /// Wrap an already-incremented slot reference.
    pub(crate) fn new(raw: Handle<T>, storage: Arc<AssetStorage<T>>) -> Self {
        Self {
            raw,
            storage: Some(storage),
        }
    }

    pub fn null() -> Self {
        Self {
            raw: Handle::invalid(),
            storage: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_invalid() || self.storage.is_none()
    }

    pub fn raw(&self) -> Handle<T> {
        self.raw
    }

    pub fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle::new(self.raw)
    }

    pub(crate) fn storage(&self) -> Option<&Arc<AssetStorage<T>>> {
        self.storage.as_ref()
    }
}

impl<T: Asset> Clone for StrongHandle<T> {
    fn clone(&self) -> Self {
        if let Some(storage) = &self.storage {
            storage.increment_ref_validated(self.raw);
        }
        Self {
            raw: self.raw,
            storage: self.storage.clone(),
        }
    }
}

impl<T: Asset> Drop for StrongHandle<T> {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            storage.decrement_ref_validated(self.raw);
        }
    }
}

impl<T: Asset> Default for StrongHandle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Asset> PartialEq for StrongHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T: Asset> Eq for StrongHandle<T> {}

impl<T: Asset> fmt::Debug for StrongHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Strong{:?}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_identity() {
        let a: Handle<u32> = Handle::new(1, 2);
        let b: Handle<u32> = Handle::new(1, 2);
        let c: Handle<u32> = Handle::new(1, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_invalid());
        assert!(Handle::<u32>::invalid().is_invalid());
    }

    #[test]
    fn test_null_strong_handle() {
        let handle: StrongHandle<u32> = StrongHandle::null();
        assert!(handle.is_null());
        assert!(handle.downgrade().is_invalid());
        // Dropping a null handle must not touch any storage
        drop(handle);
    }
}
