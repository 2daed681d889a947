//! Allocator interface consumed by the runtime.
//!
//! Allocation policy (buddy, linear, stack, pool) lives outside this
//! crate; the runtime only depends on the trait below. `SystemAllocator`
//! is the std-backed default used when no custom allocator is supplied.

use std::alloc::Layout;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Interface the runtime allocates through.
///
/// Implementations are addressed through `&self`; thread safety is the
/// implementation's problem (wrap single-threaded allocators in
/// [`ThreadSafeAllocator`] before sharing them across workers).
pub trait Allocator: Send + Sync {
    /// Allocate `size` bytes with `align` alignment. Null on failure.
    fn allocate(&self, size: usize, align: usize) -> *mut u8;

    /// Return memory obtained from `allocate`.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `size`/`align`, and must not be freed twice.
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, align: usize);

    /// Release everything at once (linear/stack allocators). No-op by default.
    fn reset(&self) {}

    fn used_memory(&self) -> usize;

    fn total_memory(&self) -> usize;

    fn name(&self) -> &str;
}

/// Shared allocator handle threaded through the runtime.
pub type AllocatorRef = Arc<dyn Allocator>;

/// Snapshot of one allocator's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub used: usize,
    pub total: usize,
    pub peak: usize,
}

/// Default allocator backed by the global heap.
pub struct SystemAllocator {
    used: AtomicUsize,
    // Peak is monotone; summing peaks across allocators over-estimates
    // the true global peak (peaks need not coincide in time).
    peak: AtomicUsize,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self {
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            used: self.used.load(Ordering::Relaxed),
            total: usize::MAX,
            peak: self.peak.load(Ordering::Relaxed),
        }
    }

    /// Shared handle, ready to hand to the runtime.
    pub fn shared() -> AllocatorRef {
        Arc::new(Self::new())
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        if size == 0 {
            return align as *mut u8;
        }
        let layout = match Layout::from_size_align(size, align) {
            Ok(layout) => layout,
            Err(_) => return std::ptr::null_mut(),
        };
        let ptr = unsafe { std::alloc::alloc(layout) };
        if !ptr.is_null() {
            let used = self.used.fetch_add(size, Ordering::Relaxed) + size;
            self.peak.fetch_max(used, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, align: usize) {
        if size == 0 || ptr.is_null() {
            return;
        }
        let layout = Layout::from_size_align_unchecked(size, align);
        std::alloc::dealloc(ptr, layout);
        self.used.fetch_sub(size, Ordering::Relaxed);
    }

    fn used_memory(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn total_memory(&self) -> usize {
        usize::MAX
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// Mutex adapter turning a single-threaded allocator into a shared one.
///
/// The work-stealing deque's grow path can run on any worker, so every
/// allocator it uses must go through this wrapper (or be inherently
/// thread-safe like [`SystemAllocator`]).
pub struct ThreadSafeAllocator<A: Allocator> {
    inner: A,
    lock: Mutex<()>,
}

impl<A: Allocator> ThreadSafeAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }

    pub fn into_inner(self) -> A {
        self.inner
    }
}

impl<A: Allocator> Allocator for ThreadSafeAllocator<A> {
    fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        let _guard = self.lock.lock();
        self.inner.allocate(size, align)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, align: usize) {
        let _guard = self.lock.lock();
        self.inner.deallocate(ptr, size, align)
    }

    fn reset(&self) {
        let _guard = self.lock.lock();
        self.inner.reset()
    }

    fn used_memory(&self) -> usize {
        let _guard = self.lock.lock();
        self.inner.used_memory()
    }

    fn total_memory(&self) -> usize {
        self.inner.total_memory()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
