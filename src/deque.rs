//! Chase-Lev work-stealing deque.
//!
//! The owner pushes and pops at the bottom (LIFO); thieves steal from
//! the top (FIFO). The race on the last remaining element is resolved
//! by a CAS on `top`: exactly one of pop/steal wins. Grown-out buffers
//! go on a retirement list so in-flight stealers can keep reading them;
//! the list is reclaimed when the deque drops.

use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::alloc::AllocatorRef;
use crate::util::next_power_of_two;

/// Power-of-two ring indexed by monotonically growing positions
struct CircularBuffer<T> {
    capacity: usize,
    mask: usize,
    items: *mut MaybeUninit<T>,
}

impl<T> CircularBuffer<T> {
    fn allocate(allocator: &AllocatorRef, capacity: usize) -> *mut CircularBuffer<T> {
        debug_assert!(capacity.is_power_of_two());

        let items_size = capacity * std::mem::size_of::<MaybeUninit<T>>();
        let items_align = std::mem::align_of::<T>().max(1);
        let items = allocator.allocate(items_size, items_align) as *mut MaybeUninit<T>;
        assert!(!items.is_null(), "deque buffer allocation failed");

        let this = allocator.allocate(
            std::mem::size_of::<CircularBuffer<T>>(),
            std::mem::align_of::<CircularBuffer<T>>(),
        ) as *mut CircularBuffer<T>;
        assert!(!this.is_null(), "deque buffer header allocation failed");

        unsafe {
            this.write(CircularBuffer {
                capacity,
                mask: capacity - 1,
                items,
            });
        }
        this
    }

    /// # Safety
    /// `this` must come from `allocate` with the same allocator; no
    /// items are dropped here.
    unsafe fn deallocate(this: *mut CircularBuffer<T>, allocator: &AllocatorRef) {
        let buffer = &*this;
        allocator.deallocate(
            buffer.items as *mut u8,
            buffer.capacity * std::mem::size_of::<MaybeUninit<T>>(),
            std::mem::align_of::<T>().max(1),
        );
        allocator.deallocate(
            this as *mut u8,
            std::mem::size_of::<CircularBuffer<T>>(),
            std::mem::align_of::<CircularBuffer<T>>(),
        );
    }

    /// Bitwise read of the slot at `index`. Ownership bookkeeping is
    /// the caller's: a losing racer must `forget` the copy.
    ///
    /// # Safety
    /// The slot must hold an initialized value.
    unsafe fn read(&self, index: isize) -> T {
        (*self.items.add(index as usize & self.mask)).assume_init_read()
    }

    /// # Safety
    /// Only the owner writes, and only to slots outside the live
    /// top..bottom window observed by stealers.
    unsafe fn write(&self, index: isize, value: T) {
        (*self.items.add(index as usize & self.mask)).write(value);
    }
}

struct DequeInner<T> {
    bottom: CachePadded<AtomicIsize>,
    top: CachePadded<AtomicIsize>,
    buffer: AtomicPtr<CircularBuffer<T>>,
    /// Retired buffers; reclaimed only at drop so stealers may still
    /// read them
    retired: Mutex<Vec<*mut CircularBuffer<T>>>,
    allocator: AllocatorRef,
}

unsafe impl<T: Send> Send for DequeInner<T> {}
unsafe impl<T: Send> Sync for DequeInner<T> {}

impl<T> Drop for DequeInner<T> {
    fn drop(&mut self) {
        // Sole owner at this point; drain remaining items, then free
        // the live buffer and the retirement list.
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        let buffer = self.buffer.load(Ordering::Relaxed);

        unsafe {
            for index in top..bottom {
                drop((*buffer).read(index));
            }
            CircularBuffer::deallocate(buffer, &self.allocator);
            for &retired in self.retired.lock().iter() {
                CircularBuffer::deallocate(retired, &self.allocator);
            }
        }
    }
}

/// Owner handle: single-producer push/pop
pub struct WorkStealingDeque<T: Send> {
    inner: Arc<DequeInner<T>>,
}

/// Thief handle: multi-consumer steal
pub struct Stealer<T: Send> {
    inner: Arc<DequeInner<T>>,
}

impl<T: Send> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> WorkStealingDeque<T> {
    /// Create a deque with at least `capacity` slots (rounded up to a
    /// power of two). The allocator must be thread-safe: the grow path
    /// can run while stealers are active on other threads.
    pub fn new(allocator: AllocatorRef, capacity: usize) -> Self {
        let capacity = next_power_of_two(capacity);
        let buffer = CircularBuffer::allocate(&allocator, capacity);
        Self {
            inner: Arc::new(DequeInner {
                bottom: CachePadded::new(AtomicIsize::new(0)),
                top: CachePadded::new(AtomicIsize::new(0)),
                buffer: AtomicPtr::new(buffer),
                retired: Mutex::new(Vec::new()),
                allocator,
            }),
        }
    }

    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Owner-only: push at the bottom, growing on overflow.
    pub fn push(&self, value: T) {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed);
        let top = inner.top.load(Ordering::Acquire);
        let mut buffer = inner.buffer.load(Ordering::Relaxed);

        let capacity = unsafe { (*buffer).capacity };
        if bottom - top >= capacity as isize {
            buffer = self.grow(bottom, top);
        }

        unsafe {
            (*buffer).write(bottom, value);
        }
        inner.bottom.store(bottom + 1, Ordering::Release);
    }

    /// Owner-only: pop at the bottom (LIFO). Races `steal` for the
    /// last element; exactly one side wins.
    pub fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let bottom = inner.bottom.load(Ordering::Relaxed) - 1;
        let buffer = inner.buffer.load(Ordering::Relaxed);
        inner.bottom.store(bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = inner.top.load(Ordering::Relaxed);

        if top <= bottom {
            let value = unsafe { (*buffer).read(bottom) };
            if top == bottom {
                // Last element: decide against a concurrent stealer
                if inner
                    .top
                    .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    // Stealer won; the copy we read belongs to it
                    std::mem::forget(value);
                    inner.bottom.store(bottom + 1, Ordering::Relaxed);
                    return None;
                }
                inner.bottom.store(bottom + 1, Ordering::Relaxed);
            }
            Some(value)
        } else {
            inner.bottom.store(bottom + 1, Ordering::Relaxed);
            None
        }
    }

    fn grow(&self, bottom: isize, top: isize) -> *mut CircularBuffer<T> {
        let inner = &*self.inner;
        let old = inner.buffer.load(Ordering::Relaxed);
        let old_capacity = unsafe { (*old).capacity };
        let new = CircularBuffer::allocate(&inner.allocator, old_capacity * 2);

        unsafe {
            for index in top..bottom {
                // Bitwise transfer; the old buffer keeps dead bytes that
                // in-flight stealers may still read until top moves past
                (*new).write(index, (*old).read(index));
            }
        }

        inner.retired.lock().push(old);
        inner.buffer.store(new, Ordering::Release);
        new
    }

    pub fn len(&self) -> usize {
        let bottom = self.inner.bottom.load(Ordering::Relaxed);
        let top = self.inner.top.load(Ordering::Relaxed);
        (bottom - top).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> Stealer<T> {
    /// Steal from the top (FIFO). Returns `None` when empty or when a
    /// concurrent pop/steal won the race; callers just move on to the
    /// next victim.
    pub fn steal(&self) -> Option<T> {
        let inner = &*self.inner;
        let top = inner.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = inner.bottom.load(Ordering::Acquire);

        if top < bottom {
            let buffer = inner.buffer.load(Ordering::Acquire);
            let value = unsafe { (*buffer).read(top) };
            if inner
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                std::mem::forget(value);
                return None;
            }
            Some(value)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        let bottom = self.inner.bottom.load(Ordering::Relaxed);
        let top = self.inner.top.load(Ordering::Relaxed);
        (bottom - top).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{Allocator, SystemAllocator};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_push_pop_lifo() {
        let deque = WorkStealingDeque::new(SystemAllocator::shared(), 16);
        deque.push(1);
        deque.push(2);
        deque.push(3);

        assert_eq!(deque.len(), 3);
        assert_eq!(deque.pop(), Some(3));
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(deque.pop(), Some(1));
        assert_eq!(deque.pop(), None);
        assert!(deque.is_empty());
    }

    #[test]
    fn test_steal_fifo() {
        let deque = WorkStealingDeque::new(SystemAllocator::shared(), 16);
        let stealer = deque.stealer();
        deque.push(1);
        deque.push(2);
        deque.push(3);

        assert_eq!(stealer.steal(), Some(1));
        assert_eq!(stealer.steal(), Some(2));
        // Owner takes the rest from the bottom
        assert_eq!(deque.pop(), Some(3));
        assert_eq!(stealer.steal(), None);
    }

    #[test]
    fn test_grow_preserves_contents() {
        let deque = WorkStealingDeque::new(SystemAllocator::shared(), 4);
        for i in 0..64 {
            deque.push(i);
        }
        assert_eq!(deque.len(), 64);
        for i in (0..64).rev() {
            assert_eq!(deque.pop(), Some(i));
        }
    }

    #[test]
    fn test_last_element_race_exactly_one_winner() {
        // Start with [42]; pop and steal race; exactly one side gets
        // the element.
        for _ in 0..200 {
            let deque = WorkStealingDeque::new(SystemAllocator::shared(), 8);
            let stealer = deque.stealer();
            deque.push(42);

            let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
            let b2 = barrier.clone();

            let thief = std::thread::spawn(move || {
                b2.wait();
                stealer.steal()
            });

            barrier.wait();
            let popped = deque.pop();
            let stolen = thief.join().unwrap();

            match (popped, stolen) {
                (Some(42), None) | (None, Some(42)) => {}
                other => panic!("both or neither won the race: {other:?}"),
            }
        }
    }

    #[test]
    fn test_concurrent_steals_each_item_once() {
        const ITEMS: usize = 10_000;
        const THIEVES: usize = 4;

        let deque = WorkStealingDeque::new(SystemAllocator::shared(), 64);
        let taken = std::sync::Arc::new(AtomicUsize::new(0));

        for i in 0..ITEMS {
            deque.push(i);
        }

        let mut handles = Vec::new();
        for _ in 0..THIEVES {
            let stealer = deque.stealer();
            let taken = taken.clone();
            handles.push(std::thread::spawn(move || {
                let mut local = 0usize;
                loop {
                    match stealer.steal() {
                        Some(_) => local += 1,
                        None => {
                            if stealer.is_empty() {
                                break;
                            }
                        }
                    }
                }
                taken.fetch_add(local, Ordering::Relaxed);
            }));
        }

        let mut popped = 0usize;
        while let Some(_) = deque.pop() {
            popped += 1;
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(taken.load(Ordering::Relaxed) + popped, ITEMS);
    }

    #[test]
    fn test_remaining_items_dropped_with_deque() {
        use std::sync::atomic::Ordering;
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let deque = WorkStealingDeque::new(SystemAllocator::shared(), 8);
            deque.push(Tracked);
            deque.push(Tracked);
            let _ = deque.pop();
        }
        // One dropped by pop, the remaining one by the deque itself
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_allocator_memory_returned_on_drop() {
        let allocator = std::sync::Arc::new(SystemAllocator::new());
        let as_ref: AllocatorRef = allocator.clone();
        {
            let deque = WorkStealingDeque::new(as_ref, 4);
            for i in 0..128 {
                deque.push(i); // forces several grows onto the retirement list
            }
            assert!(allocator.used_memory() > 0);
        }
        assert_eq!(allocator.used_memory(), 0);
    }
}
