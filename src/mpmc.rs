//! Bounded multi-producer multi-consumer queue.
//!
//! Sequence-stamped ring (Vyukov): each slot's sequence tells both
//! sides whether it is free to produce into or holds a consumable
//! element. Capacity rounds up to a power of two so index arithmetic
//! is a single mask. Push and pop are both lock-free.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::util::next_power_of_two;

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC queue with power-of-two capacity.
pub struct MpmcQueue<T> {
    slots: Box<[CachePadded<Slot<T>>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Create a queue holding at least `capacity` elements (rounded up
    /// to the next power of two).
    pub fn new(capacity: usize) -> Self {
        let capacity = next_power_of_two(capacity);
        let slots = (0..capacity)
            .map(|i| {
                CachePadded::new(Slot {
                    sequence: AtomicUsize::new(i),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
            })
            .collect();

        Self {
            slots,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Push an element. Returns it back when the queue is full; the
    /// caller decides whether to retry.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let diff = sequence as isize - pos as isize;

            if diff == 0 {
                // Slot is producible; claim the position
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        // Stamp: consumable at this position
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Sequence lags a full lap: queue is full
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let diff = sequence as isize - (pos + 1) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        // Stamp: producible again one lap later
                        slot.sequence
                            .store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Nothing consumable at this position
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate length (exact only when quiescent)
    pub fn len(&self) -> usize {
        let enqueue = self.enqueue_pos.load(Ordering::Relaxed);
        let dequeue = self.dequeue_pos.load(Ordering::Relaxed);
        enqueue.saturating_sub(dequeue)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        assert_eq!(MpmcQueue::<i32>::new(3).capacity(), 4);
        assert_eq!(MpmcQueue::<i32>::new(5).capacity(), 8);
        assert_eq!(MpmcQueue::<i32>::new(7).capacity(), 8);
        assert_eq!(MpmcQueue::<i32>::new(8).capacity(), 8);
        assert_eq!(MpmcQueue::<i32>::new(1).capacity(), 1);
    }

    #[test]
    fn test_push_pop_fifo() {
        let queue = MpmcQueue::new(8);
        queue.push(10).unwrap();
        queue.push(20).unwrap();
        queue.push(30).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(10));
        assert_eq!(queue.pop(), Some(20));
        assert_eq!(queue.pop(), Some(30));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_to_full_returns_value() {
        let queue = MpmcQueue::new(4);
        for i in 0..4 {
            assert!(queue.push(i).is_ok());
        }
        assert_eq!(queue.push(99), Err(99));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_wraparound_cycles() {
        let queue = MpmcQueue::new(4);
        for cycle in 0..10 {
            for i in 0..4 {
                queue.push(cycle * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(queue.pop(), Some(cycle * 4 + i));
            }
        }
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PER_PRODUCER: usize = 10_000;
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;

        let queue = Arc::new(MpmcQueue::new(256));
        let consumed = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = p * PER_PRODUCER + i;
                    loop {
                        match queue.push(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        for _ in 0..CONSUMERS {
            let queue = queue.clone();
            let consumed = consumed.clone();
            let sum = sum.clone();
            handles.push(std::thread::spawn(move || loop {
                if consumed.load(Ordering::Relaxed) >= PRODUCERS * PER_PRODUCER {
                    break;
                }
                if let Some(value) = queue.pop() {
                    sum.fetch_add(value, Ordering::Relaxed);
                    consumed.fetch_add(1, Ordering::Relaxed);
                } else {
                    std::thread::yield_now();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let n = PRODUCERS * PER_PRODUCER;
        assert_eq!(consumed.load(Ordering::Relaxed), n);
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
    }

    #[test]
    fn test_drop_releases_remaining_elements() {
        use std::sync::atomic::Ordering;
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let queue = MpmcQueue::new(8);
            queue.push(Tracked).ok();
            queue.push(Tracked).ok();
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }
}
