//! Work-stealing thread pool.
//!
//! Each worker owns a Chase-Lev deque; external submissions go through
//! a global MPMC queue. A worker looks for work in order: own deque,
//! global queue, then a steal from a uniformly random victim. A
//! per-thread worker index is published while the loop runs so library
//! code (per-worker command buffers) can find its local structures.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};

use crate::alloc::AllocatorRef;
use crate::deque::{Stealer, WorkStealingDeque};
use crate::mpmc::MpmcQueue;

/// Back-off behaviour when a worker finds no work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleStrategy {
    /// Busy-wait (lowest latency, highest CPU usage)
    Spin,
    /// Yield to the OS scheduler (moderate latency/CPU)
    #[default]
    Yield,
    /// Condition-variable wait (lowest CPU, higher latency)
    Park,
}

/// Worker thread state, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Stealing = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Running,
            2 => WorkerState::Stealing,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolConfig {
    /// 0 selects the hardware concurrency
    pub worker_count: usize,
    pub idle_strategy: IdleStrategy,
    pub deque_capacity: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            idle_strategy: IdleStrategy::Yield,
            deque_capacity: 1024,
        }
    }
}

struct Task(Box<dyn FnOnce() + Send>);

#[derive(Clone, Copy)]
struct WorkerTls {
    pool_id: u64,
    index: usize,
    deque: *const WorkStealingDeque<Task>,
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerTls>> = const { Cell::new(None) };
}

/// Index of the calling thread inside its thread pool, if any.
///
/// Set for the duration of the worker loop; `Commands` uses it to pick
/// the per-worker buffer.
pub fn current_worker_index() -> Option<usize> {
    CURRENT_WORKER.with(|c| c.get().map(|w| w.index))
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolShared {
    pool_id: u64,
    global: MpmcQueue<Task>,
    stealers: Vec<Stealer<Task>>,
    should_stop: Vec<CachePadded<AtomicBool>>,
    states: Vec<AtomicU8>,
    /// Incremented before a push, decremented after execution
    pending: AtomicI64,
    idle_strategy: IdleStrategy,
    park_lock: Mutex<()>,
    park_cvar: Condvar,
    done_lock: Mutex<()>,
    done_cvar: Condvar,
}

impl PoolShared {
    fn finish_task(&self) {
        if self.pending.fetch_sub(1, Ordering::Release) == 1 {
            let _guard = self.done_lock.lock();
            self.done_cvar.notify_all();
        }
    }

    fn wake_one(&self) {
        if self.idle_strategy == IdleStrategy::Park {
            self.park_cvar.notify_one();
        }
    }

    fn apply_idle_strategy(&self) {
        match self.idle_strategy {
            IdleStrategy::Spin => std::hint::spin_loop(),
            IdleStrategy::Yield => std::thread::yield_now(),
            IdleStrategy::Park => {
                let mut guard = self.park_lock.lock();
                self.park_cvar
                    .wait_for(&mut guard, Duration::from_millis(1));
            }
        }
    }
}

/// Pool of worker threads with per-worker work-stealing deques.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
    running: bool,
}

impl ThreadPool {
    /// Spawn `config.worker_count` workers (hardware concurrency when
    /// 0). The allocator backs the per-worker deques; it must be
    /// thread-safe since deque growth can happen on any worker.
    pub fn new(allocator: AllocatorRef, config: ThreadPoolConfig) -> Self {
        let worker_count = if config.worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            config.worker_count
        };

        let mut deques = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let deque = WorkStealingDeque::new(allocator.clone(), config.deque_capacity);
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let shared = Arc::new(PoolShared {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            global: MpmcQueue::new(config.deque_capacity * 4),
            stealers,
            should_stop: (0..worker_count)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
            states: (0..worker_count)
                .map(|_| AtomicU8::new(WorkerState::Idle as u8))
                .collect(),
            pending: AtomicI64::new(0),
            idle_strategy: config.idle_strategy,
            park_lock: Mutex::new(()),
            park_cvar: Condvar::new(),
            done_lock: Mutex::new(()),
            done_cvar: Condvar::new(),
        });

        let workers = deques
            .into_iter()
            .enumerate()
            .map(|(index, deque)| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("lattice-worker-{index}"))
                    .spawn(move || worker_main(shared, deque, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            workers,
            worker_count,
            running: true,
        }
    }

    pub fn with_default_config(allocator: AllocatorRef) -> Self {
        Self::new(allocator, ThreadPoolConfig::default())
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn idle_strategy(&self) -> IdleStrategy {
        self.shared.idle_strategy
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn worker_state(&self, index: usize) -> WorkerState {
        match self.shared.states.get(index) {
            Some(state) => WorkerState::from_u8(state.load(Ordering::Acquire)),
            None => WorkerState::Stopped,
        }
    }

    /// Submit a task.
    ///
    /// Calls from a worker of this pool push to that worker's own
    /// deque; external threads go through the global queue (retrying
    /// with back-off while it is full).
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Pending goes up before the push so wait_all cannot observe a
        // published task without its count
        self.shared.pending.fetch_add(1, Ordering::Release);
        let mut task = Task(Box::new(f));

        if let Some(tls) = CURRENT_WORKER.with(|c| c.get()) {
            if tls.pool_id == self.shared.pool_id {
                // Single-producer push is sound: this thread IS the owner
                unsafe { (*tls.deque).push(task) };
                self.shared.wake_one();
                return;
            }
        }

        let backoff = Backoff::new();
        loop {
            match self.shared.global.push(task) {
                Ok(()) => break,
                Err(returned) => {
                    task = returned;
                    backoff.snooze();
                }
            }
        }
        self.shared.wake_one();
    }

    /// Submit with a target-worker hint.
    ///
    /// The hint is currently ignored: external threads cannot push to a
    /// Chase-Lev owner end, so everything routes through the global
    /// queue.
    pub fn submit_to<F>(&self, _worker: usize, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(f);
    }

    /// Block until the outstanding-task counter reaches zero.
    pub fn wait_all(&self) {
        loop {
            if self.shared.pending.load(Ordering::Acquire) <= 0 {
                return;
            }
            match self.shared.idle_strategy {
                IdleStrategy::Spin => std::hint::spin_loop(),
                IdleStrategy::Yield => std::thread::yield_now(),
                IdleStrategy::Park => {
                    let mut guard = self.shared.done_lock.lock();
                    if self.shared.pending.load(Ordering::Acquire) <= 0 {
                        return;
                    }
                    self.shared
                        .done_cvar
                        .wait_for(&mut guard, Duration::from_millis(1));
                }
            }
        }
    }

    pub fn pending_tasks(&self) -> i64 {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn has_pending_tasks(&self) -> bool {
        self.pending_tasks() > 0
    }

    /// Stop all workers and join them. Idempotent. Tasks already
    /// published run to completion: each worker drains its own deque
    /// and the global queue before exiting.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        for flag in &self.shared.should_stop {
            flag.store(true, Ordering::Release);
        }
        self.shared.park_cvar.notify_all();

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(shared: Arc<PoolShared>, deque: WorkStealingDeque<Task>, index: usize) {
    CURRENT_WORKER.with(|c| {
        c.set(Some(WorkerTls {
            pool_id: shared.pool_id,
            index,
            deque: &deque,
        }))
    });

    let mut rng = index as u32 + 1;
    let mut idle_spins = 0u32;
    const SPIN_ATTEMPTS: u32 = 64;

    while !shared.should_stop[index].load(Ordering::Acquire) {
        // 1. Own deque, 2. global queue, 3. steal from a random victim
        let mut task = deque.pop().or_else(|| shared.global.pop());
        if task.is_none() {
            shared.states[index].store(WorkerState::Stealing as u8, Ordering::Relaxed);
            task = try_steal(&shared, index, &mut rng);
        }

        match task {
            Some(task) => {
                idle_spins = 0;
                shared.states[index].store(WorkerState::Running as u8, Ordering::Relaxed);
                execute(task);
                shared.finish_task();
            }
            None => {
                shared.states[index].store(WorkerState::Idle as u8, Ordering::Relaxed);
                idle_spins += 1;
                if idle_spins >= SPIN_ATTEMPTS {
                    shared.apply_idle_strategy();
                    idle_spins = 0;
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }

    // Drain any remaining work so the pending counter reaches zero
    while let Some(task) = deque.pop() {
        execute(task);
        shared.finish_task();
    }
    while let Some(task) = shared.global.pop() {
        execute(task);
        shared.finish_task();
    }

    CURRENT_WORKER.with(|c| c.set(None));
    shared.states[index].store(WorkerState::Stopped as u8, Ordering::Release);
}

fn execute(task: Task) {
    // A panicking task must not take the worker (and the pending
    // counter) down with it
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || (task.0)()));
    if result.is_err() {
        eprintln!("thread pool task panicked; worker continues");
    }
}

fn try_steal(shared: &PoolShared, self_index: usize, rng: &mut u32) -> Option<Task> {
    let count = shared.stealers.len();
    if count <= 1 {
        return None;
    }

    // Random starting point to reduce contention
    let start = xorshift32(rng) as usize % count;
    for i in 0..count {
        let victim = (start + i) % count;
        if victim == self_index {
            continue;
        }
        if let Some(task) = shared.stealers[victim].steal() {
            return Some(task);
        }
    }
    None
}

fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SystemAllocator;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_executes_submitted_tasks() {
        let mut pool = ThreadPool::new(
            SystemAllocator::shared(),
            ThreadPoolConfig {
                worker_count: 4,
                ..Default::default()
            },
        );

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
        assert!(!pool.has_pending_tasks());
        pool.stop();
    }

    #[test]
    fn test_worker_index_visible_inside_tasks() {
        let mut pool = ThreadPool::new(
            SystemAllocator::shared(),
            ThreadPoolConfig {
                worker_count: 2,
                ..Default::default()
            },
        );

        let ok = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let ok = ok.clone();
            pool.submit(move || {
                if matches!(current_worker_index(), Some(0 | 1)) {
                    ok.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        pool.wait_all();
        assert_eq!(ok.load(Ordering::Relaxed), 64);

        // Not set outside worker threads
        assert_eq!(current_worker_index(), None);
        pool.stop();
    }

    #[test]
    fn test_nested_submit_from_worker() {
        let mut pool = ThreadPool::new(
            SystemAllocator::shared(),
            ThreadPoolConfig {
                worker_count: 2,
                ..Default::default()
            },
        );
        // Pool outlives every task (wait_all before stop), so handing
        // tasks a raw pointer to it is fine here
        let pool_ptr = &pool as *const ThreadPool as usize;

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.submit(move || {
                let pool = unsafe { &*(pool_ptr as *const ThreadPool) };
                for _ in 0..4 {
                    let counter = counter.clone();
                    // Worker path: pushes to its own deque
                    pool.submit(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }

        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 64);
        pool.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_drains() {
        let mut pool = ThreadPool::new(
            SystemAllocator::shared(),
            ThreadPoolConfig {
                worker_count: 2,
                idle_strategy: IdleStrategy::Park,
                ..Default::default()
            },
        );

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.stop();
        pool.stop();

        // Published tasks ran to completion during shutdown
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        assert_eq!(pool.pending_tasks(), 0);
        assert_eq!(pool.worker_state(0), WorkerState::Stopped);
    }

    #[test]
    fn test_submit_to_routes_through_global() {
        let mut pool = ThreadPool::new(
            SystemAllocator::shared(),
            ThreadPoolConfig {
                worker_count: 2,
                ..Default::default()
            },
        );

        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..32 {
            let counter = counter.clone();
            pool.submit_to(i % 2, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 32);
        pool.stop();
    }

    #[test]
    fn test_panicking_task_does_not_wedge_pool() {
        let mut pool = ThreadPool::new(
            SystemAllocator::shared(),
            ThreadPoolConfig {
                worker_count: 2,
                ..Default::default()
            },
        );

        pool.submit(|| panic!("boom"));
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        pool.stop();
    }
}
