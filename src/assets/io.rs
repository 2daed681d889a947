//! Async file IO scheduler for the asset pump.
//!
//! Submission side is a priority heap behind a mutex + condvar; worker
//! threads pop the highest-priority request, read the file and post a
//! completion. Cancellation is best-effort: requests cancelled before
//! dispatch are skipped, completions of requests cancelled after
//! dispatch are dropped at drain time. A read already in progress is
//! never interrupted.

use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ahash::AHashSet;
use parking_lot::{Condvar, Mutex};

pub type RequestId = u64;

/// Request priority, highest served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug)]
struct IoRequest {
    id: RequestId,
    path: PathBuf,
    priority: LoadPriority,
}

impl PartialEq for IoRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for IoRequest {}

impl PartialOrd for IoRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IoRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins; same priority serves the
        // earlier submission first
        self.priority
            .cmp(&other.priority)
            .then(other.id.cmp(&self.id))
    }
}

/// Finished read, drained by the asset server each update
#[derive(Debug)]
pub struct IoCompletion {
    pub id: RequestId,
    pub result: std::io::Result<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
pub struct IoSchedulerConfig {
    pub worker_count: usize,
}

impl Default for IoSchedulerConfig {
    fn default() -> Self {
        Self { worker_count: 1 }
    }
}

struct IoShared {
    queue: Mutex<BinaryHeap<IoRequest>>,
    queue_cvar: Condvar,
    cancelled: Mutex<AHashSet<RequestId>>,
    completions: Mutex<Vec<IoCompletion>>,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

/// Priority-driven file reader with N worker threads.
pub struct IoScheduler {
    shared: Arc<IoShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoScheduler {
    pub fn new(config: IoSchedulerConfig) -> Self {
        let shared = Arc::new(IoShared {
            queue: Mutex::new(BinaryHeap::new()),
            queue_cvar: Condvar::new(),
            cancelled: Mutex::new(AHashSet::new()),
            completions: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });

        let worker_count = config.worker_count.max(1);
        let workers = (0..worker_count)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("lattice-io-{i}"))
                    .spawn(move || io_worker(shared))
                    .expect("failed to spawn io worker")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a read; returns the id used to match its completion.
    pub fn submit(&self, path: impl Into<PathBuf>, priority: LoadPriority) -> RequestId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.queue.lock().push(IoRequest {
            id,
            path: path.into(),
            priority,
        });
        self.shared.queue_cvar.notify_one();
        id
    }

    /// Best-effort cancel. Pre-dispatch requests are skipped; a
    /// completion already produced is discarded at the next drain.
    pub fn cancel(&self, id: RequestId) {
        self.shared.cancelled.lock().insert(id);
    }

    /// Move finished reads into `out`, dropping cancelled ones.
    pub fn drain_completions(&self, out: &mut Vec<IoCompletion>) {
        let mut completions = self.shared.completions.lock();
        if completions.is_empty() {
            return;
        }
        let mut cancelled = self.shared.cancelled.lock();
        for completion in completions.drain(..) {
            if cancelled.remove(&completion.id) {
                continue;
            }
            out.push(completion);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stop and join all workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue_cvar.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn io_worker(shared: Arc<IoShared>) {
    loop {
        let request = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(request) = queue.pop() {
                    break Some(request);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                shared.queue_cvar.wait(&mut queue);
            }
        };

        let Some(request) = request else {
            return;
        };

        // Cancelled before dispatch: skip without reading
        if shared.cancelled.lock().remove(&request.id) {
            continue;
        }

        let result = std::fs::read(&request.path);
        shared.completions.lock().push(IoCompletion {
            id: request.id,
            result,
        });
    }
}
