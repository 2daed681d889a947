//! Parallel scheduler: runs systems concurrently under the
//! access-descriptor conflict rules.
//!
//! A node per enabled system carries a dependency counter; an edge A→B
//! exists for every conflicting pair where B was registered after A.
//! Because edges always point forward in registration order the graph
//! cannot cycle. Completion of a node decrements its successors;
//! whoever reaches zero gets submitted to the thread pool.
//!
//! Dispatch never materializes a mutable reference to the scheduler or
//! the world on a worker thread: tasks see a shared context of raw
//! pointers, node state is atomic, each task turns only its own
//! per-slot `*mut System` into a reference, and world access flows
//! through the interior-mutable [`WorldCell`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::alloc::AllocatorRef;
use crate::command::Commands;
use crate::error::{EcsError, Result};
use crate::system::{System, SystemId, Systems};
use crate::thread_pool::{ThreadPool, ThreadPoolConfig};
use crate::world::{World, WorldCell};

const STATE_PENDING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_COMPLETE: u8 = 3;

struct Node {
    id: SystemId,
    dependency_count: u32,
    unfinished_deps: AtomicU32,
    state: AtomicU8,
    successors: Vec<usize>,
}

/// Per-update view shared by every dispatched task.
///
/// Lives on `update`'s stack until `wait_all` returns, which outlives
/// every task of the dispatch. All fields are only ever read; node
/// state mutates through atomics, systems through their own slot
/// pointer, the world through `WorldCell`.
struct DispatchContext {
    nodes: *const Node,
    node_count: usize,
    /// One `*mut System` per node, resolved at dispatch time
    systems: *const *mut System,
    commands: *const Commands,
    pool: *const ThreadPool,
    world: *mut World,
}

/// Parallel system scheduler.
///
/// Owns the system storage, a thread pool and the per-worker command
/// buffers. One `update` dispatches every enabled system, waits for
/// completion, flushes commands, swaps event buffers and advances the
/// world tick.
pub struct Scheduler {
    systems: Systems,
    pool: ThreadPool,
    commands: Commands,
    nodes: Vec<Node>,
    needs_rebuild: bool,
}

impl Scheduler {
    pub fn new(allocator: AllocatorRef, config: ThreadPoolConfig) -> Self {
        let pool = ThreadPool::new(allocator.clone(), config);
        let commands = Commands::new(allocator, pool.worker_count());
        Self {
            systems: Systems::new(),
            pool,
            commands,
            nodes: Vec::new(),
            needs_rebuild: false,
        }
    }

    pub fn with_default_pool(allocator: AllocatorRef) -> Self {
        Self::new(allocator, ThreadPoolConfig::default())
    }

    // ========== System set management ==========

    pub fn register(&mut self, system: System) -> SystemId {
        self.needs_rebuild = true;
        self.systems.register(system)
    }

    pub fn remove(&mut self, id: SystemId) -> bool {
        self.needs_rebuild = true;
        self.systems.remove(id)
    }

    /// Enable or disable a system; disabled systems are left out of
    /// the next (re)build entirely.
    pub fn set_enabled(&mut self, id: SystemId, enabled: bool) -> bool {
        self.needs_rebuild = true;
        self.systems.set_enabled(id, enabled)
    }

    pub fn systems(&self) -> &Systems {
        &self.systems
    }

    pub fn commands(&self) -> &Commands {
        &self.commands
    }

    pub fn thread_pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Dependency-graph node count (enabled systems at last build)
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ========== Execution ==========

    /// Run one world update:
    /// 1. rebuild the graph if the system set changed,
    /// 2. dispatch all roots and let completions cascade,
    /// 3. wait for the pool to drain,
    /// 4. flush command buffers in worker order,
    /// 5. swap event buffers,
    /// 6. advance the world tick.
    pub fn update(&mut self, world: &mut World) -> Result<()> {
        if self.needs_rebuild {
            self.rebuild()?;
        }

        #[cfg(feature = "profiling")]
        let span = info_span!("scheduler.update", systems = self.nodes.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let tick = world.tick();

        if !self.nodes.is_empty() {
            for node in &self.nodes {
                node.unfinished_deps
                    .store(node.dependency_count, Ordering::Relaxed);
                let state = if node.dependency_count == 0 {
                    STATE_READY
                } else {
                    STATE_PENDING
                };
                node.state.store(state, Ordering::Relaxed);
            }

            // Resolve each node's system to a raw slot pointer up
            // front; tasks never see the scheduler or its storage.
            let ids: Vec<SystemId> = self.nodes.iter().map(|n| n.id).collect();
            let run_ptrs = self.systems.system_ptrs(&ids);

            // SAFETY ARGUMENT: the context and pointer table outlive
            // every task (wait_all is the barrier), tasks only read the
            // context, node state is atomic behind shared references,
            // each task dereferences exactly its own system pointer,
            // and world access goes through WorldCell whose interior
            // mutability is guarded by the conflict graph. No `&mut`
            // to the scheduler, the node array, the system storage or
            // the world is ever formed on a worker thread.
            let ctx = DispatchContext {
                nodes: self.nodes.as_ptr(),
                node_count: self.nodes.len(),
                systems: run_ptrs.as_ptr(),
                commands: &self.commands,
                pool: &self.pool,
                world: world as *mut World,
            };
            let ctx_addr = &ctx as *const DispatchContext as usize;

            for index in 0..self.nodes.len() {
                if self.nodes[index].dependency_count == 0 {
                    Self::submit_node(ctx_addr, index);
                }
            }

            self.pool.wait_all();
        }

        self.commands.flush_all(world);
        world.events_mut().swap_all();

        for index in 0..self.nodes.len() {
            let id = self.nodes[index].id;
            if let Some(system) = self.systems.get_mut(id) {
                system.last_run_tick = tick;
            }
        }

        world.increment_tick();
        Ok(())
    }

    fn submit_node(ctx_addr: usize, index: usize) {
        // SAFETY: the context outlives every task of this dispatch;
        // only shared reads happen through it.
        let ctx = unsafe { &*(ctx_addr as *const DispatchContext) };
        let pool = unsafe { &*ctx.pool };
        pool.submit(move || {
            Self::run_node(ctx_addr, index);
        });
    }

    fn run_node(ctx_addr: usize, index: usize) {
        // SAFETY: see the dispatch comment in `update`.
        let ctx = unsafe { &*(ctx_addr as *const DispatchContext) };
        debug_assert!(index < ctx.node_count);
        let node = unsafe { &*ctx.nodes.add(index) };

        node.state.store(STATE_RUNNING, Ordering::Release);

        let system = unsafe { *ctx.systems.add(index) };
        if !system.is_null() {
            // SAFETY: this task is the only one holding this node's
            // slot pointer, so the reference is unique; the world cell
            // is sound because conflicting systems never run
            // concurrently (conflict edges) and all its write paths use
            // interior-mutable storage.
            let system = unsafe { &mut *system };
            let mut cell = unsafe { WorldCell::new(NonNull::new_unchecked(ctx.world)) };
            let commands = unsafe { &*ctx.commands };

            #[cfg(feature = "profiling")]
            let span = info_span!("system.run", name = system.name());
            #[cfg(feature = "profiling")]
            let _span_guard = span.enter();

            (system.run)(&mut cell, commands);
        }

        node.state.store(STATE_COMPLETE, Ordering::Release);

        for &successor in &node.successors {
            let successor_node = unsafe { &*ctx.nodes.add(successor) };
            let remaining = successor_node.unfinished_deps.fetch_sub(1, Ordering::AcqRel);
            if remaining == 1 {
                successor_node.state.store(STATE_READY, Ordering::Release);
                Self::submit_node(ctx_addr, successor);
            }
        }
    }

    /// Rebuild the dependency graph from the enabled systems.
    fn rebuild(&mut self) -> Result<()> {
        let order = self.systems.enabled_in_order();

        let mut nodes: Vec<Node> = order
            .iter()
            .map(|&id| Node {
                id,
                dependency_count: 0,
                unfinished_deps: AtomicU32::new(0),
                state: AtomicU8::new(STATE_PENDING),
                successors: Vec::new(),
            })
            .collect();

        // Edge A→B for every conflicting pair, B registered after A
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                let a = self.systems.get(nodes[i].id);
                let b = self.systems.get(nodes[j].id);
                let conflict = match (a, b) {
                    (Some(a), Some(b)) => a.access().conflicts_with(b.access()),
                    _ => false,
                };
                if conflict {
                    nodes[i].successors.push(j);
                    nodes[j].dependency_count += 1;
                }
            }
        }

        // Edges respect registration order, so a cycle would be an
        // implementation bug; verify with a Kahn pass anyway.
        let mut in_degree: Vec<u32> = nodes.iter().map(|n| n.dependency_count).collect();
        let mut queue: Vec<usize> = (0..nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut visited = 0;
        while let Some(i) = queue.pop() {
            visited += 1;
            for &j in &nodes[i].successors {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push(j);
                }
            }
        }
        if visited != nodes.len() {
            return Err(EcsError::SystemCycleDetected);
        }

        self.nodes = nodes;
        self.needs_rebuild = false;
        Ok(())
    }
}
