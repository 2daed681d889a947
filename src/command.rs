// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deferred structural edits: per-worker command buffers and the
//! world-level `Commands` aggregate.
//!
//! Component payloads live in a linked list of fixed-size blocks drawn
//! from the backing allocator; the buffer owns the blocks and releases
//! them on clear, flush or drop.

use std::any::TypeId;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use crate::alloc::AllocatorRef;
use crate::component::{Component, ComponentMeta};
use crate::entity::Entity;
use crate::util::align_to;
use crate::world::World;

const COMMAND_BLOCK_SIZE: usize = 4096;

// Payload area must satisfy any component alignment
#[repr(C, align(16))]
struct CommandBlock {
    data: [u8; COMMAND_BLOCK_SIZE],
    used: usize,
    next: *mut CommandBlock,
}

/// Deferred command; payload pointers refer into the buffer's blocks
enum Command {
    Spawn {
        token: SpawnToken,
    },
    Despawn {
        entity: Entity,
    },
    Add {
        entity: Entity,
        meta: ComponentMeta,
        data: *mut u8,
    },
    Remove {
        entity: Entity,
        type_id: TypeId,
    },
    Set {
        entity: Entity,
        meta: ComponentMeta,
        data: *mut u8,
    },
    /// Arbitrary deferred world mutation (event sends, resource edits)
    Custom {
        run: Box<dyn FnOnce(&mut World) + Send>,
    },
}

/// Placeholder for an entity created by a deferred `spawn`.
///
/// The real id exists only after the buffer is flushed; look it up
/// with [`CommandBuffer::spawned_entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnToken(u32);

impl SpawnToken {
    pub fn index(self) -> u32 {
        self.0
    }

    /// Entity-shaped placeholder carrying the pending flag; valid as a
    /// command target inside the same buffer.
    pub fn pending_entity(self) -> Entity {
        Entity::with_flags(self.0, 0, Entity::FLAG_PENDING)
    }
}

/// Per-worker queue of deferred structural edits.
///
/// Not thread-safe; `Commands` hands each worker its own buffer.
/// Commands apply in insertion order at flush.
pub struct CommandBuffer {
    alloc: AllocatorRef,
    commands: Vec<Command>,
    spawned: Vec<Entity>,
    head_block: *mut CommandBlock,
    current_block: *mut CommandBlock,
    spawn_count: u32,
}

// Payloads are components (Send + Sync); blocks are uniquely owned
unsafe impl Send for CommandBuffer {}

impl CommandBuffer {
    pub fn new(alloc: AllocatorRef) -> Self {
        Self {
            alloc,
            commands: Vec::new(),
            spawned: Vec::new(),
            head_block: std::ptr::null_mut(),
            current_block: std::ptr::null_mut(),
            spawn_count: 0,
        }
    }

    /// Queue a spawn, returning a builder for its components.
    pub fn spawn(&mut self) -> SpawnBuilder<'_> {
        let token = SpawnToken(self.spawn_count);
        self.spawn_count += 1;
        self.commands.push(Command::Spawn { token });
        SpawnBuilder {
            buffer: self,
            token,
        }
    }

    /// Queue a despawn. `entity` may be a pending-token entity from
    /// this buffer's own `spawn`.
    pub fn despawn(&mut self, entity: Entity) {
        self.commands.push(Command::Despawn { entity });
    }

    /// Queue an add. Acts as set if the entity already has `T` at flush.
    pub fn add<T: Component>(&mut self, entity: Entity, component: T) {
        let (meta, data) = self.store_payload(component);
        self.commands.push(Command::Add { entity, meta, data });
    }

    /// Queue a component overwrite (or add, if absent at flush).
    pub fn set<T: Component>(&mut self, entity: Entity, component: T) {
        let (meta, data) = self.store_payload(component);
        self.commands.push(Command::Set { entity, meta, data });
    }

    /// Queue a remove. Absent component at flush is a no-op.
    pub fn remove<T: Component>(&mut self, entity: Entity) {
        self.commands.push(Command::Remove {
            entity,
            type_id: TypeId::of::<T>(),
        });
    }

    /// Queue an arbitrary world mutation, applied in insertion order
    /// with the rest of the buffer. This is how systems reach
    /// `&mut World` operations (event sends, resource insertion) that
    /// have no dedicated command.
    pub fn custom<F>(&mut self, f: F)
    where
        F: FnOnce(&mut World) + Send + 'static,
    {
        self.commands.push(Command::Custom { run: Box::new(f) });
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Real entity for a spawn token. Valid after the flush that
    /// executed the spawn, until the next flush reassigns the token.
    pub fn spawned_entity(&self, token: SpawnToken) -> Option<Entity> {
        self.spawned.get(token.0 as usize).copied().filter(|e| !e.is_invalid())
    }

    /// Apply all queued commands to the world in insertion order, then
    /// reset the buffer for reuse. Spawn tokens resolve to real ids
    /// during this call.
    pub fn flush(&mut self, world: &mut World) {
        let commands = std::mem::take(&mut self.commands);
        for command in commands {
            match command {
                Command::Spawn { token } => {
                    let entity = world.spawn_empty();
                    let slot = token.0 as usize;
                    if self.spawned.len() <= slot {
                        self.spawned.resize(slot + 1, Entity::invalid());
                    }
                    self.spawned[slot] = entity;
                }
                Command::Despawn { entity } => {
                    let entity = self.resolve(entity);
                    // Stale/double despawn is a no-op
                    let _ = world.despawn(entity);
                }
                Command::Add { entity, meta, data } | Command::Set { entity, meta, data } => {
                    let entity = self.resolve(entity);
                    let applied = unsafe { world.add_component_erased(entity, meta, data) };
                    if applied.is_err() {
                        // Target gone; payload ownership stays here
                        if let Some(drop_fn) = meta.drop_fn {
                            unsafe { drop_fn(data) };
                        }
                    }
                }
                Command::Remove { entity, type_id } => {
                    let entity = self.resolve(entity);
                    let _ = world.remove_component_erased(entity, type_id);
                }
                Command::Custom { run } => {
                    run(world);
                }
            }
        }

        self.release_blocks();
        self.spawn_count = 0;
    }

    /// Discard all queued commands without applying them, dropping any
    /// stored payloads.
    pub fn clear(&mut self) {
        for command in self.commands.drain(..) {
            match command {
                Command::Add { meta, data, .. } | Command::Set { meta, data, .. } => {
                    if let Some(drop_fn) = meta.drop_fn {
                        unsafe { drop_fn(data) };
                    }
                }
                _ => {}
            }
        }
        self.spawned.clear();
        self.spawn_count = 0;
        self.release_blocks();
    }

    fn resolve(&self, entity: Entity) -> Entity {
        if entity.has_flag(Entity::FLAG_PENDING) {
            return self
                .spawned
                .get(entity.index() as usize)
                .copied()
                .unwrap_or(Entity::invalid());
        }
        entity
    }

    fn store_payload<T: Component>(&mut self, component: T) -> (ComponentMeta, *mut u8) {
        let meta = ComponentMeta::of::<T>();
        let data = self.allocate_payload(meta.size, meta.align);
        unsafe {
            std::ptr::write(data as *mut T, component);
        }
        (meta, data)
    }

    fn allocate_payload(&mut self, size: usize, align: usize) -> *mut u8 {
        if size == 0 {
            return align as *mut u8;
        }
        assert!(
            size <= COMMAND_BLOCK_SIZE,
            "component too large for a command block"
        );
        assert!(
            align <= std::mem::align_of::<CommandBlock>(),
            "component over-aligned for a command block"
        );

        if self.current_block.is_null() {
            self.push_block();
        }

        unsafe {
            let mut block = &mut *self.current_block;
            let mut offset = align_to(block.used, align);
            if offset + size > COMMAND_BLOCK_SIZE {
                self.push_block();
                block = &mut *self.current_block;
                offset = 0;
            }
            block.used = offset + size;
            block.data.as_mut_ptr().add(offset)
        }
    }

    fn push_block(&mut self) {
        let ptr = self.alloc.allocate(
            std::mem::size_of::<CommandBlock>(),
            std::mem::align_of::<CommandBlock>(),
        ) as *mut CommandBlock;
        assert!(!ptr.is_null(), "command block allocation failed");

        unsafe {
            std::ptr::addr_of_mut!((*ptr).used).write(0);
            std::ptr::addr_of_mut!((*ptr).next).write(std::ptr::null_mut());
        }

        if self.current_block.is_null() {
            self.head_block = ptr;
        } else {
            unsafe {
                (*self.current_block).next = ptr;
            }
        }
        self.current_block = ptr;
    }

    fn release_blocks(&mut self) {
        let mut block = self.head_block;
        while !block.is_null() {
            let next = unsafe { (*block).next };
            unsafe {
                self.alloc.deallocate(
                    block as *mut u8,
                    std::mem::size_of::<CommandBlock>(),
                    std::mem::align_of::<CommandBlock>(),
                );
            }
            block = next;
        }
        self.head_block = std::ptr::null_mut();
        self.current_block = std::ptr::null_mut();
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Builder for spawning entities with components via a command buffer
pub struct SpawnBuilder<'a> {
    buffer: &'a mut CommandBuffer,
    token: SpawnToken,
}

impl<'a> SpawnBuilder<'a> {
    #[must_use]
    pub fn with<T: Component>(self, component: T) -> Self {
        let pending = self.token.pending_entity();
        self.buffer.add(pending, component);
        self
    }

    pub fn token(&self) -> SpawnToken {
        self.token
    }
}

/// World-level aggregate of per-worker command buffers.
///
/// Each worker writes to its own slot (selected by the thread-pool
/// worker index), so recording is contention-free in the common case;
/// external threads share slot 0.
pub struct Commands {
    buffers: Vec<CachePadded<Mutex<CommandBuffer>>>,
}

impl Commands {
    pub fn new(alloc: AllocatorRef, worker_count: usize) -> Self {
        let count = worker_count.max(1);
        let buffers = (0..count)
            .map(|_| CachePadded::new(Mutex::new(CommandBuffer::new(alloc.clone()))))
            .collect();
        Self { buffers }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Lock a specific worker's buffer.
    pub fn buffer(&self, worker: usize) -> MutexGuard<'_, CommandBuffer> {
        self.buffers[worker % self.buffers.len()].lock()
    }

    /// Lock the calling thread's buffer: the worker's own slot inside
    /// the thread pool, slot 0 elsewhere.
    pub fn current(&self) -> MutexGuard<'_, CommandBuffer> {
        let index = crate::thread_pool::current_worker_index().unwrap_or(0);
        self.buffer(index)
    }

    /// Apply all buffers in worker order (0, 1, …), each in insertion
    /// order.
    pub fn flush_all(&self, world: &mut World) {
        for buffer in &self.buffers {
            buffer.lock().flush(world);
        }
    }

    /// Total queued commands across all buffers
    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(|b| b.lock().len()).sum()
    }

    pub fn clear_all(&self) {
        for buffer in &self.buffers {
            buffer.lock().clear();
        }
    }
}
