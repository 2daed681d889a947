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

//! Lattice ECS - concurrent game runtime core
//!
//! Archetype-based entity storage, a work-stealing parallel scheduler
//! with deferred command buffers, double-buffered events, and a
//! handle-based asset runtime sharing the same allocator interface
//! and thread pool.

pub mod alloc;
pub mod archetype;
pub mod assets;
pub mod command;
pub mod component;
pub mod deque;
pub mod entity;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod mpmc;
pub mod query;
pub mod schedule;
pub mod system;
pub mod thread_pool;
pub mod util;
pub mod world;

// Re-exports for convenience
pub use alloc::{Allocator, AllocatorRef, SystemAllocator, ThreadSafeAllocator};
pub use archetype::{Archetype, ComponentTicks};
pub use command::{CommandBuffer, Commands, SpawnToken};
pub use component::{Bundle, Component, ComponentMeta};
pub use entity::{Entity, EntityLocation};
pub use error::{EcsError, Result};
pub use event::{EventQueue, EventReader, Events};
pub use hierarchy::{Children, Parent, MAX_HIERARCHY_DEPTH};
pub use query::{
    AccessMode, Added, Changed, Query, QueryDescriptor, QueryTerm, With, Without, WorldQuery,
};
pub use schedule::Scheduler;
pub use system::{System, SystemAccess, SystemBuilder, SystemId, WorldAccess};
pub use thread_pool::{IdleStrategy, ThreadPool, ThreadPoolConfig};
pub use world::{World, WorldCell};

pub use assets::{AssetServer, AssetStatus, StrongHandle, WeakHandle};
