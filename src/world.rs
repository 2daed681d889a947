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

//! World: central entity and archetype storage

use std::any::{Any, TypeId};
use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use ahash::AHashMap;
use parking_lot::Mutex;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{Archetype, ArchetypeSignature, ComponentTicks};
use crate::component::{Bundle, Component, ComponentMeta, MAX_BUNDLE_COMPONENTS};
use crate::entity::{Entity, EntityAllocator, EntityLocation};
use crate::error::{EcsError, Result};
use crate::event::{EventReader, Events};
use crate::query::{CachedMatches, Query, QueryDescriptor, WorldQuery};

/// Resource slot.
///
/// The value sits behind an `UnsafeCell` so systems can write
/// resources through the shared world view; the scheduler's
/// access-descriptor rules keep writers exclusive.
struct ResourceCell(UnsafeCell<Box<dyn Any + Send + Sync>>);

unsafe impl Sync for ResourceCell {}

/// Central ECS world
///
/// Holds all entities, their archetype tables, resources and event
/// queues. Structural mutation requires `&mut World`; the parallel
/// scheduler hands out aliased access only to systems whose access
/// descriptors cannot conflict.
pub struct World {
    /// Generational entity id allocator
    entities: EntityAllocator,

    /// Entity locations, indexed by entity slot index
    locations: Vec<EntityLocation>,

    /// All archetypes in the world; never shrinks
    archetypes: Vec<Archetype>,

    /// Maps canonical signatures to archetype indices
    archetype_index: AHashMap<ArchetypeSignature, usize>,

    /// Transition edges: (archetype, component, is_add) -> archetype.
    /// Keeps the add/remove hot path at one hash lookup.
    transitions: AHashMap<(usize, TypeId, bool), usize>,

    /// Typed resources (singletons) for global state
    resources: AHashMap<TypeId, ResourceCell>,

    /// Double-buffered event queues, addressed by stable index
    events: Events,

    /// Current world tick
    tick: u32,

    /// Query match cache keyed by descriptor signature
    query_cache: Mutex<AHashMap<crate::query::QuerySignature, CachedMatches>>,
}

impl World {
    /// Create a new, empty world.
    pub fn new() -> Self {
        let mut world = Self {
            entities: EntityAllocator::new(),
            locations: Vec::new(),

            // Start with reasonable defaults to avoid resize spikes
            archetypes: Vec::with_capacity(64),
            archetype_index: AHashMap::with_capacity(64),
            transitions: AHashMap::with_capacity(128),

            resources: AHashMap::new(),
            events: Events::new(),

            tick: 1, // Tick 0 is reserved so change detection against 0 always passes
            query_cache: Mutex::new(AHashMap::with_capacity(32)),
        };

        // Bootstrap the empty archetype (entities with no components).
        // Always at index 0, which simplifies logic elsewhere.
        world.get_or_create_archetype_with(&[], |_| {});
        world
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn increment_tick(&mut self) {
        // Panic on overflow - tick wraparound would break change detection
        if self.tick == u32::MAX {
            panic!("World tick overflow at {}", self.tick);
        }
        self.tick += 1;
    }

    // ========== Entity lifecycle ==========

    /// Spawn a new entity with the given bundle of components.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> Entity {
        let type_ids = B::type_ids();
        let metas = B::metas();

        #[cfg(feature = "profiling")]
        let span = info_span!(
            "world.spawn",
            bundle_components = type_ids.len(),
            archetype_count = self.archetypes.len()
        );
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        #[cfg(debug_assertions)]
        {
            let mut sorted = type_ids.clone();
            sorted.sort();
            sorted.dedup();
            debug_assert_eq!(
                sorted.len(),
                type_ids.len(),
                "bundle contains duplicate component types"
            );
        }

        let entity = self.entities.allocate();
        self.ensure_location_slot(entity.index());

        let arch_id = self.get_or_create_archetype_with(&type_ids, |arch| {
            for meta in &metas {
                arch.add_column(*meta);
            }
        });

        let tick = self.tick;
        let archetype = &mut self.archetypes[arch_id];
        let row = archetype.allocate_row(entity);

        // Pre-calculate column indices so the write loop skips hash lookups
        let mut ptrs = [std::ptr::null_mut(); MAX_BUNDLE_COMPONENTS];
        for (i, &type_id) in type_ids.iter().enumerate() {
            if let Some(idx) = archetype.column_index(type_id) {
                if let Some(column) = archetype.column_mut_by_index(idx) {
                    ptrs[i] = column.push_uninit(tick);
                }
            }
        }

        unsafe {
            bundle.write_components(&ptrs[..type_ids.len()]);
        }

        #[cfg(debug_assertions)]
        archetype.assert_coherent();

        self.locations[entity.index() as usize] = EntityLocation {
            archetype_id: arch_id,
            row,
        };
        entity
    }

    /// Spawn an entity with no components (empty archetype).
    pub fn spawn_empty(&mut self) -> Entity {
        let entity = self.entities.allocate();
        self.ensure_location_slot(entity.index());
        let row = self.archetypes[0].allocate_row(entity);
        self.locations[entity.index() as usize] = EntityLocation {
            archetype_id: 0,
            row,
        };
        entity
    }

    /// Spawn multiple entities with the same component bundle in a batch.
    ///
    /// Cheaper than repeated `spawn`: one archetype lookup, one reserve.
    pub fn spawn_batch<B, I>(&mut self, bundles: I) -> Result<Vec<Entity>>
    where
        B: Bundle,
        I: IntoIterator<Item = B>,
        I::IntoIter: ExactSizeIterator,
    {
        let bundles = bundles.into_iter();
        let count = bundles.len();

        if count > 10_000_000 {
            return Err(EcsError::BatchTooLarge);
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let type_ids = B::type_ids();
        let metas = B::metas();
        let arch_id = self.get_or_create_archetype_with(&type_ids, |arch| {
            for meta in &metas {
                arch.add_column(*meta);
            }
        });

        let tick = self.tick;
        let mut out = Vec::with_capacity(count);
        self.archetypes[arch_id].reserve_rows(count);

        for bundle in bundles {
            let entity = self.entities.allocate();
            self.ensure_location_slot(entity.index());

            let archetype = &mut self.archetypes[arch_id];
            let row = archetype.allocate_row(entity);

            let mut ptrs = [std::ptr::null_mut(); MAX_BUNDLE_COMPONENTS];
            for (i, &type_id) in type_ids.iter().enumerate() {
                if let Some(idx) = archetype.column_index(type_id) {
                    if let Some(column) = archetype.column_mut_by_index(idx) {
                        ptrs[i] = column.push_uninit(tick);
                    }
                }
            }
            unsafe {
                bundle.write_components(&ptrs[..type_ids.len()]);
            }

            self.locations[entity.index() as usize] = EntityLocation {
                archetype_id: arch_id,
                row,
            };
            out.push(entity);
        }

        Ok(out)
    }

    /// Despawn an entity, removing all its components.
    ///
    /// A stale handle or an already-despawned entity reports
    /// `EntityNotFound`; the second call never double-frees because the
    /// slot generation has already advanced.
    pub fn despawn(&mut self, entity: Entity) -> Result<()> {
        if !self.entities.is_valid(entity) {
            return Err(EcsError::EntityNotFound);
        }

        let location = self.locations[entity.index() as usize];
        self.entities.deallocate(entity);
        self.locations[entity.index() as usize] = EntityLocation::INVALID;

        let archetype = &mut self.archetypes[location.archetype_id];
        unsafe {
            if let Some(swapped) = archetype.swap_remove_row(location.row, |_| true) {
                self.locations[swapped.index() as usize].row = location.row;
            }
        }
        Ok(())
    }

    /// Check if an entity handle is valid and the entity exists.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_valid(entity)
    }

    pub fn entity_count(&self) -> u32 {
        self.entities.alive_count() as u32
    }

    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        if !self.entities.is_valid(entity) {
            return None;
        }
        self.locations.get(entity.index() as usize).copied()
    }

    // ========== Component access ==========

    /// Get immutable reference to a component on an entity
    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<&T> {
        // Returns None for stale handles - caller decides error handling
        let location = self.location(entity)?;
        let archetype = self.archetypes.get(location.archetype_id)?;
        let column = archetype.column(TypeId::of::<T>())?;
        column.get::<T>(location.row)
    }

    /// Get mutable reference to a component, bumping its changed tick.
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let location = self.location(entity)?;
        let tick = self.tick;
        let archetype = self.archetypes.get_mut(location.archetype_id)?;
        let column = archetype.column_mut(TypeId::of::<T>())?;

        column.mark_changed(location.row, tick);
        column.get_mut::<T>(location.row)
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        if let Some(location) = self.location(entity) {
            if let Some(archetype) = self.archetypes.get(location.archetype_id) {
                return archetype.has_column(TypeId::of::<T>());
            }
        }
        false
    }

    /// Add a component to an entity, moving it between archetypes.
    ///
    /// If the entity already has `T` this overwrites the value and
    /// bumps the changed tick (set semantics).
    pub fn add_component<T: Component>(&mut self, entity: Entity, component: T) -> Result<()> {
        let mut value = ManuallyDrop::new(component);
        let result = unsafe {
            self.add_component_erased(
                entity,
                ComponentMeta::of::<T>(),
                &mut *value as *mut T as *mut u8,
            )
        };
        if result.is_err() {
            // Ownership only transfers on success
            unsafe { ManuallyDrop::drop(&mut value) };
        }
        result
    }

    /// Set a component value (alias for `add_component`'s overwrite-or-add).
    pub fn set_component<T: Component>(&mut self, entity: Entity, component: T) -> Result<()> {
        self.add_component(entity, component)
    }

    /// Remove a component from an entity.
    ///
    /// Removing a component the entity does not have is a no-op.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        self.remove_component_erased(entity, TypeId::of::<T>())
    }

    /// Visit the (type id, type name) of every component on an entity.
    pub fn for_each_component_type(
        &self,
        entity: Entity,
        mut f: impl FnMut(TypeId, &'static str),
    ) {
        if let Some(location) = self.location(entity) {
            if let Some(archetype) = self.archetypes.get(location.archetype_id) {
                for column in archetype.columns() {
                    f(column.meta().type_id, column.meta().type_name);
                }
            }
        }
    }

    // ========== Type-erased component ops (command buffer path) ==========

    /// Add or overwrite a component from a type-erased payload.
    ///
    /// # Safety
    /// `data` must point at a live value described by `meta`. On `Ok`
    /// ownership of the value transfers to the world; on `Err` it stays
    /// with the caller.
    pub(crate) unsafe fn add_component_erased(
        &mut self,
        entity: Entity,
        meta: ComponentMeta,
        data: *mut u8,
    ) -> Result<()> {
        if !self.entities.is_valid(entity) {
            return Err(EcsError::EntityNotFound);
        }
        let location = self.locations[entity.index() as usize];
        let tick = self.tick;

        // Present → overwrite in place
        let old_arch = &mut self.archetypes[location.archetype_id];
        if let Some(column) = old_arch.column_mut(meta.type_id) {
            let dst = column.get_ptr_mut(location.row);
            if let Some(drop_fn) = meta.drop_fn {
                drop_fn(dst);
            }
            std::ptr::copy_nonoverlapping(data, dst, meta.size);
            column.mark_changed(location.row, tick);
            return Ok(());
        }

        let target = self.transition_target(location.archetype_id, meta, true);
        self.move_entity_rows(entity, location, target, Some((meta, data)));
        Ok(())
    }

    pub(crate) fn remove_component_erased(&mut self, entity: Entity, type_id: TypeId) -> Result<()> {
        if !self.entities.is_valid(entity) {
            return Err(EcsError::EntityNotFound);
        }
        let location = self.locations[entity.index() as usize];
        let old_arch = &self.archetypes[location.archetype_id];

        let meta = match old_arch.column(type_id) {
            Some(column) => *column.meta(),
            // Absent component → no-op
            None => return Ok(()),
        };

        let target = self.transition_target(location.archetype_id, meta, false);
        unsafe {
            self.move_entity_rows(entity, location, target, None);
        }
        Ok(())
    }

    /// Look up (or create and cache) the add/remove transition edge.
    fn transition_target(&mut self, from: usize, meta: ComponentMeta, is_add: bool) -> usize {
        if let Some(&target) = self.transitions.get(&(from, meta.type_id, is_add)) {
            return target;
        }

        let old_arch = &self.archetypes[from];
        let mut signature = old_arch.signature().clone();
        let mut metas: Vec<ComponentMeta> = old_arch
            .columns()
            .iter()
            .map(|c| *c.meta())
            .filter(|m| is_add || m.type_id != meta.type_id)
            .collect();
        if is_add {
            signature.push(meta.type_id);
            metas.push(meta);
        } else {
            signature.retain(|t| *t != meta.type_id);
        }

        let target = self.get_or_create_archetype_with(&signature, |arch| {
            for m in &metas {
                arch.add_column(*m);
            }
        });
        self.transitions.insert((from, meta.type_id, is_add), target);
        target
    }

    /// Move an entity's row to another archetype, transferring shared
    /// columns with their original ticks. `new_value`, when present, is
    /// the freshly added component (added tick = current tick).
    ///
    /// # Safety
    /// `new_value`'s pointer must match its meta; ownership transfers.
    unsafe fn move_entity_rows(
        &mut self,
        entity: Entity,
        old_loc: EntityLocation,
        new_archetype_id: usize,
        new_value: Option<(ComponentMeta, *mut u8)>,
    ) {
        if old_loc.archetype_id == new_archetype_id {
            return;
        }

        let tick = self.tick;

        // Access both archetypes via split_at_mut
        let (old_arch, new_arch) = if old_loc.archetype_id < new_archetype_id {
            let (left, right) = self.archetypes.split_at_mut(new_archetype_id);
            (&mut left[old_loc.archetype_id], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(old_loc.archetype_id);
            (&mut right[0], &mut left[new_archetype_id])
        };

        let new_row = new_arch.allocate_row(entity);
        let new_sig = new_arch.signature().clone();

        for &type_id in &new_sig {
            if let Some((m, _)) = new_value {
                if m.type_id == type_id {
                    continue;
                }
            }
            let (src, ticks) = match old_arch.column_mut(type_id) {
                Some(old_col) => (
                    old_col.get_ptr(old_loc.row),
                    old_col
                        .ticks(old_loc.row)
                        .unwrap_or(ComponentTicks::new(tick)),
                ),
                None => continue,
            };
            if let Some(new_col) = new_arch.column_mut(type_id) {
                new_col.push_from(src, ticks);
            }
        }

        if let Some((m, data)) = new_value {
            if let Some(new_col) = new_arch.column_mut(m.type_id) {
                let dst = new_col.push_uninit(tick);
                std::ptr::copy_nonoverlapping(data, dst, m.size);
            }
        }

        // Remove from old archetype. Columns that moved to the new
        // archetype were already moved out bytewise; only columns with
        // no counterpart get dropped here.
        if let Some(swapped) = old_arch.swap_remove_row(old_loc.row, |t| !new_sig.contains(&t)) {
            self.locations[swapped.index() as usize].row = old_loc.row;
        }

        #[cfg(debug_assertions)]
        {
            old_arch.assert_coherent();
            new_arch.assert_coherent();
        }

        self.locations[entity.index() as usize] = EntityLocation {
            archetype_id: new_archetype_id,
            row: new_row,
        };
    }

    // ========== Archetype access ==========

    pub fn archetype(&self, id: usize) -> Option<&Archetype> {
        self.archetypes.get(id)
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Internal helper to expose archetype pointers for query iteration
    ///
    /// # Safety
    /// The pointer is valid as long as no archetype is created; callers
    /// must uphold the query aliasing rules.
    pub(crate) fn archetype_ptr(&self, id: usize) -> Option<NonNull<Archetype>> {
        self.archetypes.get(id).map(NonNull::from)
    }

    /// Get or create the archetype for a signature, sorting it into
    /// canonical order first so (A, B) and (B, A) intern to the same
    /// record.
    pub(crate) fn get_or_create_archetype_with<F>(
        &mut self,
        signature: &[TypeId],
        on_create: F,
    ) -> usize
    where
        F: FnOnce(&mut Archetype),
    {
        // Archetype explosion guard
        if self.archetypes.len() >= 10_000 {
            panic!("Archetype limit exceeded (10,000) - runaway component-set churn");
        }

        let mut sorted: ArchetypeSignature = ArchetypeSignature::from_slice(signature);
        sorted.sort();
        sorted.dedup();

        if let Some(&id) = self.archetype_index.get(&sorted) {
            return id;
        }

        let mut archetype = Archetype::new(sorted.clone());
        on_create(&mut archetype);

        // Push first so the cached id always refers to a live archetype
        self.archetypes.push(archetype);
        let id = self.archetypes.len() - 1;
        self.archetype_index.insert(sorted, id);
        id
    }

    // ========== Queries ==========

    /// Create a read-only query. Panics in debug builds if the term
    /// tuple declares write access; use `query_mut` for writes.
    pub fn query<Q: WorldQuery>(&self) -> Query<'_, Q> {
        Query::new_shared(self)
    }

    /// Create a query that may write components.
    pub fn query_mut<Q: WorldQuery>(&mut self) -> Query<'_, Q> {
        Query::new(self)
    }

    /// Matched archetype indices for a descriptor, via the incremental
    /// match cache.
    pub(crate) fn matched_archetypes(&self, descriptor: &QueryDescriptor) -> Vec<usize> {
        let mut cache = self.query_cache.lock();
        let cached = cache
            .entry(descriptor.signature())
            .or_insert_with(CachedMatches::new);
        cached.update(descriptor, &self.archetypes);
        cached.matches.clone()
    }

    /// Clear all cached query results.
    pub fn clear_query_cache(&self) {
        self.query_cache.lock().clear();
    }

    // ========== Resource API (Singleton State) ==========

    /// Insert a resource (singleton) into the world, replacing any
    /// existing resource of the same type.
    pub fn insert_resource<R: Send + Sync + 'static>(&mut self, resource: R) {
        self.resources
            .insert(TypeId::of::<R>(), ResourceCell(UnsafeCell::new(Box::new(resource))));
    }

    pub fn resource<R: 'static>(&self) -> Option<&R> {
        self.resources
            .get(&TypeId::of::<R>())
            .and_then(|cell| unsafe { (*cell.0.get()).downcast_ref() })
    }

    pub fn resource_mut<R: 'static>(&mut self) -> Option<&mut R> {
        self.resources
            .get_mut(&TypeId::of::<R>())
            .and_then(|cell| cell.0.get_mut().downcast_mut())
    }

    /// Mutable resource access through a shared world reference.
    ///
    /// # Safety
    /// The caller must hold exclusive logical access to this resource:
    /// either a `&mut World` somewhere up the chain, or a system whose
    /// access descriptor declares the write (the scheduler then keeps
    /// conflicting systems apart).
    pub(crate) unsafe fn resource_mut_shared<R: 'static>(&self) -> Option<&mut R> {
        self.resources
            .get(&TypeId::of::<R>())
            .and_then(|cell| (*cell.0.get()).downcast_mut())
    }

    pub fn has_resource<R: 'static>(&self) -> bool {
        self.resources.contains_key(&TypeId::of::<R>())
    }

    pub fn remove_resource<R: 'static>(&mut self) -> Option<R> {
        self.resources
            .remove(&TypeId::of::<R>())
            .and_then(|cell| cell.0.into_inner().downcast().ok())
            .map(|boxed| *boxed)
    }

    // ========== Events ==========

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut Events {
        &mut self.events
    }

    /// Send an event, registering the queue on first use.
    pub fn send_event<T: Send + Sync + 'static>(&mut self, event: T) {
        self.events.send(event);
    }

    /// Create a reader cursor for events of type `T`.
    pub fn event_reader<T: Send + Sync + 'static>(&mut self) -> EventReader<T> {
        self.events.reader()
    }

    // ========== Maintenance ==========

    /// Clear all entities, archetypes and caches. Resources and event
    /// queues survive.
    pub fn clear_entities(&mut self) {
        self.entities = EntityAllocator::new();
        self.locations.clear();
        self.archetypes.clear();
        self.archetype_index.clear();
        self.transitions.clear();
        self.query_cache.lock().clear();

        self.get_or_create_archetype_with(&[], |_| {});
    }

    fn ensure_location_slot(&mut self, index: u32) {
        let index = index as usize;
        if index >= self.locations.len() {
            self.locations.resize(index + 1, EntityLocation::INVALID);
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Aliased world access handed to systems by the parallel scheduler.
///
/// One cell exists per running system, built from a raw world pointer,
/// so no `&mut World` is ever materialized while systems are live on
/// worker threads. Every write path below goes through interior
/// mutability (column cells, resource cells); the scheduler's conflict
/// rules guarantee systems touching the same data never run at the
/// same time. Not constructible outside the crate, so the contract
/// cannot be entered from safe user code.
pub struct WorldCell {
    world: NonNull<World>,
}

impl WorldCell {
    /// # Safety
    /// `world` must come from an exclusive `&mut World` that stays
    /// untouched until every cell of this dispatch is gone, and cells
    /// used concurrently must belong to systems whose access
    /// descriptors do not conflict.
    pub(crate) unsafe fn new(world: NonNull<World>) -> Self {
        Self { world }
    }

    /// Shared view for reads (lookups, entity state, matching).
    pub fn world(&self) -> &World {
        unsafe { self.world.as_ref() }
    }

    pub fn tick(&self) -> u32 {
        self.world().tick()
    }

    /// Read-only query; same contract as [`World::query`].
    pub fn query<Q: WorldQuery>(&self) -> Query<'_, Q> {
        Query::new_shared(self.world())
    }

    /// Query that may write the components the owning system declared.
    pub fn query_mut<Q: WorldQuery>(&mut self) -> Query<'_, Q> {
        Query::new_raw(self.world, true)
    }

    /// Shared resource access (declare it as a resource read).
    pub fn resource<R: 'static>(&self) -> Option<&R> {
        self.world().resource()
    }

    /// Mutable resource access (declare it as a resource write).
    pub fn resource_mut<R: 'static>(&mut self) -> Option<&mut R> {
        // SAFETY: the borrow of self serialises uses within this
        // system; the access descriptor serialises across systems.
        unsafe { self.world.as_ref().resource_mut_shared::<R>() }
    }
}
