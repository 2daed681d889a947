//! Query terms, descriptors, archetype matching and iteration.
//!
//! A query is a tuple of terms: `&T` reads, `&mut T` writes,
//! `Option<&T>` / `Option<&mut T>` are optional, `Without<T>` excludes,
//! `With<T>` requires without data access, and `Changed<T>` / `Added<T>`
//! filter rows by change ticks against a baseline set with
//! [`Query::since`].

use std::any::TypeId;
use std::marker::PhantomData;
use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::archetype::Archetype;
use crate::command::{CommandBuffer, Commands};
use crate::component::Component;
use crate::entity::Entity;
use crate::world::World;

/// Read or write intent of a data term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

/// Compiled form of a query term tuple.
///
/// `required`/`excluded` drive archetype matching; `access` lists the
/// data terms in declaration order and is folded into the owning
/// system's access descriptor.
#[derive(Debug, Clone, Default)]
pub struct QueryDescriptor {
    pub required: SmallVec<[TypeId; 8]>,
    pub excluded: SmallVec<[TypeId; 8]>,
    pub optional: SmallVec<[TypeId; 8]>,
    pub access: SmallVec<[(TypeId, AccessMode); 8]>,
    pub changed: SmallVec<[TypeId; 4]>,
    pub added: SmallVec<[TypeId; 4]>,
}

impl QueryDescriptor {
    pub fn add_required(&mut self, type_id: TypeId, mode: AccessMode) {
        if !self.required.contains(&type_id) {
            self.required.push(type_id);
        }
        self.access.push((type_id, mode));
    }

    pub fn add_filter(&mut self, type_id: TypeId) {
        if !self.required.contains(&type_id) {
            self.required.push(type_id);
        }
    }

    pub fn add_optional(&mut self, type_id: TypeId, mode: AccessMode) {
        if !self.optional.contains(&type_id) {
            self.optional.push(type_id);
        }
        self.access.push((type_id, mode));
    }

    pub fn add_excluded(&mut self, type_id: TypeId) {
        if !self.excluded.contains(&type_id) {
            self.excluded.push(type_id);
        }
    }

    /// Archetype match predicate: all required ids present, no
    /// excluded id present. Optional ids do not constrain matching.
    pub fn matches(&self, archetype: &Archetype) -> bool {
        self.required.iter().all(|t| archetype.has_column(*t))
            && !self.excluded.iter().any(|t| archetype.has_column(*t))
    }

    pub fn has_write_access(&self) -> bool {
        self.access.iter().any(|(_, m)| *m == AccessMode::Write)
    }

    /// Canonical cache key (matching depends only on required/excluded)
    pub fn signature(&self) -> QuerySignature {
        let mut required = self.required.clone();
        let mut excluded = self.excluded.clone();
        required.sort();
        excluded.sort();
        QuerySignature { required, excluded }
    }
}

/// Cache key for query match results
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuerySignature {
    required: SmallVec<[TypeId; 8]>,
    excluded: SmallVec<[TypeId; 8]>,
}

/// Incrementally maintained match list for one signature.
///
/// Archetypes are never destroyed, so the cache only ever scans the
/// tail of the archetype list it has not seen yet.
pub(crate) struct CachedMatches {
    pub matches: Vec<usize>,
    pub seen_archetypes: usize,
}

impl CachedMatches {
    pub fn new() -> Self {
        Self {
            matches: Vec::new(),
            seen_archetypes: 0,
        }
    }

    pub fn update(&mut self, descriptor: &QueryDescriptor, archetypes: &[Archetype]) {
        for (id, archetype) in archetypes
            .iter()
            .enumerate()
            .skip(self.seen_archetypes)
        {
            if descriptor.matches(archetype) {
                self.matches.push(id);
            }
        }
        self.seen_archetypes = archetypes.len();
    }
}

// ========== Terms ==========

/// One term of a query tuple
pub trait QueryTerm {
    /// Borrowed item produced per row
    type Item<'a>;
    /// Per-archetype prepared state (column indices)
    type State: Copy;

    fn describe(descriptor: &mut QueryDescriptor);

    /// Resolve per-archetype state for an archetype that matched
    fn prepare(archetype: &Archetype) -> Option<Self::State>;

    /// Fetch the item at `row`.
    ///
    /// # Safety
    /// `state` must come from `prepare` on the same archetype, `row`
    /// must be in bounds, and the caller upholds the aliasing implied
    /// by the descriptor's access modes.
    unsafe fn fetch<'a>(
        archetype: NonNull<Archetype>,
        state: Self::State,
        row: usize,
        tick: u32,
    ) -> Self::Item<'a>;

    /// Row filter for tick terms; data terms always pass.
    ///
    /// # Safety
    /// Same contract as `fetch`.
    #[inline]
    unsafe fn filter(
        _archetype: NonNull<Archetype>,
        _state: Self::State,
        _row: usize,
        _since: u32,
    ) -> bool {
        true
    }
}

impl<'t, T: Component> QueryTerm for &'t T {
    type Item<'a> = &'a T;
    type State = usize;

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_required(TypeId::of::<T>(), AccessMode::Read);
    }

    fn prepare(archetype: &Archetype) -> Option<usize> {
        archetype.column_index(TypeId::of::<T>())
    }

    unsafe fn fetch<'a>(
        archetype: NonNull<Archetype>,
        state: usize,
        row: usize,
        _tick: u32,
    ) -> &'a T {
        let column = &archetype.as_ref().columns()[state];
        &*(column.get_ptr(row) as *const T)
    }
}

impl<'t, T: Component> QueryTerm for &'t mut T {
    type Item<'a> = &'a mut T;
    type State = usize;

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_required(TypeId::of::<T>(), AccessMode::Write);
    }

    fn prepare(archetype: &Archetype) -> Option<usize> {
        archetype.column_index(TypeId::of::<T>())
    }

    unsafe fn fetch<'a>(
        archetype: NonNull<Archetype>,
        state: usize,
        row: usize,
        tick: u32,
    ) -> &'a mut T {
        // Writes go through the column's interior cells; no mutable
        // reference to the archetype or world is ever formed, so
        // concurrent systems on other columns stay disjoint.
        let column = &archetype.as_ref().columns()[state];
        // A write access marks the row changed
        column.mark_changed_shared(row, tick);
        &mut *(column.get_ptr_mut(row) as *mut T)
    }
}

impl<'t, T: Component> QueryTerm for Option<&'t T> {
    type Item<'a> = Option<&'a T>;
    type State = Option<usize>;

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_optional(TypeId::of::<T>(), AccessMode::Read);
    }

    fn prepare(archetype: &Archetype) -> Option<Option<usize>> {
        Some(archetype.column_index(TypeId::of::<T>()))
    }

    unsafe fn fetch<'a>(
        archetype: NonNull<Archetype>,
        state: Option<usize>,
        row: usize,
        tick: u32,
    ) -> Option<&'a T> {
        state.map(|index| <&T as QueryTerm>::fetch(archetype, index, row, tick))
    }
}

impl<'t, T: Component> QueryTerm for Option<&'t mut T> {
    type Item<'a> = Option<&'a mut T>;
    type State = Option<usize>;

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_optional(TypeId::of::<T>(), AccessMode::Write);
    }

    fn prepare(archetype: &Archetype) -> Option<Option<usize>> {
        Some(archetype.column_index(TypeId::of::<T>()))
    }

    unsafe fn fetch<'a>(
        archetype: NonNull<Archetype>,
        state: Option<usize>,
        row: usize,
        tick: u32,
    ) -> Option<&'a mut T> {
        state.map(|index| <&mut T as QueryTerm>::fetch(archetype, index, row, tick))
    }
}

/// Require the component to be present without accessing its data
pub struct With<T: Component>(PhantomData<T>);

impl<T: Component> QueryTerm for With<T> {
    type Item<'a> = ();
    type State = ();

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_filter(TypeId::of::<T>());
    }

    fn prepare(_archetype: &Archetype) -> Option<()> {
        Some(())
    }

    unsafe fn fetch<'a>(_: NonNull<Archetype>, _: (), _: usize, _: u32) -> Self::Item<'a> {}
}

/// Exclude archetypes containing the component
pub struct Without<T: Component>(PhantomData<T>);

impl<T: Component> QueryTerm for Without<T> {
    type Item<'a> = ();
    type State = ();

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_excluded(TypeId::of::<T>());
    }

    fn prepare(_archetype: &Archetype) -> Option<()> {
        Some(())
    }

    unsafe fn fetch<'a>(_: NonNull<Archetype>, _: (), _: usize, _: u32) -> Self::Item<'a> {}
}

/// Pass only rows whose `T` changed after the `since` baseline
pub struct Changed<T: Component>(PhantomData<T>);

impl<T: Component> QueryTerm for Changed<T> {
    type Item<'a> = ();
    type State = usize;

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_required(TypeId::of::<T>(), AccessMode::Read);
        descriptor.changed.push(TypeId::of::<T>());
    }

    fn prepare(archetype: &Archetype) -> Option<usize> {
        archetype.column_index(TypeId::of::<T>())
    }

    unsafe fn fetch<'a>(_: NonNull<Archetype>, _: usize, _: usize, _: u32) -> Self::Item<'a> {}

    unsafe fn filter(
        archetype: NonNull<Archetype>,
        state: usize,
        row: usize,
        since: u32,
    ) -> bool {
        match archetype.as_ref().columns()[state].ticks(row) {
            Some(ticks) => ticks.changed > since,
            None => false,
        }
    }
}

/// Pass only rows whose `T` was added after the `since` baseline
pub struct Added<T: Component>(PhantomData<T>);

impl<T: Component> QueryTerm for Added<T> {
    type Item<'a> = ();
    type State = usize;

    fn describe(descriptor: &mut QueryDescriptor) {
        descriptor.add_required(TypeId::of::<T>(), AccessMode::Read);
        descriptor.added.push(TypeId::of::<T>());
    }

    fn prepare(archetype: &Archetype) -> Option<usize> {
        archetype.column_index(TypeId::of::<T>())
    }

    unsafe fn fetch<'a>(_: NonNull<Archetype>, _: usize, _: usize, _: u32) -> Self::Item<'a> {}

    unsafe fn filter(
        archetype: NonNull<Archetype>,
        state: usize,
        row: usize,
        since: u32,
    ) -> bool {
        match archetype.as_ref().columns()[state].ticks(row) {
            Some(ticks) => ticks.added > since,
            None => false,
        }
    }
}

// ========== Tuples ==========

/// A full query shape: tuple of terms
pub trait WorldQuery {
    type Item<'a>;
    type State: Copy;

    fn descriptor() -> QueryDescriptor;
    fn prepare(archetype: &Archetype) -> Option<Self::State>;

    /// # Safety
    /// See [`QueryTerm::fetch`].
    unsafe fn fetch<'a>(
        archetype: NonNull<Archetype>,
        state: Self::State,
        row: usize,
        tick: u32,
    ) -> Self::Item<'a>;

    /// # Safety
    /// See [`QueryTerm::filter`].
    unsafe fn filter(
        archetype: NonNull<Archetype>,
        state: Self::State,
        row: usize,
        since: u32,
    ) -> bool;
}

macro_rules! impl_world_query {
    ($($T:ident),+) => {
        impl<$($T: QueryTerm),+> WorldQuery for ($($T,)+) {
            type Item<'a> = ($($T::Item<'a>,)+);
            type State = ($($T::State,)+);

            fn descriptor() -> QueryDescriptor {
                let mut descriptor = QueryDescriptor::default();
                $($T::describe(&mut descriptor);)+
                descriptor
            }

            #[allow(non_snake_case)]
            fn prepare(archetype: &Archetype) -> Option<Self::State> {
                Some(($($T::prepare(archetype)?,)+))
            }

            #[allow(non_snake_case)]
            unsafe fn fetch<'a>(
                archetype: NonNull<Archetype>,
                state: Self::State,
                row: usize,
                tick: u32,
            ) -> Self::Item<'a> {
                let ($($T,)+) = state;
                ($($T::fetch(archetype, $T, row, tick),)+)
            }

            #[allow(non_snake_case)]
            unsafe fn filter(
                archetype: NonNull<Archetype>,
                state: Self::State,
                row: usize,
                since: u32,
            ) -> bool {
                let ($($T,)+) = state;
                $(
                    if !$T::filter(archetype, $T, row, since) {
                        return false;
                    }
                )+
                true
            }
        }
    };
}

impl_world_query!(A);
impl_world_query!(A, B);
impl_world_query!(A, B, C);
impl_world_query!(A, B, C, D);
impl_world_query!(A, B, C, D, E);
impl_world_query!(A, B, C, D, E, F);
impl_world_query!(A, B, C, D, E, F, G);
impl_world_query!(A, B, C, D, E, F, G, H);

// ========== Query ==========

/// Iterates the tables of every archetype matching `Q`.
///
/// Every matching entity is visited exactly once per `each` call.
/// Structural edits during iteration are forbidden; route them through
/// a command buffer (`each_with_commands`).
pub struct Query<'w, Q: WorldQuery> {
    world: NonNull<World>,
    matched: Vec<usize>,
    since: u32,
    writable: bool,
    _marker: PhantomData<(&'w World, Q)>,
}

impl<'w, Q: WorldQuery> Query<'w, Q> {
    pub(crate) fn new(world: &'w mut World) -> Self {
        Self::new_raw(NonNull::from(world), true)
    }

    pub(crate) fn new_shared(world: &'w World) -> Self {
        debug_assert!(
            !Q::descriptor().has_write_access(),
            "read-only query declares write terms; use World::query_mut"
        );
        Self::new_raw(NonNull::from(world), false)
    }

    /// Build a query directly over a world pointer. Used by the world
    /// cell handed to scheduled systems; the caller vouches for the
    /// aliasing discipline.
    pub(crate) fn new_raw(world: NonNull<World>, writable: bool) -> Self {
        let descriptor = Q::descriptor();
        let matched = unsafe { world.as_ref() }.matched_archetypes(&descriptor);
        Self {
            world,
            matched,
            since: 0,
            writable,
            _marker: PhantomData,
        }
    }

    /// Set the change-detection baseline for `Changed`/`Added` terms.
    #[must_use]
    pub fn since(mut self, tick: u32) -> Self {
        self.since = tick;
        self
    }

    pub fn matched_archetype_count(&self) -> usize {
        self.matched.len()
    }

    /// Visit every matching row.
    pub fn each<'q>(&'q mut self, mut f: impl FnMut(Q::Item<'q>)) {
        Self::each_row(self, move |_, item| f(item));
    }

    /// Visit every matching row with its entity.
    pub fn each_with_entity<'q>(&'q mut self, f: impl FnMut(Entity, Q::Item<'q>)) {
        Self::each_row(self, f);
    }

    /// Visit every matching row with the calling worker's command
    /// buffer for deferred structural edits.
    pub fn each_with_commands<'q>(
        &'q mut self,
        commands: &Commands,
        mut f: impl FnMut(Entity, Q::Item<'q>, &mut CommandBuffer),
    ) {
        let mut buffer = commands.current();
        Self::each_row(self, move |entity, item| f(entity, item, &mut buffer));
    }

    /// Visit every matching row with a shared resource reference.
    ///
    /// Does nothing when the resource is absent.
    pub fn each_with_res<'q, R: 'static>(&'q mut self, mut f: impl FnMut(Q::Item<'q>, &R)) {
        let world = unsafe { self.world.as_ref() };
        let Some(resource) = world.resource::<R>() else {
            return;
        };
        Self::each_row(self, move |_, item| f(item, resource));
    }

    /// Visit every matching row with a mutable resource reference.
    ///
    /// Requires a `query_mut`-created query; does nothing when the
    /// resource is absent.
    pub fn each_with_res_mut<'q, R: 'static>(
        &'q mut self,
        mut f: impl FnMut(Q::Item<'q>, &mut R),
    ) {
        debug_assert!(self.writable, "each_with_res_mut requires a writable query");
        let world = unsafe { self.world.as_ref() };
        // SAFETY: resource writes are declared in the owning system's
        // access set, so the scheduler never runs a conflicting system
        // at the same time; the value sits behind its own cell.
        let Some(resource) = (unsafe { world.resource_mut_shared::<R>() }) else {
            return;
        };
        Self::each_row(self, move |_, item| f(item, &mut *resource));
    }

    /// Number of rows passing the match and tick filters.
    pub fn count(&mut self) -> usize {
        let mut n = 0;
        Self::each_row(self, |_, _| n += 1);
        n
    }

    fn each_row<'q>(this: &'q mut Self, mut f: impl FnMut(Entity, Q::Item<'q>)) {
        let world = unsafe { this.world.as_ref() };
        let tick = world.tick();
        for &arch_id in &this.matched {
            let Some(arch_ptr) = world.archetype_ptr(arch_id) else {
                continue;
            };
            let archetype = unsafe { arch_ptr.as_ref() };
            let Some(state) = Q::prepare(archetype) else {
                continue;
            };
            for row in 0..archetype.len() {
                unsafe {
                    if !Q::filter(arch_ptr, state, row, this.since) {
                        continue;
                    }
                    let entity = archetype.entities()[row];
                    f(entity, Q::fetch(arch_ptr, state, row, tick));
                }
            }
        }
    }
}
