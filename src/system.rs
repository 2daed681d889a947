//! Systems, access descriptors and generational system storage.
//!
//! The access descriptor is the only input the scheduler uses to
//! decide which systems may run concurrently.

use std::any::TypeId;

use crate::command::Commands;
use crate::component::Component;
use crate::query::{AccessMode, QueryDescriptor, WorldQuery};
use crate::world::WorldCell;

/// How a system touches the world beyond its declared accesses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorldAccess {
    /// Touches only the declared components and resources
    #[default]
    Pure,
    /// Reads shared world structure (archetype layout, entity liveness)
    Shared,
    /// Needs the whole world to itself; serialises against everything
    Exclusive,
}

/// System access metadata
#[derive(Debug, Clone, Default)]
pub struct SystemAccess {
    pub component_reads: Vec<TypeId>,
    pub component_writes: Vec<TypeId>,
    pub resource_reads: Vec<TypeId>,
    pub resource_writes: Vec<TypeId>,
    pub world_access: WorldAccess,
}

impl SystemAccess {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Conflict rule:
    /// 1. Either side is `Exclusive`.
    /// 2. One writes a component the other reads or writes.
    /// 3. Same for resources.
    /// Read-read never conflicts.
    pub fn conflicts_with(&self, other: &SystemAccess) -> bool {
        if self.world_access == WorldAccess::Exclusive
            || other.world_access == WorldAccess::Exclusive
        {
            return true;
        }

        overlaps(&self.component_writes, &other.component_writes)
            || overlaps(&self.component_writes, &other.component_reads)
            || overlaps(&self.component_reads, &other.component_writes)
            || overlaps(&self.resource_writes, &other.resource_writes)
            || overlaps(&self.resource_writes, &other.resource_reads)
            || overlaps(&self.resource_reads, &other.resource_writes)
    }

    /// Fold a query descriptor's data accesses into this access set.
    pub fn merge_query(&mut self, descriptor: &QueryDescriptor) {
        for &(type_id, mode) in &descriptor.access {
            match mode {
                AccessMode::Read => {
                    if !self.component_reads.contains(&type_id) {
                        self.component_reads.push(type_id);
                    }
                }
                AccessMode::Write => {
                    if !self.component_writes.contains(&type_id) {
                        self.component_writes.push(type_id);
                    }
                }
            }
        }
    }
}

fn overlaps(a: &[TypeId], b: &[TypeId]) -> bool {
    a.iter().any(|x| b.contains(x))
}

/// Generational handle into system storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId {
    pub index: u32,
    pub generation: u32,
}

/// Executor closure: the system body.
///
/// Receives a [`WorldCell`] (interior-mutable world access, guarded by
/// the scheduler's conflict rules) and the per-worker command buffers
/// for deferred structural edits.
pub type SystemFn = Box<dyn FnMut(&mut WorldCell, &Commands) + Send>;

/// A named executor with a query-derived access set and an enabled flag
pub struct System {
    pub(crate) name: &'static str,
    pub(crate) access: SystemAccess,
    pub(crate) run: SystemFn,
    pub(crate) enabled: bool,
    pub(crate) last_run_tick: u32,
}

impl System {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn access(&self) -> &SystemAccess {
        &self.access
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Tick of the last completed run, for change-detection baselines.
    pub fn last_run_tick(&self) -> u32 {
        self.last_run_tick
    }
}

/// Fluent constructor for [`System`]
pub struct SystemBuilder {
    name: &'static str,
    access: SystemAccess,
}

impl SystemBuilder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            access: SystemAccess::empty(),
        }
    }

    /// Fold the access of query `Q` into the system's access set.
    #[must_use]
    pub fn with_query<Q: WorldQuery>(mut self) -> Self {
        self.access.merge_query(&Q::descriptor());
        self
    }

    #[must_use]
    pub fn reads<T: Component>(mut self) -> Self {
        let type_id = TypeId::of::<T>();
        if !self.access.component_reads.contains(&type_id) {
            self.access.component_reads.push(type_id);
        }
        self
    }

    #[must_use]
    pub fn writes<T: Component>(mut self) -> Self {
        let type_id = TypeId::of::<T>();
        if !self.access.component_writes.contains(&type_id) {
            self.access.component_writes.push(type_id);
        }
        self
    }

    #[must_use]
    pub fn reads_resource<R: 'static>(mut self) -> Self {
        let type_id = TypeId::of::<R>();
        if !self.access.resource_reads.contains(&type_id) {
            self.access.resource_reads.push(type_id);
        }
        self
    }

    #[must_use]
    pub fn writes_resource<R: 'static>(mut self) -> Self {
        let type_id = TypeId::of::<R>();
        if !self.access.resource_writes.contains(&type_id) {
            self.access.resource_writes.push(type_id);
        }
        self
    }

    #[must_use]
    pub fn shared_world(mut self) -> Self {
        self.access.world_access = WorldAccess::Shared;
        self
    }

    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.access.world_access = WorldAccess::Exclusive;
        self
    }

    pub fn build<F>(self, f: F) -> System
    where
        F: FnMut(&mut WorldCell, &Commands) + Send + 'static,
    {
        System {
            name: self.name,
            access: self.access,
            run: Box::new(f),
            enabled: true,
            last_run_tick: 0,
        }
    }
}

struct SystemSlot {
    generation: u32,
    system: Option<System>,
}

/// Generational system storage.
///
/// Registration order is preserved (it defines scheduler edge
/// direction); removed slots are reused with a bumped generation.
pub struct Systems {
    slots: Vec<SystemSlot>,
    free: Vec<u32>,
    order: Vec<SystemId>,
}

impl Systems {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, system: System) -> SystemId {
        let id = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.system = Some(system);
            SystemId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(SystemSlot {
                generation: 0,
                system: Some(system),
            });
            SystemId {
                index,
                generation: 0,
            }
        };
        self.order.push(id);
        id
    }

    pub fn remove(&mut self, id: SystemId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let slot = &mut self.slots[id.index as usize];
        slot.system = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.order.retain(|o| *o != id);
        true
    }

    pub fn contains(&self, id: SystemId) -> bool {
        self.slots
            .get(id.index as usize)
            .map_or(false, |slot| slot.generation == id.generation && slot.system.is_some())
    }

    pub fn get(&self, id: SystemId) -> Option<&System> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.system.as_ref()
    }

    pub fn get_mut(&mut self, id: SystemId) -> Option<&mut System> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.system.as_mut()
    }

    /// Enable or disable a system. Returns false for a stale id.
    pub fn set_enabled(&mut self, id: SystemId, enabled: bool) -> bool {
        match self.get_mut(id) {
            Some(system) => {
                system.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Live system ids in registration order
    pub fn order(&self) -> &[SystemId] {
        &self.order
    }

    /// Enabled system ids in registration order
    pub fn enabled_in_order(&self) -> Vec<SystemId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.get(*id).map_or(false, |s| s.enabled))
            .collect()
    }

    /// Raw pointers to the systems backing `ids`, for the scheduler's
    /// dispatch. Null for a stale or removed id.
    ///
    /// The pointers are derived from the slot array base, never through
    /// a reference to the containing storage, so worker threads can
    /// each turn their own pointer into a `&mut System` without any
    /// aliasing reference to `Systems` existing anywhere. They stay
    /// valid until the next structural mutation of the system set
    /// (which forces a scheduler rebuild before the next dispatch).
    pub(crate) fn system_ptrs(&mut self, ids: &[SystemId]) -> Vec<*mut System> {
        let len = self.slots.len();
        let base = self.slots.as_mut_ptr();
        ids.iter()
            .map(|id| {
                let index = id.index as usize;
                if index >= len {
                    return std::ptr::null_mut();
                }
                unsafe {
                    let slot = base.add(index);
                    if (*slot).generation != id.generation {
                        return std::ptr::null_mut();
                    }
                    match &mut (*slot).system {
                        Some(system) => system as *mut System,
                        None => std::ptr::null_mut(),
                    }
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for Systems {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_write_conflicts() {
        let mut a = SystemAccess::empty();
        a.component_writes.push(TypeId::of::<i32>());

        let mut b = SystemAccess::empty();
        b.component_writes.push(TypeId::of::<i32>());

        assert!(a.conflicts_with(&b));
    }

    #[test]
    fn test_read_read_never_conflicts() {
        let mut a = SystemAccess::empty();
        a.component_reads.push(TypeId::of::<i32>());

        let mut b = SystemAccess::empty();
        b.component_reads.push(TypeId::of::<i32>());

        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_write_read_conflicts_symmetric() {
        let mut a = SystemAccess::empty();
        a.component_writes.push(TypeId::of::<i32>());

        let mut b = SystemAccess::empty();
        b.component_reads.push(TypeId::of::<i32>());

        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
    }

    #[test]
    fn test_resource_conflicts() {
        struct Shared;

        let mut a = SystemAccess::empty();
        a.resource_writes.push(TypeId::of::<Shared>());

        let mut b = SystemAccess::empty();
        b.resource_reads.push(TypeId::of::<Shared>());

        assert!(a.conflicts_with(&b));

        let mut c = SystemAccess::empty();
        c.resource_reads.push(TypeId::of::<Shared>());
        assert!(!b.conflicts_with(&c));
    }

    #[test]
    fn test_exclusive_conflicts_with_everything() {
        let mut a = SystemAccess::empty();
        a.world_access = WorldAccess::Exclusive;

        let b = SystemAccess::empty();
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
    }

    #[test]
    fn test_builder_folds_query_access() {
        let system = SystemBuilder::new("movement")
            .with_query::<(&mut f32, &i32)>()
            .reads_resource::<u64>()
            .build(|_, _| {});

        assert!(system.access.component_writes.contains(&TypeId::of::<f32>()));
        assert!(system.access.component_reads.contains(&TypeId::of::<i32>()));
        assert!(system.access.resource_reads.contains(&TypeId::of::<u64>()));
        assert_eq!(system.access.world_access, WorldAccess::Pure);
    }

    #[test]
    fn test_generational_system_ids() {
        let mut systems = Systems::new();
        let a = systems.register(SystemBuilder::new("a").build(|_, _| {}));
        assert!(systems.contains(a));

        assert!(systems.remove(a));
        assert!(!systems.contains(a));

        // Slot reuse bumps generation; stale id stays dead
        let b = systems.register(SystemBuilder::new("b").build(|_, _| {}));
        assert_eq!(b.index, a.index);
        assert_ne!(b.generation, a.generation);
        assert!(!systems.contains(a));
        assert!(systems.contains(b));
    }

    #[test]
    fn test_enable_disable() {
        let mut systems = Systems::new();
        let a = systems.register(SystemBuilder::new("a").build(|_, _| {}));
        let b = systems.register(SystemBuilder::new("b").build(|_, _| {}));

        assert_eq!(systems.enabled_in_order(), vec![a, b]);

        systems.set_enabled(a, false);
        assert_eq!(systems.enabled_in_order(), vec![b]);

        systems.set_enabled(a, true);
        assert_eq!(systems.enabled_in_order(), vec![a, b]);
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut systems = Systems::new();
        let a = systems.register(SystemBuilder::new("a").build(|_, _| {}));
        let b = systems.register(SystemBuilder::new("b").build(|_, _| {}));
        let c = systems.register(SystemBuilder::new("c").build(|_, _| {}));

        systems.remove(b);
        let d = systems.register(SystemBuilder::new("d").build(|_, _| {}));

        // d reuses b's slot but sits last in registration order
        assert_eq!(systems.order(), &[a, c, d]);
    }
}
