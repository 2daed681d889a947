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

//! Archetype storage: one type-erased column per component, an entity
//! column, and per-row change ticks on every column.

use std::any::TypeId;
use std::cell::UnsafeCell;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::{Component, ComponentMeta, MAX_BUNDLE_COMPONENTS};
use crate::entity::Entity;

/// Canonical sorted set of component type ids
pub type ArchetypeSignature = SmallVec<[TypeId; MAX_BUNDLE_COMPONENTS]>;

/// Per-row change-detection ticks.
///
/// `added` is set when the component lands on the entity; `changed`
/// bumps on every write. Both must travel with the row on moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentTicks {
    pub added: u32,
    pub changed: u32,
}

impl ComponentTicks {
    pub fn new(tick: u32) -> Self {
        Self {
            added: tick,
            changed: tick,
        }
    }
}

/// Type-erased component column with parallel tick storage.
///
/// Value bytes and ticks live behind `UnsafeCell` so queries can write
/// rows through a shared `&Column` without ever materializing a
/// mutable reference to the archetype or the world. Structural changes
/// (push, swap-remove, reserve) still require `&mut self`; the
/// scheduler's access-descriptor rules guarantee no two threads write
/// the same column at the same time.
pub struct Column {
    data: UnsafeCell<Vec<u8>>,
    ticks: UnsafeCell<Vec<ComponentTicks>>,
    meta: ComponentMeta,
}

impl Column {
    pub fn new(meta: ComponentMeta) -> Self {
        Self {
            data: UnsafeCell::new(Vec::new()),
            ticks: UnsafeCell::new(Vec::new()),
            meta,
        }
    }

    pub fn meta(&self) -> &ComponentMeta {
        &self.meta
    }

    pub fn type_id(&self) -> TypeId {
        self.meta.type_id
    }

    pub fn item_size(&self) -> usize {
        self.meta.size
    }

    // Row count never changes while shared access is live (structural
    // edits need &mut), so reading through the cell is fine here.
    fn ticks_slice(&self) -> &[ComponentTicks] {
        unsafe { &*self.ticks.get() }
    }

    /// Row count (tick storage is one entry per row, including ZSTs)
    pub fn len(&self) -> usize {
        self.ticks_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks_slice().is_empty()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.data.get_mut().reserve(additional * self.meta.size);
        self.ticks.get_mut().reserve(additional);
    }

    /// Raw pointer to the value at `row`.
    ///
    /// # Safety
    /// `row < self.len()`, and no concurrent writer on this column.
    pub unsafe fn get_ptr(&self, row: usize) -> *const u8 {
        if self.meta.size == 0 {
            return self.meta.align as *const u8;
        }
        (*self.data.get()).as_ptr().add(row * self.meta.size)
    }

    /// Writable pointer to the value at `row`, through a shared column
    /// reference.
    ///
    /// # Safety
    /// `row < self.len()`, and the caller must hold exclusive logical
    /// access to this column (the scheduler's conflict rules, or a
    /// `&mut` chain above it).
    pub unsafe fn get_ptr_mut(&self, row: usize) -> *mut u8 {
        if self.meta.size == 0 {
            return self.meta.align as *mut u8;
        }
        (*self.data.get()).as_mut_ptr().add(row * self.meta.size)
    }

    /// Typed access. Bounds-checked; the caller guarantees `T` matches
    /// the column's type.
    pub fn get<T: Component>(&self, row: usize) -> Option<&T> {
        debug_assert_eq!(TypeId::of::<T>(), self.meta.type_id);
        if row >= self.len() {
            return None;
        }
        Some(unsafe { &*(self.get_ptr(row) as *const T) })
    }

    pub fn get_mut<T: Component>(&mut self, row: usize) -> Option<&mut T> {
        debug_assert_eq!(TypeId::of::<T>(), self.meta.type_id);
        if row >= self.len() {
            return None;
        }
        Some(unsafe { &mut *(self.get_ptr_mut(row) as *mut T) })
    }

    pub fn ticks(&self, row: usize) -> Option<ComponentTicks> {
        self.ticks_slice().get(row).copied()
    }

    pub fn mark_changed(&mut self, row: usize, tick: u32) {
        if let Some(t) = self.ticks.get_mut().get_mut(row) {
            t.changed = tick;
        }
    }

    /// Bump a row's changed tick through a shared column reference.
    ///
    /// # Safety
    /// Same exclusivity contract as [`Column::get_ptr_mut`].
    pub(crate) unsafe fn mark_changed_shared(&self, row: usize, tick: u32) {
        if let Some(t) = (&mut *self.ticks.get()).get_mut(row) {
            t.changed = tick;
        }
    }

    /// Append an uninitialized row and return its pointer; the caller
    /// must write a valid `T` before any other column access.
    pub fn push_uninit(&mut self, tick: u32) -> *mut u8 {
        let row = self.len();
        self.ticks.get_mut().push(ComponentTicks::new(tick));
        if self.meta.size == 0 {
            return self.meta.align as *mut u8;
        }
        let data = self.data.get_mut();
        data.resize((row + 1) * self.meta.size, 0);
        unsafe { data.as_mut_ptr().add(row * self.meta.size) }
    }

    /// Append a row by moving bytes from `src`, carrying its ticks.
    ///
    /// Used for archetype transitions: the transferred component keeps
    /// its original ticks.
    ///
    /// # Safety
    /// `src` must point at a live value of this column's type; the
    /// caller forfeits ownership of it.
    pub unsafe fn push_from(&mut self, src: *const u8, ticks: ComponentTicks) {
        let row = self.len();
        self.ticks.get_mut().push(ticks);
        if self.meta.size == 0 {
            return;
        }
        let data = self.data.get_mut();
        data.resize((row + 1) * self.meta.size, 0);
        std::ptr::copy_nonoverlapping(
            src,
            data.as_mut_ptr().add(row * self.meta.size),
            self.meta.size,
        );
    }

    /// Remove `row`, moving the last row (bytes + ticks) into its slot.
    ///
    /// `drop_value` selects whether the removed value is dropped
    /// (deletion) or forgotten (its bytes were already moved out by a
    /// transition).
    ///
    /// # Safety
    /// `row < self.len()`.
    pub unsafe fn swap_remove(&mut self, row: usize, drop_value: bool) {
        debug_assert!(row < self.len());
        let last = self.len() - 1;

        if drop_value {
            if let Some(drop_fn) = self.meta.drop_fn {
                drop_fn(self.get_ptr_mut(row));
            }
        }

        self.ticks.get_mut().swap_remove(row);

        if self.meta.size == 0 {
            return;
        }
        let size = self.meta.size;
        let data = self.data.get_mut();
        if row != last {
            let base = data.as_mut_ptr();
            std::ptr::copy_nonoverlapping(base.add(last * size), base.add(row * size), size);
        }
        data.truncate(last * size);
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.meta.drop_fn {
            for row in 0..self.len() {
                unsafe {
                    drop_fn(self.get_ptr_mut(row));
                }
            }
        }
    }
}

// Columns only ever hold Component values, which are Send + Sync; the
// interior cells are guarded by the access-descriptor contract
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

/// Archetype: Structure of Arrays storage for one component set.
///
/// Interned by sorted signature; lives for the process lifetime once
/// created. Row order is not stable across structural edits.
pub struct Archetype {
    signature: ArchetypeSignature,
    entities: Vec<Entity>,
    columns: Vec<Column>,
    column_index: FxHashMap<TypeId, usize>,
}

impl Archetype {
    pub fn new(signature: ArchetypeSignature) -> Self {
        Self {
            signature,
            entities: Vec::new(),
            columns: Vec::new(),
            column_index: FxHashMap::default(),
        }
    }

    pub fn signature(&self) -> &ArchetypeSignature {
        &self.signature
    }

    /// Register a column. Only valid while the archetype is empty.
    pub fn add_column(&mut self, meta: ComponentMeta) {
        debug_assert!(self.entities.is_empty());
        if !self.column_index.contains_key(&meta.type_id) {
            let idx = self.columns.len();
            self.columns.push(Column::new(meta));
            self.column_index.insert(meta.type_id, idx);
        }
    }

    pub fn has_column(&self, type_id: TypeId) -> bool {
        self.column_index.contains_key(&type_id)
    }

    pub fn column_index(&self, type_id: TypeId) -> Option<usize> {
        self.column_index.get(&type_id).copied()
    }

    pub fn column(&self, type_id: TypeId) -> Option<&Column> {
        let idx = *self.column_index.get(&type_id)?;
        self.columns.get(idx)
    }

    pub fn column_mut(&mut self, type_id: TypeId) -> Option<&mut Column> {
        let idx = *self.column_index.get(&type_id)?;
        self.columns.get_mut(idx)
    }

    pub fn column_by_index(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn column_mut_by_index(&mut self, index: usize) -> Option<&mut Column> {
        self.columns.get_mut(index)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Allocate a row for `entity`. The caller must push exactly one
    /// value into every column before the table is observed again.
    pub fn allocate_row(&mut self, entity: Entity) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        row
    }

    /// Remove `row` with swap-remove. `drop_component` decides per
    /// column whether the removed value is dropped or was moved out.
    ///
    /// Returns the entity that got swapped into `row`, if any, so the
    /// caller can patch its location.
    ///
    /// # Safety
    /// `row` must be a valid row index and every column must have the
    /// same length as the entity column.
    pub unsafe fn swap_remove_row(
        &mut self,
        row: usize,
        drop_component: impl Fn(TypeId) -> bool,
    ) -> Option<Entity> {
        if row >= self.entities.len() {
            return None;
        }

        self.entities.swap_remove(row);
        for column in &mut self.columns {
            column.swap_remove(row, drop_component(column.type_id()));
        }

        if row < self.entities.len() {
            Some(self.entities[row])
        } else {
            None
        }
    }

    pub fn reserve_rows(&mut self, additional: usize) {
        if self.entities.capacity() - self.entities.len() < additional {
            self.entities.reserve(additional);
            for column in &mut self.columns {
                column.reserve(additional);
            }
        }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, row: usize) -> Option<Entity> {
        self.entities.get(row).copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn assert_coherent(&self) {
        for column in &self.columns {
            debug_assert_eq!(column.len(), self.entities.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_archetype_creation() {
        let sig: ArchetypeSignature = smallvec![TypeId::of::<i32>(), TypeId::of::<f32>()];
        let arch = Archetype::new(sig.clone());
        assert_eq!(arch.signature(), &sig);
        assert_eq!(arch.len(), 0);
    }

    #[test]
    fn test_column_push_and_get() {
        let mut col = Column::new(ComponentMeta::of::<u64>());
        let ptr = col.push_uninit(5);
        unsafe { std::ptr::write(ptr as *mut u64, 42) };

        assert_eq!(col.len(), 1);
        assert_eq!(col.get::<u64>(0), Some(&42));
        let ticks = col.ticks(0).unwrap();
        assert_eq!(ticks.added, 5);
        assert_eq!(ticks.changed, 5);
    }

    #[test]
    fn test_column_swap_remove_moves_last_and_ticks() {
        let mut col = Column::new(ComponentMeta::of::<u64>());
        for (i, tick) in [(10u64, 1u32), (20, 2), (30, 3)] {
            let ptr = col.push_uninit(tick);
            unsafe { std::ptr::write(ptr as *mut u64, i) };
        }

        unsafe { col.swap_remove(0, true) };

        assert_eq!(col.len(), 2);
        // Former last element is now at row 0, ticks byte-for-byte intact
        assert_eq!(col.get::<u64>(0), Some(&30));
        assert_eq!(col.ticks(0).unwrap(), ComponentTicks::new(3));
        assert_eq!(col.get::<u64>(1), Some(&20));
    }

    #[test]
    fn test_column_swap_remove_drop_count() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked(#[allow(dead_code)] u32);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let mut col = Column::new(ComponentMeta::of::<Tracked>());
            for i in 0..3 {
                let ptr = col.push_uninit(1);
                unsafe { std::ptr::write(ptr as *mut Tracked, Tracked(i)) };
            }

            unsafe { col.swap_remove(1, true) };
            // Exactly one live object gone
            assert_eq!(DROPS.load(Ordering::SeqCst), 1);
            assert_eq!(col.len(), 2);
        }
        // Remaining two dropped with the column
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_sized_component_column() {
        struct Tag;
        let mut col = Column::new(ComponentMeta::of::<Tag>());
        let ptr = col.push_uninit(1);
        unsafe { std::ptr::write(ptr as *mut Tag, Tag) };
        col.push_uninit(2);

        assert_eq!(col.len(), 2);
        assert!(col.get::<Tag>(0).is_some());
        unsafe { col.swap_remove(0, true) };
        assert_eq!(col.len(), 1);
        assert_eq!(col.ticks(0).unwrap(), ComponentTicks::new(2));
    }

    #[test]
    fn test_swap_remove_row_returns_swapped_entity() {
        let mut arch = Archetype::new(smallvec![TypeId::of::<u32>()]);
        arch.add_column(ComponentMeta::of::<u32>());

        let e0 = Entity::new(0, 0);
        let e1 = Entity::new(1, 0);
        let e2 = Entity::new(2, 0);
        for (e, v) in [(e0, 10u32), (e1, 20), (e2, 30)] {
            let row = arch.allocate_row(e);
            let ptr = arch.column_mut(TypeId::of::<u32>()).unwrap().push_uninit(1);
            unsafe { std::ptr::write(ptr as *mut u32, v) };
            let _ = row;
        }

        let swapped = unsafe { arch.swap_remove_row(0, |_| true) };
        assert_eq!(swapped, Some(e2));
        assert_eq!(arch.len(), 2);
        assert_eq!(arch.entity(0), Some(e2));
    }
}
