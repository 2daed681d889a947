//! Parent/child hierarchy built from two components.
//!
//! All tree walks are bounded by [`MAX_HIERARCHY_DEPTH`] so a
//! malformed tree can never hang a traversal.

use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::world::World;

/// Upper bound on any ancestor/descendant walk
pub const MAX_HIERARCHY_DEPTH: usize = 256;

/// Parent relationship component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parent(pub Entity);

impl Parent {
    pub fn entity(&self) -> Entity {
        self.0
    }
}

/// Children relationship component
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Children {
    children: Vec<Entity>,
}

impl Children {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_child(&mut self, child: Entity) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    pub fn remove_child(&mut self, child: Entity) -> bool {
        if let Some(pos) = self.children.iter().position(|&c| c == child) {
            self.children.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, child: Entity) -> bool {
        self.children.contains(&child)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.children.iter()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl World {
    /// Attach `child` under `parent`, updating both sides.
    ///
    /// Rejects self-parenting and cycles: if `parent` is already a
    /// descendant of `child` the hierarchy is left untouched and an
    /// error is returned.
    pub fn set_parent(&mut self, child: Entity, parent: Entity) -> Result<()> {
        if !self.is_alive(child) || !self.is_alive(parent) {
            return Err(EcsError::EntityNotFound);
        }
        if child == parent {
            return Err(EcsError::HierarchyError(
                "cannot parent an entity to itself".into(),
            ));
        }

        // Ancestor walk from `parent`; hitting `child` means a cycle
        let mut current = Some(parent);
        let mut depth = 0;
        while let Some(ancestor) = current {
            if ancestor == child {
                return Err(EcsError::HierarchyError(
                    "reparenting would create a cycle".into(),
                ));
            }
            depth += 1;
            if depth > MAX_HIERARCHY_DEPTH {
                return Err(EcsError::HierarchyError(
                    "hierarchy depth limit exceeded".into(),
                ));
            }
            current = self.parent(ancestor);
        }

        // Detach from the old parent first
        if let Some(old_parent) = self.parent(child) {
            if let Some(children) = self.get_component_mut::<Children>(old_parent) {
                children.remove_child(child);
            }
        }

        self.set_component(child, Parent(parent))?;

        if let Some(children) = self.get_component_mut::<Children>(parent) {
            children.add_child(child);
        } else {
            let mut children = Children::new();
            children.add_child(child);
            self.add_component(parent, children)?;
        }

        Ok(())
    }

    /// Detach `child` from its parent. No parent is a no-op.
    pub fn remove_parent(&mut self, child: Entity) -> Result<()> {
        if !self.is_alive(child) {
            return Err(EcsError::EntityNotFound);
        }
        let Some(parent) = self.parent(child) else {
            return Ok(());
        };
        if let Some(children) = self.get_component_mut::<Children>(parent) {
            children.remove_child(child);
        }
        self.remove_component::<Parent>(child)
    }

    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.get_component::<Parent>(entity).map(|p| p.entity())
    }

    /// Direct children, cloned out of the component
    pub fn children(&self, entity: Entity) -> Vec<Entity> {
        self.get_component::<Children>(entity)
            .map(|c| c.children.clone())
            .unwrap_or_default()
    }

    /// Topmost ancestor (the entity itself when it has no parent)
    pub fn root(&self, entity: Entity) -> Entity {
        let mut current = entity;
        for _ in 0..MAX_HIERARCHY_DEPTH {
            match self.parent(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Number of edges between `entity` and its root
    pub fn depth(&self, entity: Entity) -> usize {
        let mut depth = 0;
        let mut current = entity;
        while let Some(parent) = self.parent(current) {
            depth += 1;
            if depth >= MAX_HIERARCHY_DEPTH {
                break;
            }
            current = parent;
        }
        depth
    }

    /// All descendants of `entity`, depth-first, depth-bounded
    pub fn descendants(&self, entity: Entity) -> Vec<Entity> {
        let mut out = Vec::new();
        let mut stack: Vec<(Entity, usize)> = self
            .children(entity)
            .into_iter()
            .map(|c| (c, 1))
            .collect();

        while let Some((current, depth)) = stack.pop() {
            out.push(current);
            if depth >= MAX_HIERARCHY_DEPTH {
                continue;
            }
            for child in self.children(current) {
                stack.push((child, depth + 1));
            }
        }
        out
    }

    /// Despawn `entity` and its whole subtree, children before parents.
    pub fn despawn_recursive(&mut self, entity: Entity) -> Result<()> {
        if !self.is_alive(entity) {
            return Err(EcsError::EntityNotFound);
        }

        // Detach the subtree root from its own parent
        if let Some(parent) = self.parent(entity) {
            if let Some(children) = self.get_component_mut::<Children>(parent) {
                children.remove_child(entity);
            }
        }

        // Reversed pre-order visits every child before its parent
        let descendants = self.descendants(entity);
        for &e in descendants.iter().rev() {
            let _ = self.despawn(e);
        }
        self.despawn(entity)
    }
}
