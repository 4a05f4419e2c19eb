//! Per-pool component storage.
//!
//! Each entity owns an ordered list of boxed components, at most one per
//! type, in the order they were first added. A per-type index of entity ids
//! answers "which entities have component X" without scanning every row.
//!
//! Queries return owned `Vec`s. A caller iterating a query result can freely
//! create, destroy, or move entities without invalidating what it holds.

use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use strata_meta::{AnyComponent, Component, ComponentBox};

/// Component storage for one pool.
#[derive(Debug, Default)]
pub struct ComponentTable {
    rows: BTreeMap<u64, Vec<ComponentBox>>,
    index: HashMap<TypeId, BTreeSet<u64>>,
}

impl ComponentTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `id` has a row, even an empty one.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.rows.contains_key(&id)
    }

    /// Ensure `id` has a row.
    pub fn insert_entity(&mut self, id: u64) {
        self.rows.entry(id).or_default();
    }

    /// Insert or replace a component. Returns the replaced component.
    ///
    /// A replacement keeps the original position in the entity's component
    /// order.
    pub fn put(&mut self, id: u64, component: ComponentBox) -> Option<ComponentBox> {
        let ty = component.component_type();
        let row = self.rows.entry(id).or_default();
        if let Some(slot) = row.iter_mut().find(|c| c.component_type() == ty) {
            return Some(std::mem::replace(slot, component));
        }
        row.push(component);
        self.index.entry(ty).or_default().insert(id);
        None
    }

    /// Borrow a component by type.
    #[must_use]
    pub fn get_dyn(&self, id: u64, ty: TypeId) -> Option<&dyn AnyComponent> {
        self.rows
            .get(&id)?
            .iter()
            .find(|c| c.component_type() == ty)
            .map(|c| &**c)
    }

    /// Mutably borrow a component by type.
    pub fn get_dyn_mut(
        &mut self,
        id: u64,
        ty: TypeId,
    ) -> Option<&mut (dyn AnyComponent + 'static)> {
        self.rows
            .get_mut(&id)?
            .iter_mut()
            .find(|c| c.component_type() == ty)
            .map(|c| &mut **c)
    }

    /// Borrow a typed component.
    #[must_use]
    pub fn get<T: Component>(&self, id: u64) -> Option<&T> {
        self.get_dyn(id, TypeId::of::<T>())?.downcast_ref::<T>()
    }

    /// Mutably borrow a typed component.
    pub fn get_mut<T: Component>(&mut self, id: u64) -> Option<&mut T> {
        self.get_dyn_mut(id, TypeId::of::<T>())?.downcast_mut::<T>()
    }

    /// Returns `true` if `id` has a component of type `ty`.
    #[must_use]
    pub fn has(&self, id: u64, ty: TypeId) -> bool {
        self.index.get(&ty).is_some_and(|ids| ids.contains(&id))
    }

    /// Remove one component. The entity keeps its row.
    pub fn remove_component(&mut self, id: u64, ty: TypeId) -> Option<ComponentBox> {
        let row = self.rows.get_mut(&id)?;
        let pos = row.iter().position(|c| c.component_type() == ty)?;
        let removed = row.remove(pos);
        self.unindex(id, ty);
        Some(removed)
    }

    /// Remove an entity and return its components in order.
    pub fn remove_entity(&mut self, id: u64) -> Option<Vec<ComponentBox>> {
        let row = self.rows.remove(&id)?;
        for component in &row {
            self.unindex(id, component.component_type());
        }
        Some(row)
    }

    /// Install a whole row, replacing any existing one.
    pub fn insert_row(&mut self, id: u64, components: Vec<ComponentBox>) {
        self.remove_entity(id);
        self.insert_entity(id);
        for component in components {
            self.put(id, component);
        }
    }

    /// The components of `id` in order. Empty if `id` has no row.
    #[must_use]
    pub fn components(&self, id: u64) -> &[ComponentBox] {
        self.rows.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The component types of `id` in order.
    #[must_use]
    pub fn component_types(&self, id: u64) -> Vec<TypeId> {
        self.components(id)
            .iter()
            .map(|c| c.component_type())
            .collect()
    }

    /// Every entity id in ascending order.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<u64> {
        self.rows.keys().copied().collect()
    }

    /// Ids of entities that have every type in `types`, ascending.
    ///
    /// An empty `types` matches every entity.
    #[must_use]
    pub fn entities_with(&self, types: &[TypeId]) -> Vec<u64> {
        let Some((first, rest)) = types.split_first() else {
            return self.entity_ids();
        };
        let Some(candidates) = self.index.get(first) else {
            return Vec::new();
        };
        candidates
            .iter()
            .copied()
            .filter(|&id| rest.iter().all(|&ty| self.has(id, ty)))
            .collect()
    }

    /// Every `(id, component)` pair of type `T`, ascending by id.
    #[must_use]
    pub fn iter_type<T: Component>(&self) -> Vec<(u64, &T)> {
        let Some(ids) = self.index.get(&TypeId::of::<T>()) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|&id| self.get::<T>(id).map(|c| (id, c)))
            .collect()
    }

    /// Number of entities with a row.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if no entity has a row.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }

    fn unindex(&mut self, id: u64, ty: TypeId) {
        if let Some(ids) = self.index.get_mut(&ty) {
            ids.remove(&id);
            if ids.is_empty() {
                self.index.remove(&ty);
            }
        }
    }
}
