//! Entity copying with ownership semantics.
//!
//! Copying an entity copies each of its components through the component
//! library. Fields declared as owning entities are remapped to fresh copies
//! of the owned entities, recursively. Plain entity references are copied
//! as-is.
//!
//! Within one copy operation each owned entity is copied at most once, so
//! two fields owning the same entity end up owning the same copy. An
//! ownership cycle cannot be copied faithfully: the back reference is copied
//! as [`EntityRef::NULL`] and a warning is logged.

use std::collections::HashMap;

use strata_meta::{ComponentBox, ComponentLibrary, EntityRef, OwnedEntityCopier};
use tracing::{debug, warn};

use crate::builder::EntityBuilder;
use crate::manager::EntityManager;

/// Copies entities for one top-level copy operation.
struct OwnedCopy<'m> {
    manager: &'m mut EntityManager,
    library: ComponentLibrary,
    /// Entities whose copy is under construction, outermost first.
    in_progress: Vec<u64>,
    /// Source id to finished copy.
    copies: HashMap<u64, EntityRef>,
}

impl<'m> OwnedCopy<'m> {
    fn new(manager: &'m mut EntityManager) -> Self {
        let library = manager.library().clone();
        Self {
            manager,
            library,
            in_progress: Vec::new(),
            copies: HashMap::new(),
        }
    }

    /// Copies of the components of `entity`, with owned entities duplicated.
    fn copy_components_of(&mut self, entity: EntityRef) -> Vec<ComponentBox> {
        let mut snapshot = Vec::new();
        for component in self.manager.components(entity) {
            let Some(metadata) = self.library.metadata_of(&**component) else {
                warn!(
                    entity = entity.id(),
                    component = component.component_type_name(),
                    "component type is not registered, not copied"
                );
                continue;
            };
            if let Some(copy) = metadata.copy(&**component, self.library.copy_strategies()) {
                snapshot.push((copy, metadata.references_owned_entities()));
            }
        }

        let library = self.library.clone();
        let mut components = Vec::with_capacity(snapshot.len());
        for (copy, owns_entities) in snapshot {
            if !owns_entities {
                components.push(copy);
                continue;
            }
            match library.copy_with_owned_entities(&*copy, self) {
                Some(owned) => components.push(owned),
                None => components.push(copy),
            }
        }
        components
    }
}

impl OwnedEntityCopier for OwnedCopy<'_> {
    fn copy_owned(&mut self, entity: EntityRef) -> EntityRef {
        if !entity.is_valid() {
            return EntityRef::NULL;
        }
        let id = entity.id();
        if let Some(&copy) = self.copies.get(&id) {
            return copy;
        }
        if self.in_progress.contains(&id) {
            warn!(entity = id, "ownership cycle, owned reference copied as null");
            return EntityRef::NULL;
        }
        if !self.manager.is_active(entity) {
            debug!(entity = id, "owned entity is not loaded, reference copied as null");
            return EntityRef::NULL;
        }

        self.in_progress.push(id);
        let components = self.copy_components_of(entity);
        self.in_progress.pop();

        let pool = self
            .manager
            .pool_of(entity)
            .unwrap_or_else(|| self.manager.current_pool());
        let mut builder = EntityBuilder::from_components(components);
        builder.set_pool(pool);
        let copy = builder.build(self.manager);
        self.copies.insert(id, copy);
        copy
    }
}

impl EntityManager {
    /// Create a copy of `entity`, duplicating the entities it owns.
    ///
    /// The copy lives in the same pool as `entity` and receives the usual
    /// creation events. Returns [`EntityRef::NULL`] if `entity` is not
    /// loaded.
    pub fn copy(&mut self, entity: EntityRef) -> EntityRef {
        if !self.is_active(entity) {
            return EntityRef::NULL;
        }
        OwnedCopy::new(self).copy_owned(entity)
    }

    /// Copies of the components of `entity`, duplicating the entities they
    /// own. The copies are not attached to any entity.
    pub fn copy_components(&mut self, entity: EntityRef) -> Vec<ComponentBox> {
        if !self.is_active(entity) {
            return Vec::new();
        }
        let mut copier = OwnedCopy::new(self);
        copier.in_progress.push(entity.id());
        copier.copy_components_of(entity)
    }
}
