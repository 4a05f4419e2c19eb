//! Staged entity construction.
//!
//! An [`EntityBuilder`] collects components and settings without touching the
//! manager. [`EntityBuilder::build`] then commits everything at once:
//!
//! 1. claim the id (explicit or fresh),
//! 2. place the components in the target pool,
//! 3. send Added then Activated for every component, unless suppressed,
//! 4. notify change subscribers of the components present at that point,
//! 5. move the entity to the pool its scope calls for.

use std::any::TypeId;

use strata_meta::{Component, ComponentBox, ComponentLibrary, EntityRef};
use tracing::{debug, warn};

use crate::components::{EntityInfoComponent, EntityScope};
use crate::lifecycle::LifecycleEvent;
use crate::manager::EntityManager;
use crate::pool::PoolId;
use crate::prefab::Prefab;

/// Collects components and settings for a new entity.
#[derive(Debug)]
pub struct EntityBuilder {
    components: Vec<ComponentBox>,
    id: Option<u64>,
    pool: Option<PoolId>,
    scope: Option<EntityScope>,
    send_lifecycle_events: bool,
}

impl Default for EntityBuilder {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            id: None,
            pool: None,
            scope: None,
            send_lifecycle_events: true,
        }
    }
}

impl EntityBuilder {
    /// An empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder holding `components`. Later components replace earlier ones
    /// of the same type.
    #[must_use]
    pub fn from_components(components: Vec<ComponentBox>) -> Self {
        let mut builder = Self::new();
        for component in components {
            builder.add_boxed(component);
        }
        builder
    }

    /// Add or replace a component.
    pub fn add_component<T: Component>(&mut self, component: T) -> &mut Self {
        self.add_boxed(Box::new(component))
    }

    /// Add or replace a boxed component.
    pub fn add_boxed(&mut self, component: ComponentBox) -> &mut Self {
        let ty = component.component_type();
        match self.components.iter_mut().find(|c| c.component_type() == ty) {
            Some(slot) => *slot = component,
            None => self.components.push(component),
        }
        self
    }

    /// Add copies of the components of prefab `name`.
    ///
    /// Returns `false` if the manager has no such prefab.
    pub fn add_prefab(&mut self, manager: &EntityManager, name: &str) -> bool {
        match manager.prefabs().get(name) {
            Some(prefab) => {
                self.add_prefab_template(prefab, manager.library());
                true
            }
            None => false,
        }
    }

    /// Add copies of the components of `prefab`.
    pub fn add_prefab_template(
        &mut self,
        prefab: &Prefab,
        library: &ComponentLibrary,
    ) -> &mut Self {
        for component in prefab.instantiate(library) {
            self.add_boxed(component);
        }
        self
    }

    /// Borrow a staged component.
    #[must_use]
    pub fn get_component<T: Component>(&self) -> Option<&T> {
        self.components.iter().find_map(|c| c.downcast_ref::<T>())
    }

    /// Mutably borrow a staged component.
    pub fn get_component_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.components
            .iter_mut()
            .find_map(|c| c.downcast_mut::<T>())
    }

    /// Returns `true` if a `T` is staged.
    #[must_use]
    pub fn has_component<T: Component>(&self) -> bool {
        self.components.iter().any(|c| c.is::<T>())
    }

    /// Remove a staged component.
    pub fn remove_component<T: Component>(&mut self) -> Option<T> {
        let pos = self
            .components
            .iter()
            .position(|c| c.component_type() == TypeId::of::<T>())?;
        let removed = self.components.remove(pos);
        removed.into_any().downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// The staged components in order.
    #[must_use]
    pub fn components(&self) -> &[ComponentBox] {
        &self.components
    }

    /// Build under `id` instead of a fresh id.
    pub fn set_id(&mut self, id: u64) -> &mut Self {
        self.id = Some(id);
        self
    }

    /// Build into `pool` instead of the current pool.
    pub fn set_pool(&mut self, pool: PoolId) -> &mut Self {
        self.pool = Some(pool);
        self
    }

    /// Give the entity `scope`. Overrides any scope staged in its entity
    /// info.
    pub fn set_scope(&mut self, scope: EntityScope) -> &mut Self {
        self.scope = Some(scope);
        self
    }

    /// Whether to send Added and Activated on build.
    pub fn set_send_lifecycle_events(&mut self, send: bool) -> &mut Self {
        self.send_lifecycle_events = send;
        self
    }

    /// Mark the entity as persisted or not in its entity info, adding the
    /// info component if none is staged.
    pub fn set_persistent(&mut self, persistent: bool) -> &mut Self {
        self.update_entity_info(|info| info.persisted = persistent);
        self
    }

    /// Keep the entity relevant to every client regardless of distance.
    pub fn set_always_relevant(&mut self, always_relevant: bool) -> &mut Self {
        self.update_entity_info(|info| info.always_relevant = always_relevant);
        self
    }

    /// Record the entity that owns this one.
    pub fn set_owner(&mut self, owner: EntityRef) -> &mut Self {
        self.update_entity_info(|info| info.owner = owner);
        self
    }

    fn update_entity_info(&mut self, update: impl FnOnce(&mut EntityInfoComponent)) {
        if let Some(info) = self.get_component_mut::<EntityInfoComponent>() {
            update(info);
            return;
        }
        let mut info = EntityInfoComponent::default();
        update(&mut info);
        self.components.push(Box::new(info));
    }

    /// Commit the entity to `manager`.
    ///
    /// Returns [`EntityRef::NULL`] and commits nothing if the requested id is
    /// `0` or already in use.
    pub fn build(mut self, manager: &mut EntityManager) -> EntityRef {
        let Some(id) = manager.claim_id(self.id) else {
            warn!(requested = ?self.id, "entity id is not available, nothing built");
            return EntityRef::NULL;
        };
        let entity = EntityRef(id);
        let explicit_scope = self.scope;
        if let Some(scope) = explicit_scope {
            self.update_entity_info(|info| info.scope = scope);
        }

        let pool = self.pool.unwrap_or_else(|| manager.current_pool());
        let types: Vec<TypeId> = self
            .components
            .iter()
            .map(|c| c.component_type())
            .collect();
        manager.commit(id, pool, self.components);

        if self.send_lifecycle_events {
            manager.dispatch(entity, LifecycleEvent::Added, &types);
            manager.dispatch(entity, LifecycleEvent::Activated, &types);
        }
        // Listeners may have changed the component set.
        let current = manager.iterate_component_types(entity);
        manager.notify_added(entity, &current);

        let scope = explicit_scope.unwrap_or_else(|| manager.scope_of(entity));
        if explicit_scope.is_some() || scope != EntityScope::Chunk {
            manager.move_to_pool(entity, manager.pool_for_scope(scope));
        }
        debug!(entity = id, components = current.len(), "built entity");
        entity
    }
}
