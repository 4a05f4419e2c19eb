//! The entity manager.
//!
//! The [`EntityManager`] owns every pool, hands out entity ids, and is the
//! only way to mutate components. It is the single source of truth for
//! entity state on the simulation thread.
//!
//! ## Pools
//!
//! There is always a global pool and a sector pool. World pools are added
//! with [`EntityManager::create_world_pool`]; once a current world is set,
//! new entities go there instead of the global pool. Queries see the global
//! pool, the current world pool, and the sector pool.
//!
//! ## Queries
//!
//! Query methods return owned `Vec`s built from a consistent view of the
//! pools. Every mutation takes `&mut self`, so no query can observe an entity
//! halfway through a pool move. Share the manager across threads with
//! [`SharedEntityManager`](crate::SharedEntityManager).

use std::any::TypeId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};

use dashmap::DashMap;
use glam::{Quat, Vec3};
use strata_meta::{
    AnyComponent, Component, ComponentBox, ComponentLibrary, EntityAllocator, EntityRef,
};
use tracing::{debug, error, info, trace, warn};

use crate::builder::EntityBuilder;
use crate::components::{
    EntityInfoComponent, EntityScope, LocationComponent, SectorSimulationComponent,
};
use crate::lifecycle::{
    EntityChangeSubscriber, EntityDestroySubscriber, LifecycleEvent, LifecycleListener,
};
use crate::pool::{EntityPool, PoolId, PoolKind};
use crate::prefab::PrefabManager;
use crate::table::ComponentTable;

/// Owns every entity pool and mediates all component access.
pub struct EntityManager {
    /// Entity id allocator.
    allocator: EntityAllocator,
    /// Ids of entities currently loaded in some pool.
    loaded: HashSet<u64>,
    /// All pools, indexed by `PoolId`.
    pools: Vec<EntityPool>,
    /// Maps each loaded entity to the pool it lives in.
    pool_map: DashMap<u64, PoolId>,
    /// World pools by world name.
    world_pools: HashMap<String, PoolId>,
    /// The world new entities are created in.
    current_world: Option<PoolId>,
    library: ComponentLibrary,
    prefabs: PrefabManager,
    listeners: Vec<Box<dyn LifecycleListener>>,
    /// Events raised by listeners while a dispatch is running.
    pending: VecDeque<(EntityRef, LifecycleEvent, Vec<TypeId>)>,
    dispatching: bool,
    change_subscribers: Vec<Box<dyn EntityChangeSubscriber>>,
    destroy_subscribers: Vec<Box<dyn EntityDestroySubscriber>>,
}

impl EntityManager {
    /// Create a manager over a frozen component library.
    ///
    /// The library should contain the engine components (see
    /// [`register_engine_components`](crate::register_engine_components)).
    #[must_use]
    pub fn new(library: ComponentLibrary, prefabs: PrefabManager) -> Self {
        if library.metadata::<EntityInfoComponent>().is_none() {
            warn!("engine components are not registered; prefab and scope data cannot be copied");
        }
        Self {
            allocator: EntityAllocator::new(),
            loaded: HashSet::new(),
            pools: vec![
                EntityPool::new(PoolId::GLOBAL, PoolKind::Global),
                EntityPool::new(PoolId::SECTOR, PoolKind::Sector),
            ],
            pool_map: DashMap::new(),
            world_pools: HashMap::new(),
            current_world: None,
            library,
            prefabs,
            listeners: Vec::new(),
            pending: VecDeque::new(),
            dispatching: false,
            change_subscribers: Vec::new(),
            destroy_subscribers: Vec::new(),
        }
    }

    /// The component library.
    #[must_use]
    pub fn library(&self) -> &ComponentLibrary {
        &self.library
    }

    /// The prefab registry.
    #[must_use]
    pub fn prefabs(&self) -> &PrefabManager {
        &self.prefabs
    }

    /// Mutable access to the prefab registry.
    pub fn prefabs_mut(&mut self) -> &mut PrefabManager {
        &mut self.prefabs
    }

    // ---- pools ---------------------------------------------------------

    /// Create the pool for world `name`. Returns the existing pool if there
    /// is one.
    pub fn create_world_pool(&mut self, name: &str) -> PoolId {
        if let Some(&id) = self.world_pools.get(name) {
            return id;
        }
        let id = PoolId(self.pools.len() as u32);
        self.pools
            .push(EntityPool::new(id, PoolKind::World(name.to_string())));
        self.world_pools.insert(name.to_string(), id);
        info!(world = name, pool = %id, "created world pool");
        id
    }

    /// Make `name` the current world. Returns `false` if it has no pool.
    pub fn set_current_world(&mut self, name: &str) -> bool {
        match self.world_pools.get(name) {
            Some(&id) => {
                self.current_world = Some(id);
                debug!(world = name, "current world changed");
                true
            }
            None => {
                warn!(world = name, "no pool for world");
                false
            }
        }
    }

    /// The pool of world `name`.
    #[must_use]
    pub fn world_pool(&self, name: &str) -> Option<PoolId> {
        self.world_pools.get(name).copied()
    }

    /// The pool new entities go to: the current world's, or global.
    #[must_use]
    pub fn current_pool(&self) -> PoolId {
        self.current_world.unwrap_or(PoolId::GLOBAL)
    }

    /// The pool an entity in `scope` belongs in.
    #[must_use]
    pub fn pool_for_scope(&self, scope: EntityScope) -> PoolId {
        match scope {
            EntityScope::Global => PoolId::GLOBAL,
            EntityScope::Sector => PoolId::SECTOR,
            EntityScope::Chunk => self.current_pool(),
        }
    }

    /// Look up a pool.
    #[must_use]
    pub fn pool(&self, id: PoolId) -> Option<&EntityPool> {
        self.pools.get(id.0 as usize)
    }

    /// Every pool, indexed by id.
    #[must_use]
    pub fn pools(&self) -> &[EntityPool] {
        &self.pools
    }

    /// The pool `entity` lives in.
    #[must_use]
    pub fn pool_of(&self, entity: EntityRef) -> Option<PoolId> {
        self.pool_map.get(&entity.id()).map(|pool| *pool)
    }

    /// Number of entities per pool.
    #[must_use]
    pub fn pool_counts(&self) -> Vec<(PoolId, usize)> {
        self.pools
            .iter()
            .map(|p| (p.id(), p.active_entity_count()))
            .collect()
    }

    /// Move `entity` and its components to `target`.
    ///
    /// Returns `true` if the entity is in `target` afterwards, `false` if it
    /// is not in any pool, `target` does not exist, or `target` already
    /// holds a different entity under the same id.
    pub fn move_to_pool(&mut self, entity: EntityRef, target: PoolId) -> bool {
        let id = entity.id();
        let Some(current) = self.pool_of(entity) else {
            return false;
        };
        if current == target {
            return true;
        }
        if self.pool(target).is_none_or(|pool| pool.contains(id)) {
            warn!(entity = id, pool = %target, "cannot move entity into pool");
            return false;
        }
        let Some(components) = self
            .pool_mut(current)
            .and_then(|pool| pool.table_mut().remove_entity(id))
        else {
            return false;
        };
        if let Some(pool) = self.pool_mut(target) {
            pool.table_mut().insert_row(id, components);
        }
        self.pool_map.insert(id, target);
        trace!(entity = id, from = %current, to = %target, "moved entity");
        true
    }

    /// Place a loaded entity in `pool`.
    ///
    /// An entity already in a pool is moved as by
    /// [`EntityManager::move_to_pool`].
    pub fn assign_to_pool(&mut self, entity: EntityRef, pool: PoolId) -> bool {
        if self.pool_of(entity).is_some() {
            return self.move_to_pool(entity, pool);
        }
        if !self.is_active(entity) {
            return false;
        }
        let Some(target) = self.pool_mut(pool) else {
            return false;
        };
        target.table_mut().insert_entity(entity.id());
        self.pool_map.insert(entity.id(), pool);
        true
    }

    // ---- creation ------------------------------------------------------

    /// A fresh builder.
    #[must_use]
    pub fn new_builder(&self) -> EntityBuilder {
        EntityBuilder::new()
    }

    /// A builder pre-filled from prefab `name`.
    ///
    /// An unknown prefab is logged and yields an empty builder.
    #[must_use]
    pub fn new_builder_from_prefab(&self, name: &str) -> EntityBuilder {
        let mut builder = EntityBuilder::new();
        if !builder.add_prefab(self, name) {
            warn!(prefab = name, "unable to instantiate unknown prefab");
        }
        builder
    }

    /// Create an entity from `components` in the current pool.
    pub fn create(&mut self, components: Vec<ComponentBox>) -> EntityRef {
        EntityBuilder::from_components(components).build(self)
    }

    /// Create an entity without sending lifecycle events, e.g. when loading.
    pub fn create_without_lifecycle_events(&mut self, components: Vec<ComponentBox>) -> EntityRef {
        let mut builder = EntityBuilder::from_components(components);
        builder.set_send_lifecycle_events(false);
        builder.build(self)
    }

    /// Create an entity from prefab `name`.
    ///
    /// An unknown prefab is logged and yields a valid entity with no
    /// components.
    pub fn create_from_prefab(&mut self, name: &str) -> EntityRef {
        self.new_builder_from_prefab(name).build(self)
    }

    /// Create an entity from prefab `name` without lifecycle events.
    pub fn create_from_prefab_without_lifecycle_events(&mut self, name: &str) -> EntityRef {
        let mut builder = self.new_builder_from_prefab(name);
        builder.set_send_lifecycle_events(false);
        builder.build(self)
    }

    /// Create an entity from prefab `name` placed at `position` with
    /// `rotation`.
    pub fn create_at(&mut self, prefab: &str, position: Vec3, rotation: Quat) -> EntityRef {
        let mut builder = self.new_builder_from_prefab(prefab);
        match builder.get_component_mut::<LocationComponent>() {
            Some(location) => {
                location.position = position;
                location.rotation = rotation;
            }
            None => {
                builder.add_component(LocationComponent { position, rotation });
            }
        }
        builder.build(self)
    }

    /// Create a sector entity with the same delta bound whether or not its
    /// region is loaded.
    pub fn create_sector_entity(&mut self, max_delta: u64) -> EntityRef {
        self.create_sector_entity_with(max_delta, max_delta)
    }

    /// Create a sector entity with separate delta bounds for unloaded and
    /// loaded regions.
    pub fn create_sector_entity_with(
        &mut self,
        unloaded_max_delta: u64,
        loaded_max_delta: u64,
    ) -> EntityRef {
        let mut builder = EntityBuilder::new();
        builder
            .add_component(SectorSimulationComponent {
                unloaded_max_delta,
                loaded_max_delta,
            })
            .set_pool(PoolId::SECTOR)
            .set_scope(EntityScope::Sector);
        builder.build(self)
    }

    /// Create an entity under a caller-chosen id.
    ///
    /// Returns [`EntityRef::NULL`] if `id` is `0` or already in use.
    pub fn create_entity_with_id(&mut self, id: u64, components: Vec<ComponentBox>) -> EntityRef {
        let mut builder = EntityBuilder::from_components(components);
        builder.set_id(id);
        builder.build(self)
    }

    // ---- queries -------------------------------------------------------

    fn visible_pools(&self) -> Vec<&EntityPool> {
        let mut ids = vec![PoolId::GLOBAL];
        if let Some(world) = self.current_world {
            ids.push(world);
        }
        ids.push(PoolId::SECTOR);
        ids.into_iter().filter_map(|id| self.pool(id)).collect()
    }

    /// Entities having every component type in `types`.
    #[must_use]
    pub fn entities_with(&self, types: &[TypeId]) -> Vec<EntityRef> {
        self.visible_pools()
            .into_iter()
            .flat_map(|pool| pool.table().entities_with(types))
            .map(EntityRef)
            .collect()
    }

    /// Number of entities having every component type in `types`.
    #[must_use]
    pub fn count_of_entities_with(&self, types: &[TypeId]) -> usize {
        self.visible_pools()
            .into_iter()
            .map(|pool| pool.table().entities_with(types).len())
            .sum()
    }

    /// Number of entities in the visible pools.
    #[must_use]
    pub fn active_entity_count(&self) -> usize {
        self.visible_pools()
            .into_iter()
            .map(EntityPool::active_entity_count)
            .sum()
    }

    /// Every entity in the visible pools.
    #[must_use]
    pub fn all_entities(&self) -> Vec<EntityRef> {
        self.entities_with(&[])
    }

    /// Every `(entity, component)` pair of type `T` in the visible pools.
    #[must_use]
    pub fn list_components<T: Component>(&self) -> Vec<(EntityRef, &T)> {
        self.visible_pools()
            .into_iter()
            .flat_map(|pool| pool.table().iter_type::<T>())
            .map(|(id, component)| (EntityRef(id), component))
            .collect()
    }

    // ---- component access ---------------------------------------------

    fn table_of(&self, entity: EntityRef) -> Option<&ComponentTable> {
        let pool = self.pool_of(entity)?;
        self.pool(pool).map(EntityPool::table)
    }

    fn table_of_mut(&mut self, entity: EntityRef) -> Option<&mut ComponentTable> {
        let pool = self.pool_of(entity)?;
        self.pool_mut(pool).map(EntityPool::table_mut)
    }

    fn pool_mut(&mut self, id: PoolId) -> Option<&mut EntityPool> {
        self.pools.get_mut(id.0 as usize)
    }

    /// Borrow a component.
    #[must_use]
    pub fn get_component<T: Component>(&self, entity: EntityRef) -> Option<&T> {
        self.table_of(entity)?.get::<T>(entity.id())
    }

    /// Mutably borrow a component. No notifications are sent; call
    /// [`EntityManager::save_component`] to publish a change.
    pub fn get_component_mut<T: Component>(&mut self, entity: EntityRef) -> Option<&mut T> {
        self.table_of_mut(entity)?.get_mut::<T>(entity.id())
    }

    /// Borrow a component by type.
    #[must_use]
    pub fn get_component_dyn(&self, entity: EntityRef, ty: TypeId) -> Option<&dyn AnyComponent> {
        self.table_of(entity)?.get_dyn(entity.id(), ty)
    }

    /// Returns `true` if `entity` has a `T`.
    #[must_use]
    pub fn has_component<T: Component>(&self, entity: EntityRef) -> bool {
        self.has_component_type(entity, TypeId::of::<T>())
    }

    /// Returns `true` if `entity` has a component of type `ty`.
    #[must_use]
    pub fn has_component_type(&self, entity: EntityRef, ty: TypeId) -> bool {
        self.table_of(entity)
            .is_some_and(|table| table.has(entity.id(), ty))
    }

    /// The components of `entity` in order.
    #[must_use]
    pub fn components(&self, entity: EntityRef) -> &[ComponentBox] {
        self.table_of(entity)
            .map(|table| table.components(entity.id()))
            .unwrap_or(&[])
    }

    /// The component types of `entity` in order.
    #[must_use]
    pub fn iterate_component_types(&self, entity: EntityRef) -> Vec<TypeId> {
        self.table_of(entity)
            .map(|table| table.component_types(entity.id()))
            .unwrap_or_default()
    }

    /// Add `component` to `entity`, replacing any component of the same type.
    ///
    /// Sends Added and Activated, or Changed when replacing. Returns `false`
    /// if the entity is not loaded.
    pub fn add_component<T: Component>(&mut self, entity: EntityRef, component: T) -> bool {
        self.add_boxed_component(entity, Box::new(component))
    }

    /// Add a boxed component. See [`EntityManager::add_component`].
    pub fn add_boxed_component(&mut self, entity: EntityRef, component: ComponentBox) -> bool {
        let ty = component.component_type();
        let type_name = component.component_type_name();
        let Some(table) = self.table_of_mut(entity) else {
            warn!(
                entity = entity.id(),
                component = type_name,
                "cannot add component to unloaded entity"
            );
            return false;
        };
        let replaced = table.put(entity.id(), component).is_some();
        if replaced {
            error!(
                entity = entity.id(),
                component = type_name,
                "added a component over an existing one"
            );
            self.notify_changed(entity, ty);
            self.dispatch(entity, LifecycleEvent::Changed, &[ty]);
        } else {
            self.notify_added(entity, &[ty]);
            self.dispatch(entity, LifecycleEvent::Added, &[ty]);
            self.dispatch(entity, LifecycleEvent::Activated, &[ty]);
        }
        true
    }

    /// Store new values for a component of `entity`.
    ///
    /// Sends Changed. Saving a component the entity did not have is logged
    /// and treated as an add.
    pub fn save_component<T: Component>(&mut self, entity: EntityRef, component: T) -> bool {
        let ty = TypeId::of::<T>();
        let Some(table) = self.table_of_mut(entity) else {
            warn!(
                entity = entity.id(),
                component = std::any::type_name::<T>(),
                "cannot save component of unloaded entity"
            );
            return false;
        };
        let existed = table.put(entity.id(), Box::new(component)).is_some();
        if existed {
            self.dispatch(entity, LifecycleEvent::Changed, &[ty]);
            self.notify_changed(entity, ty);
        } else {
            error!(
                entity = entity.id(),
                component = std::any::type_name::<T>(),
                "saved a component the entity did not have"
            );
            self.dispatch(entity, LifecycleEvent::Added, &[ty]);
            self.dispatch(entity, LifecycleEvent::Activated, &[ty]);
            self.notify_added(entity, &[ty]);
        }
        true
    }

    /// Remove a `T` from `entity` and return it.
    ///
    /// Sends BeforeDeactivate then BeforeRemove while the component is still
    /// attached.
    pub fn remove_component<T: Component>(&mut self, entity: EntityRef) -> Option<T> {
        let removed = self.remove_component_type(entity, TypeId::of::<T>())?;
        removed.into_any().downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Remove the component of type `ty` from `entity` and return it.
    pub fn remove_component_type(&mut self, entity: EntityRef, ty: TypeId) -> Option<ComponentBox> {
        if !self.has_component_type(entity, ty) {
            return None;
        }
        self.dispatch(entity, LifecycleEvent::BeforeDeactivate, &[ty]);
        self.dispatch(entity, LifecycleEvent::BeforeRemove, &[ty]);
        self.notify_removed(entity, &[ty]);
        self.table_of_mut(entity)?.remove_component(entity.id(), ty)
    }

    /// The scope recorded on `entity`, or [`EntityScope::Chunk`].
    #[must_use]
    pub fn scope_of(&self, entity: EntityRef) -> EntityScope {
        self.get_component::<EntityInfoComponent>(entity)
            .map_or(EntityScope::Chunk, |info| info.scope)
    }

    /// Change the scope of `entity` and move it to the matching pool.
    ///
    /// Records the scope in the entity's [`EntityInfoComponent`], adding one
    /// if needed.
    pub fn set_scope(&mut self, entity: EntityRef, scope: EntityScope) -> bool {
        if !self.is_active(entity) {
            return false;
        }
        match self.get_component::<EntityInfoComponent>(entity) {
            Some(info) if info.scope == scope => {}
            Some(info) => {
                let updated = EntityInfoComponent {
                    scope,
                    ..info.clone()
                };
                self.save_component(entity, updated);
            }
            None => {
                self.add_component(
                    entity,
                    EntityInfoComponent {
                        scope,
                        ..EntityInfoComponent::default()
                    },
                );
            }
        }
        self.move_to_pool(entity, self.pool_for_scope(scope))
    }

    // ---- lifecycle -----------------------------------------------------

    /// Returns `true` if `entity` was ever created by this manager.
    #[must_use]
    pub fn exists(&self, entity: EntityRef) -> bool {
        self.allocator.has_issued(entity.id())
    }

    /// Returns `true` if `entity` is currently loaded.
    #[must_use]
    pub fn is_active(&self, entity: EntityRef) -> bool {
        self.loaded.contains(&entity.id())
    }

    /// Destroy `entity`, sending BeforeDeactivate and BeforeRemove for every
    /// component first.
    pub fn destroy(&mut self, entity: EntityRef) {
        if !self.is_active(entity) {
            return;
        }
        let types = self.iterate_component_types(entity);
        self.dispatch(entity, LifecycleEvent::BeforeDeactivate, &types);
        self.dispatch(entity, LifecycleEvent::BeforeRemove, &types);
        self.finish_destroy(entity);
    }

    /// Destroy `entity` without lifecycle events. Subscribers are still
    /// notified.
    pub fn destroy_without_events(&mut self, entity: EntityRef) {
        if self.is_active(entity) {
            self.finish_destroy(entity);
        }
    }

    fn finish_destroy(&mut self, entity: EntityRef) {
        let types = self.iterate_component_types(entity);
        self.notify_removed(entity, &types);
        for subscriber in &mut self.destroy_subscribers {
            subscriber.on_entity_destroyed(entity);
        }
        self.unload(entity);
        debug!(entity = entity.id(), "destroyed entity");
    }

    /// Unload `entity` so it can be stored. It keeps existing but is no
    /// longer active.
    ///
    /// Returns the components it held, or `None` if it was not loaded.
    pub fn deactivate_for_storage(&mut self, entity: EntityRef) -> Option<Vec<ComponentBox>> {
        if !self.is_active(entity) {
            return None;
        }
        let types = self.iterate_component_types(entity);
        self.dispatch(entity, LifecycleEvent::BeforeDeactivate, &types);
        let types = self.iterate_component_types(entity);
        for subscriber in &mut self.change_subscribers {
            subscriber.on_before_deactivation(entity, &types);
        }
        let components = self.unload(entity);
        debug!(entity = entity.id(), "deactivated entity for storage");
        components
    }

    fn unload(&mut self, entity: EntityRef) -> Option<Vec<ComponentBox>> {
        let id = entity.id();
        self.loaded.remove(&id);
        let (_, pool) = self.pool_map.remove(&id)?;
        self.pool_mut(pool)?.table_mut().remove_entity(id)
    }

    /// Drop every entity and reset id allocation. Pools and subscribers are
    /// kept.
    pub fn clear(&mut self) {
        for pool in &mut self.pools {
            pool.table_mut().clear();
        }
        self.pool_map.clear();
        self.loaded.clear();
        self.allocator.reset();
        info!("entity manager cleared");
    }

    /// The id the next created entity receives.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.allocator.next_id()
    }

    /// Raise the next id, e.g. after loading a save. Never lowers it.
    pub fn set_next_id(&mut self, id: u64) {
        self.allocator.set_next_id(id);
    }

    // ---- observers -----------------------------------------------------

    /// Register a passive observer of component changes.
    pub fn subscribe_for_changes(&mut self, subscriber: Box<dyn EntityChangeSubscriber>) {
        self.change_subscribers.push(subscriber);
    }

    /// Register a passive observer of entity destruction.
    pub fn subscribe_for_destruction(&mut self, subscriber: Box<dyn EntityDestroySubscriber>) {
        self.destroy_subscribers.push(subscriber);
    }

    /// Register a lifecycle listener.
    pub fn register_listener(&mut self, listener: Box<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    // ---- crate-internal plumbing for the builder -----------------------

    /// Reserve an id for a new entity: `requested` if given and free, else a
    /// fresh one.
    pub(crate) fn claim_id(&mut self, requested: Option<u64>) -> Option<u64> {
        match requested {
            None => {
                let id = self.allocator.allocate().id();
                self.loaded.insert(id);
                Some(id)
            }
            Some(0) => None,
            Some(id) if self.loaded.contains(&id) || self.pool_map.contains_key(&id) => None,
            Some(id) => {
                self.allocator.reserve(id);
                self.loaded.insert(id);
                Some(id)
            }
        }
    }

    /// Write a new entity's components into `pool`.
    pub(crate) fn commit(&mut self, id: u64, pool: PoolId, components: Vec<ComponentBox>) {
        let pool = if self.pool(pool).is_some() {
            pool
        } else {
            warn!(entity = id, pool = %pool, "unknown pool, using global");
            PoolId::GLOBAL
        };
        if let Some(target) = self.pool_mut(pool) {
            target.table_mut().insert_row(id, components);
        }
        self.pool_map.insert(id, pool);
    }

    /// Send `event` to every listener, once per type in `components`.
    ///
    /// Events raised by a listener (for example by adding a component) are
    /// queued and delivered, in the order raised, once the current event has
    /// reached every listener. By then the mutation that raised them has
    /// completed, so a destroyed entity's components are already gone when
    /// its BeforeRemove arrives. Listeners registered during dispatch see the
    /// queued events that follow. If a listener panics, the listener list is
    /// restored before the panic continues.
    pub(crate) fn dispatch(
        &mut self,
        entity: EntityRef,
        event: LifecycleEvent,
        components: &[TypeId],
    ) {
        if components.is_empty() {
            return;
        }
        if self.dispatching {
            trace!(
                entity = entity.id(),
                ?event,
                "queueing lifecycle event raised during dispatch"
            );
            self.pending.push_back((entity, event, components.to_vec()));
            return;
        }
        if self.listeners.is_empty() {
            return;
        }

        self.dispatching = true;
        let mut listeners = mem::take(&mut self.listeners);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.deliver(&mut listeners, entity, event, components);
            while let Some((entity, event, components)) = self.pending.pop_front() {
                listeners.append(&mut self.listeners);
                self.deliver(&mut listeners, entity, event, &components);
            }
        }));
        listeners.append(&mut self.listeners);
        self.listeners = listeners;
        self.dispatching = false;

        if let Err(payload) = outcome {
            error!(entity = entity.id(), ?event, "lifecycle listener panicked");
            self.pending.clear();
            panic::resume_unwind(payload);
        }
    }

    fn deliver(
        &mut self,
        listeners: &mut [Box<dyn LifecycleListener>],
        entity: EntityRef,
        event: LifecycleEvent,
        components: &[TypeId],
    ) {
        trace!(
            entity = entity.id(),
            ?event,
            count = components.len(),
            "dispatching lifecycle event"
        );
        for &component in components {
            for listener in listeners.iter_mut() {
                listener.on_event(self, entity, event, component);
            }
        }
    }

    pub(crate) fn notify_added(&mut self, entity: EntityRef, components: &[TypeId]) {
        for &component in components {
            for subscriber in &mut self.change_subscribers {
                subscriber.on_component_added(entity, component);
            }
        }
    }

    fn notify_changed(&mut self, entity: EntityRef, component: TypeId) {
        for subscriber in &mut self.change_subscribers {
            subscriber.on_component_changed(entity, component);
        }
    }

    fn notify_removed(&mut self, entity: EntityRef, components: &[TypeId]) {
        for &component in components {
            for subscriber in &mut self.change_subscribers {
                subscriber.on_component_removed(entity, component);
            }
        }
    }
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("next_id", &self.allocator.next_id())
            .field("loaded", &self.loaded.len())
            .field("pool_counts", &self.pool_counts())
            .field("current_world", &self.current_world)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use serde::{Deserialize, Serialize};
    use strata_meta::{ComponentDeclaration, ComponentLibraryBuilder, TypeUri};

    use super::*;
    use crate::components::register_engine_components;
    use crate::prefab::Prefab;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct PositionComponent {
        pub x: f32,
        pub y: f32,
        pub z: f32,
    }

    impl Component for PositionComponent {
        fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
            decl.default_constructor()
                .field("x", |p: &Self| &p.x, |p: &mut Self| &mut p.x)
                .field("y", |p: &Self| &p.y, |p: &mut Self| &mut p.y)
                .field("z", |p: &Self| &p.z, |p: &mut Self| &mut p.z)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct NameComponent {
        pub name: String,
    }

    impl Component for NameComponent {
        fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
            decl.default_constructor()
                .field("name", |n: &Self| &n.name, |n: &mut Self| &mut n.name)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct InventoryComponent {
        pub items: Vec<EntityRef>,
    }

    impl Component for InventoryComponent {
        fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
            decl.default_constructor()
                .owned_field("items", |i: &Self| &i.items, |i: &mut Self| &mut i.items)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct FollowComponent {
        pub target: EntityRef,
    }

    impl Component for FollowComponent {
        fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
            decl.default_constructor()
                .field("target", |f: &Self| &f.target, |f: &mut Self| &mut f.target)
        }
    }

    pub(crate) fn test_library() -> ComponentLibrary {
        let mut builder = ComponentLibraryBuilder::new();
        register_engine_components(&mut builder).unwrap();
        builder
            .register::<PositionComponent>(TypeUri::new("test", "Position"))
            .unwrap();
        builder
            .register::<NameComponent>(TypeUri::new("test", "Name"))
            .unwrap();
        builder
            .register::<InventoryComponent>(TypeUri::new("test", "Inventory"))
            .unwrap();
        builder
            .register::<FollowComponent>(TypeUri::new("test", "Follow"))
            .unwrap();
        builder.freeze()
    }

    pub(crate) fn test_manager() -> EntityManager {
        EntityManager::new(test_library(), PrefabManager::new())
    }

    pub(crate) fn position(x: f32, y: f32, z: f32) -> ComponentBox {
        Box::new(PositionComponent { x, y, z })
    }

    /// Records every notification as a string.
    #[derive(Clone, Default)]
    pub(crate) struct Journal(pub Arc<Mutex<Vec<String>>>);

    impl Journal {
        pub(crate) fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }
    }

    pub(crate) struct JournalListener {
        pub journal: Journal,
    }

    impl LifecycleListener for JournalListener {
        fn on_event(
            &mut self,
            manager: &mut EntityManager,
            entity: EntityRef,
            event: LifecycleEvent,
            component: TypeId,
        ) {
            let name = manager
                .library()
                .metadata_for(component)
                .map_or_else(|| "?".to_string(), |m| m.uri().name().to_string());
            self.journal.push(format!("{event:?}:{name}:{}", entity.id()));
        }
    }

    pub(crate) struct JournalSubscriber {
        pub journal: Journal,
    }

    impl EntityChangeSubscriber for JournalSubscriber {
        fn on_component_added(&mut self, entity: EntityRef, _component: TypeId) {
            self.journal.push(format!("added:{}", entity.id()));
        }

        fn on_component_changed(&mut self, entity: EntityRef, _component: TypeId) {
            self.journal.push(format!("changed:{}", entity.id()));
        }

        fn on_component_removed(&mut self, entity: EntityRef, _component: TypeId) {
            self.journal.push(format!("removed:{}", entity.id()));
        }

        fn on_before_deactivation(&mut self, entity: EntityRef, components: &[TypeId]) {
            self.journal
                .push(format!("deactivating:{}:{}", entity.id(), components.len()));
        }
    }

    impl EntityDestroySubscriber for JournalSubscriber {
        fn on_entity_destroyed(&mut self, entity: EntityRef) {
            self.journal.push(format!("destroyed:{}", entity.id()));
        }
    }

    #[test]
    fn test_create_assigns_fresh_ids() {
        let mut manager = test_manager();
        let a = manager.create(vec![position(1.0, 2.0, 3.0)]);
        let b = manager.create(vec![]);
        assert!(a.is_valid() && b.is_valid());
        assert_ne!(a, b);
        assert!(manager.is_active(a));
        assert_eq!(manager.pool_of(a), Some(PoolId::GLOBAL));
        assert_eq!(manager.active_entity_count(), 2);
    }

    #[test]
    fn test_copy_position_entity() {
        let mut manager = test_manager();
        let original = manager.create(vec![position(1.0, 2.0, 3.0)]);
        let copy = manager.copy(original);
        assert!(copy.is_valid());
        assert_ne!(copy, original);
        assert_eq!(
            manager.get_component::<PositionComponent>(copy),
            Some(&PositionComponent { x: 1.0, y: 2.0, z: 3.0 })
        );
    }

    #[test]
    fn test_copy_inventory_duplicates_owned_items() {
        let mut manager = test_manager();
        let sword = manager.create(vec![Box::new(NameComponent {
            name: "sword".into(),
        })]);
        let holder = manager.create(vec![Box::new(InventoryComponent { items: vec![sword] })]);

        let copy = manager.copy(holder);
        assert_ne!(copy, holder);
        let items = manager
            .get_component::<InventoryComponent>(copy)
            .unwrap()
            .items
            .clone();
        assert_eq!(items.len(), 1);
        assert_ne!(items[0], sword);
        assert_eq!(
            manager.get_component::<NameComponent>(items[0]).unwrap().name,
            "sword"
        );
        assert_eq!(
            manager.get_component::<InventoryComponent>(holder).unwrap().items,
            vec![sword]
        );
    }

    #[test]
    fn test_copy_without_ownership_aliases_references() {
        let mut manager = test_manager();
        let target = manager.create(vec![position(0.0, 0.0, 0.0)]);
        let follower = manager.create(vec![Box::new(FollowComponent { target })]);
        let before = manager.active_entity_count();

        let copy = manager.copy(follower);
        assert_eq!(manager.active_entity_count(), before + 1);
        assert_eq!(manager.get_component::<FollowComponent>(copy).unwrap().target, target);
    }

    #[test]
    fn test_copy_breaks_ownership_cycles() {
        let mut manager = test_manager();
        let a = manager.create(vec![]);
        let b = manager.create(vec![Box::new(InventoryComponent { items: vec![a] })]);
        manager.add_component(a, InventoryComponent { items: vec![b] });

        let copy = manager.copy(a);
        let owned = manager.get_component::<InventoryComponent>(copy).unwrap().items[0];
        assert_ne!(owned, b);
        assert_eq!(
            manager.get_component::<InventoryComponent>(owned).unwrap().items,
            vec![EntityRef::NULL]
        );
    }

    #[test]
    fn test_copy_components_returns_owned_copies() {
        let mut manager = test_manager();
        let item = manager.create(vec![Box::new(NameComponent { name: "gem".into() })]);
        let chest = manager.create(vec![
            position(5.0, 0.0, 0.0),
            Box::new(InventoryComponent { items: vec![item] }),
        ]);
        let components = manager.copy_components(chest);
        assert_eq!(components.len(), 2);
        let inventory = components[1].downcast_ref::<InventoryComponent>().unwrap();
        assert_ne!(inventory.items[0], item);
        assert!(manager.is_active(inventory.items[0]));
    }

    #[test]
    fn test_copy_of_missing_entity_is_null() {
        let mut manager = test_manager();
        assert_eq!(manager.copy(EntityRef(99)), EntityRef::NULL);
        assert!(manager.copy_components(EntityRef(99)).is_empty());
    }

    #[test]
    fn test_nonexistent_prefab_yields_valid_entity() {
        let mut manager = test_manager();
        let entity = manager.create_from_prefab("nonexistent");
        assert!(entity.is_valid());
        assert!(manager.is_active(entity));
        assert!(manager.components(entity).is_empty());
    }

    #[test]
    fn test_create_from_prefab() {
        let mut prefabs = PrefabManager::new();
        prefabs.register(Prefab::new("core:marker").with_component(PositionComponent {
            x: 4.0,
            y: 4.0,
            z: 4.0,
        }));
        let mut manager = EntityManager::new(test_library(), prefabs);
        let entity = manager.create_from_prefab("core:marker");
        assert_eq!(manager.get_component::<PositionComponent>(entity).unwrap().x, 4.0);
        let info = manager.get_component::<EntityInfoComponent>(entity).unwrap();
        assert_eq!(info.parent_prefab.as_deref(), Some("core:marker"));
    }

    #[test]
    fn test_create_at_sets_location() {
        let mut manager = test_manager();
        let position = Vec3::new(1.0, 2.0, 3.0);
        let entity = manager.create_at("missing", position, Quat::IDENTITY);
        assert_eq!(
            manager.get_component::<LocationComponent>(entity).unwrap().position,
            position
        );
    }

    #[test]
    fn test_create_sector_entity() {
        let mut manager = test_manager();
        let entity = manager.create_sector_entity_with(100, 10);
        assert_eq!(manager.pool_of(entity), Some(PoolId::SECTOR));
        assert_eq!(manager.scope_of(entity), EntityScope::Sector);
        let sim = manager.get_component::<SectorSimulationComponent>(entity).unwrap();
        assert_eq!((sim.unloaded_max_delta, sim.loaded_max_delta), (100, 10));

        let uniform = manager.create_sector_entity(7);
        let sim = manager.get_component::<SectorSimulationComponent>(uniform).unwrap();
        assert_eq!((sim.unloaded_max_delta, sim.loaded_max_delta), (7, 7));
    }

    #[test]
    fn test_create_entity_with_id() {
        let mut manager = test_manager();
        let entity = manager.create_entity_with_id(50, vec![position(0.0, 0.0, 0.0)]);
        assert_eq!(entity, EntityRef(50));
        assert!(manager.next_id() > 50);
        assert_eq!(manager.create_entity_with_id(50, vec![]), EntityRef::NULL);
        assert_eq!(manager.create_entity_with_id(0, vec![]), EntityRef::NULL);
    }

    #[test]
    fn test_world_pools() {
        let mut manager = test_manager();
        let global = manager.create(vec![]);
        let world = manager.create_world_pool("overworld");
        assert_eq!(manager.create_world_pool("overworld"), world);
        assert!(manager.set_current_world("overworld"));
        assert!(!manager.set_current_world("nether"));

        let local = manager.create(vec![]);
        assert_eq!(manager.pool_of(global), Some(PoolId::GLOBAL));
        assert_eq!(manager.pool_of(local), Some(world));
        assert_eq!(manager.all_entities(), vec![global, local]);
    }

    #[test]
    fn test_move_to_pool() {
        let mut manager = test_manager();
        let world = manager.create_world_pool("overworld");
        manager.set_current_world("overworld");
        let entity = manager.create(vec![position(1.0, 1.0, 1.0)]);

        assert!(manager.move_to_pool(entity, PoolId::GLOBAL));
        assert_eq!(manager.pool_of(entity), Some(PoolId::GLOBAL));
        assert!(manager.has_component::<PositionComponent>(entity));
        assert!(!manager.pool(world).unwrap().contains(entity.id()));
        assert_eq!(manager.all_entities(), vec![entity]);

        assert!(manager.move_to_pool(entity, PoolId::GLOBAL));
        assert!(!manager.move_to_pool(entity, PoolId(42)));
        assert!(!manager.move_to_pool(EntityRef(999), PoolId::GLOBAL));
    }

    #[test]
    fn test_queries() {
        let mut manager = test_manager();
        let a = manager.create(vec![position(0.0, 0.0, 0.0)]);
        let b = manager.create(vec![
            position(1.0, 0.0, 0.0),
            Box::new(NameComponent { name: "b".into() }),
        ]);
        let sector = manager.create_sector_entity(5);

        let positioned = manager.entities_with(&[TypeId::of::<PositionComponent>()]);
        assert_eq!(positioned, vec![a, b]);
        assert_eq!(
            manager.count_of_entities_with(&[
                TypeId::of::<PositionComponent>(),
                TypeId::of::<NameComponent>()
            ]),
            1
        );
        assert_eq!(manager.all_entities(), vec![a, b, sector]);
        let listed = manager.list_components::<PositionComponent>();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].0, b);
    }

    #[test]
    fn test_add_save_remove_component() {
        let mut manager = test_manager();
        let journal = Journal::default();
        manager.register_listener(Box::new(JournalListener {
            journal: journal.clone(),
        }));
        let entity = manager.create(vec![]);

        assert!(manager.add_component(entity, NameComponent { name: "a".into() }));
        assert!(manager.save_component(entity, NameComponent { name: "b".into() }));
        let removed = manager.remove_component::<NameComponent>(entity).unwrap();
        assert_eq!(removed.name, "b");
        assert!(!manager.has_component::<NameComponent>(entity));
        assert!(manager.remove_component::<NameComponent>(entity).is_none());

        let id = entity.id();
        assert_eq!(
            journal.entries(),
            vec![
                format!("Added:Name:{id}"),
                format!("Activated:Name:{id}"),
                format!("Changed:Name:{id}"),
                format!("BeforeDeactivate:Name:{id}"),
                format!("BeforeRemove:Name:{id}"),
            ]
        );
    }

    #[test]
    fn test_add_component_to_unloaded_entity_fails() {
        let mut manager = test_manager();
        assert!(!manager.add_component(EntityRef(3), NameComponent::default()));
    }

    #[test]
    fn test_destroy_notifies_and_unloads() {
        let mut manager = test_manager();
        let journal = Journal::default();
        manager.subscribe_for_changes(Box::new(JournalSubscriber {
            journal: journal.clone(),
        }));
        manager.subscribe_for_destruction(Box::new(JournalSubscriber {
            journal: journal.clone(),
        }));
        let entity = manager.create(vec![position(0.0, 0.0, 0.0)]);
        manager.destroy(entity);

        assert!(!manager.is_active(entity));
        assert!(manager.exists(entity));
        assert_eq!(manager.pool_of(entity), None);
        let id = entity.id();
        assert_eq!(
            journal.entries(),
            vec![format!("added:{id}"), format!("removed:{id}"), format!("destroyed:{id}")]
        );

        manager.destroy(entity);
        assert_eq!(journal.entries().len(), 3);
    }

    #[test]
    fn test_deactivate_for_storage() {
        let mut manager = test_manager();
        let journal = Journal::default();
        manager.subscribe_for_changes(Box::new(JournalSubscriber {
            journal: journal.clone(),
        }));
        let entity = manager.create(vec![position(0.0, 0.0, 0.0)]);
        let stored = manager.deactivate_for_storage(entity).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!manager.is_active(entity));
        assert!(manager.exists(entity));
        assert!(journal.entries().contains(&format!("deactivating:{}:1", entity.id())));
        assert!(manager.deactivate_for_storage(entity).is_none());
    }

    #[test]
    fn test_set_scope_moves_between_pools() {
        let mut manager = test_manager();
        manager.create_world_pool("overworld");
        manager.set_current_world("overworld");
        let entity = manager.create(vec![]);

        assert!(manager.set_scope(entity, EntityScope::Global));
        assert_eq!(manager.pool_of(entity), Some(PoolId::GLOBAL));
        assert_eq!(manager.scope_of(entity), EntityScope::Global);

        assert!(manager.set_scope(entity, EntityScope::Chunk));
        assert_eq!(manager.pool_of(entity), manager.world_pool("overworld"));
    }

    #[test]
    fn test_clear_resets_ids() {
        let mut manager = test_manager();
        manager.create(vec![]);
        manager.create(vec![]);
        manager.clear();
        assert_eq!(manager.active_entity_count(), 0);
        assert_eq!(manager.next_id(), 1);
    }

    #[test]
    fn test_set_next_id_never_rewinds() {
        let mut manager = test_manager();
        manager.set_next_id(100);
        assert_eq!(manager.create(vec![]), EntityRef(100));
        manager.set_next_id(10);
        assert_eq!(manager.next_id(), 101);
    }

    /// Tags every entity that gains a position.
    struct Tagger;

    impl LifecycleListener for Tagger {
        fn on_event(
            &mut self,
            manager: &mut EntityManager,
            entity: EntityRef,
            event: LifecycleEvent,
            component: TypeId,
        ) {
            if event == LifecycleEvent::Activated
                && component == TypeId::of::<PositionComponent>()
            {
                manager.add_component(entity, NameComponent { name: "tagged".into() });
            }
        }
    }

    #[test]
    fn test_listener_can_mutate_during_dispatch() {
        let mut manager = test_manager();
        manager.register_listener(Box::new(Tagger));
        let entity = manager.create(vec![position(0.0, 0.0, 0.0)]);
        assert_eq!(
            manager.get_component::<NameComponent>(entity).unwrap().name,
            "tagged"
        );
    }

    #[test]
    fn test_events_raised_by_listener_reach_every_listener() {
        let mut manager = test_manager();
        let journal = Journal::default();
        manager.register_listener(Box::new(Tagger));
        manager.register_listener(Box::new(JournalListener {
            journal: journal.clone(),
        }));

        let entity = manager.create(vec![position(0.0, 0.0, 0.0)]);
        let id = entity.id();
        assert_eq!(
            journal.entries(),
            vec![
                format!("Added:Position:{id}"),
                format!("Activated:Position:{id}"),
                format!("Added:Name:{id}"),
                format!("Activated:Name:{id}"),
            ]
        );
    }

    #[test]
    fn test_listener_destroying_entity_still_sends_remove_events() {
        struct Reaper;

        impl LifecycleListener for Reaper {
            fn on_event(
                &mut self,
                manager: &mut EntityManager,
                entity: EntityRef,
                event: LifecycleEvent,
                component: TypeId,
            ) {
                if event == LifecycleEvent::Changed && component == TypeId::of::<NameComponent>() {
                    manager.destroy(entity);
                }
            }
        }

        let mut manager = test_manager();
        let journal = Journal::default();
        manager.register_listener(Box::new(Reaper));
        manager.register_listener(Box::new(JournalListener {
            journal: journal.clone(),
        }));
        let entity = manager.create_without_lifecycle_events(vec![Box::new(NameComponent {
            name: "doomed".into(),
        })]);

        assert!(manager.save_component(entity, NameComponent { name: "hit".into() }));
        assert!(!manager.is_active(entity));
        let id = entity.id();
        assert_eq!(
            journal.entries(),
            vec![
                format!("Changed:Name:{id}"),
                format!("BeforeDeactivate:Name:{id}"),
                format!("BeforeRemove:Name:{id}"),
            ]
        );
    }

    #[test]
    fn test_panicking_listener_keeps_listeners_registered() {
        struct Bomb;

        impl LifecycleListener for Bomb {
            fn on_event(
                &mut self,
                _manager: &mut EntityManager,
                _entity: EntityRef,
                _event: LifecycleEvent,
                component: TypeId,
            ) {
                assert_ne!(component, TypeId::of::<FollowComponent>(), "follow rejected");
            }
        }

        let mut manager = test_manager();
        let journal = Journal::default();
        manager.register_listener(Box::new(Bomb));
        manager.register_listener(Box::new(JournalListener {
            journal: journal.clone(),
        }));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.create(vec![Box::new(FollowComponent::default())])
        }));
        assert!(result.is_err());

        let entity = manager.create(vec![position(0.0, 0.0, 0.0)]);
        let id = entity.id();
        assert!(journal.entries().contains(&format!("Activated:Position:{id}")));
    }
}
