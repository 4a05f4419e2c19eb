//! Lifecycle notifications.
//!
//! Two kinds of observers exist:
//!
//! - [`LifecycleListener`]s receive lifecycle events and get mutable access
//!   to the manager, so they may react by adding, changing, or removing
//!   components.
//! - [`EntityChangeSubscriber`]s and [`EntityDestroySubscriber`]s are passive
//!   observers used by indexes and caches. They see the manager's state only
//!   through the arguments they are given.
//!
//! All dispatch is synchronous and in registration order.

use std::any::TypeId;

use strata_meta::EntityRef;

use crate::manager::EntityManager;

/// A lifecycle event concerning one component of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The component was added to the entity.
    Added,
    /// The component became active, after being added or reloaded.
    Activated,
    /// The component was replaced or saved with new values.
    Changed,
    /// The component is about to be deactivated, for removal or storage.
    BeforeDeactivate,
    /// The component is about to be removed for good.
    BeforeRemove,
}

/// Reacts to lifecycle events with full access to the manager.
pub trait LifecycleListener: Send + Sync {
    /// Called once per component the event concerns.
    fn on_event(
        &mut self,
        manager: &mut EntityManager,
        entity: EntityRef,
        event: LifecycleEvent,
        component: TypeId,
    );
}

/// Observes component membership changes.
#[allow(unused_variables)]
pub trait EntityChangeSubscriber: Send + Sync {
    /// A component was added.
    fn on_component_added(&mut self, entity: EntityRef, component: TypeId) {}

    /// A component was replaced or saved.
    fn on_component_changed(&mut self, entity: EntityRef, component: TypeId) {}

    /// A component was removed.
    fn on_component_removed(&mut self, entity: EntityRef, component: TypeId) {}

    /// The entity is about to be deactivated for storage.
    fn on_before_deactivation(&mut self, entity: EntityRef, components: &[TypeId]) {}
}

/// Observes entity destruction.
pub trait EntityDestroySubscriber: Send + Sync {
    /// The entity has been destroyed.
    fn on_entity_destroyed(&mut self, entity: EntityRef);
}
