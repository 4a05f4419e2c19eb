//! # strata_entity
//!
//! Entity storage and lifecycle for the Strata runtime.
//!
//! This crate provides:
//!
//! - [`EntityManager`]: creates, copies, mutates, and destroys entities
//!   across a global pool, a sector pool, and one pool per world.
//! - [`EntityBuilder`]: stage components, then commit them in one step.
//! - [`Prefab`] / [`PrefabManager`]: named component templates.
//! - Lifecycle listeners and change/destroy subscribers.
//! - [`EntityRecord`]: persisted form of an entity.
//! - [`SharedEntityManager`]: the manager behind a lock for other threads.
//!
//! ## Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use strata_entity::{EntityManager, PrefabManager, register_engine_components};
//! use strata_meta::{Component, ComponentDeclaration, ComponentLibraryBuilder, TypeUri};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Health {
//!     current: u32,
//! }
//!
//! impl Component for Health {
//!     fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
//!         decl.default_constructor()
//!             .field("current", |h: &Health| &h.current, |h: &mut Health| &mut h.current)
//!     }
//! }
//!
//! let mut library = ComponentLibraryBuilder::new();
//! register_engine_components(&mut library).unwrap();
//! library.register::<Health>(TypeUri::new("game", "Health")).unwrap();
//!
//! let mut manager = EntityManager::new(library.freeze(), PrefabManager::new());
//! let player = manager.create(vec![Box::new(Health { current: 20 })]);
//! let clone = manager.copy(player);
//! assert_eq!(manager.get_component::<Health>(clone).unwrap().current, 20);
//! ```

pub mod builder;
pub mod components;
mod duplicate;
pub mod lifecycle;
pub mod manager;
pub mod persist;
pub mod pool;
pub mod prefab;
pub mod shared;
pub mod table;

pub use builder::EntityBuilder;
pub use components::{
    ENGINE_MODULE, EntityInfoComponent, EntityScope, LocationComponent,
    SectorSimulationComponent, register_engine_components,
};
pub use lifecycle::{
    EntityChangeSubscriber, EntityDestroySubscriber, LifecycleEvent, LifecycleListener,
};
pub use manager::EntityManager;
pub use persist::{ComponentRecord, EntityRecord, PersistError};
pub use pool::{EntityPool, PoolId, PoolKind};
pub use prefab::{Prefab, PrefabManager};
pub use shared::SharedEntityManager;
pub use table::ComponentTable;
