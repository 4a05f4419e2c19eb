//! Components the entity runtime itself depends on.
//!
//! These are registered under the `engine` module by
//! [`register_engine_components`] and must be present in any library handed
//! to an [`EntityManager`](crate::EntityManager).

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use strata_meta::{
    Component, ComponentDeclaration, ComponentLibraryBuilder, EntityRef, LibraryError, TypeUri,
};

/// The module engine components are registered under.
pub const ENGINE_MODULE: &str = "engine";

/// Where an entity lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityScope {
    /// Always loaded, in the global pool.
    Global,
    /// Position-addressed, in the sector pool.
    Sector,
    /// Loaded with the chunk it sits in, in the current world pool.
    #[default]
    Chunk,
}

/// Bookkeeping attached to entities built from prefabs or given explicit
/// persistence, relevance, ownership, or scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfoComponent {
    /// Name of the prefab the entity was instantiated from.
    pub parent_prefab: Option<String>,
    /// Whether the entity is written to storage.
    pub persisted: bool,
    /// Whether the entity is relevant to every client regardless of distance.
    pub always_relevant: bool,
    /// Where the entity lives.
    pub scope: EntityScope,
    /// The entity owning this one on the network.
    pub owner: EntityRef,
}

impl Default for EntityInfoComponent {
    fn default() -> Self {
        Self {
            parent_prefab: None,
            persisted: true,
            always_relevant: false,
            scope: EntityScope::Chunk,
            owner: EntityRef::NULL,
        }
    }
}

impl Component for EntityInfoComponent {
    fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
        decl.default_constructor()
            .field(
                "parent_prefab",
                |c: &Self| &c.parent_prefab,
                |c: &mut Self| &mut c.parent_prefab,
            )
            .field("persisted", |c: &Self| &c.persisted, |c: &mut Self| &mut c.persisted)
            .field(
                "always_relevant",
                |c: &Self| &c.always_relevant,
                |c: &mut Self| &mut c.always_relevant,
            )
            .field("scope", |c: &Self| &c.scope, |c: &mut Self| &mut c.scope)
            .field("owner", |c: &Self| &c.owner, |c: &mut Self| &mut c.owner)
    }
}

/// Bounds on how much simulated time may pass between updates of a sector
/// entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorSimulationComponent {
    /// Maximum delta in milliseconds while the entity's region is unloaded.
    pub unloaded_max_delta: u64,
    /// Maximum delta in milliseconds while the entity's region is loaded.
    pub loaded_max_delta: u64,
}

impl Component for SectorSimulationComponent {
    fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
        decl.default_constructor()
            .field(
                "unloaded_max_delta",
                |c: &Self| &c.unloaded_max_delta,
                |c: &mut Self| &mut c.unloaded_max_delta,
            )
            .field(
                "loaded_max_delta",
                |c: &Self| &c.loaded_max_delta,
                |c: &mut Self| &mut c.loaded_max_delta,
            )
    }
}

/// World-space placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationComponent {
    /// World-space position.
    pub position: Vec3,
    /// Rotation as a unit quaternion.
    pub rotation: Quat,
}

impl Default for LocationComponent {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl Component for LocationComponent {
    fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
        decl.default_constructor()
            .field("position", |c: &Self| &c.position, |c: &mut Self| &mut c.position)
            .field("rotation", |c: &Self| &c.rotation, |c: &mut Self| &mut c.rotation)
            .replicate()
    }
}

/// Register every engine component.
///
/// # Errors
///
/// Returns the first registration failure, typically a uri conflict with a
/// component registered earlier under the `engine` module.
pub fn register_engine_components(
    builder: &mut ComponentLibraryBuilder,
) -> Result<(), LibraryError> {
    builder.register::<EntityInfoComponent>(TypeUri::new(ENGINE_MODULE, "EntityInfo"))?;
    builder.register::<SectorSimulationComponent>(TypeUri::new(
        ENGINE_MODULE,
        "SectorSimulation",
    ))?;
    builder.register::<LocationComponent>(TypeUri::new(ENGINE_MODULE, "Location"))?;
    Ok(())
}
