//! Entity persistence records.
//!
//! An [`EntityRecord`] holds an entity id and its persisted components, each
//! encoded with MessagePack and keyed by type URI. Records are what the
//! storage layer writes when an entity is deactivated for storage and what it
//! hands back when the entity is reloaded.

use serde::{Deserialize, Serialize};
use strata_meta::{CodecError, ComponentBox, EntityRef, TypeUri};
use thiserror::Error;
use tracing::{debug, warn};

use crate::builder::EntityBuilder;
use crate::components::EntityInfoComponent;
use crate::manager::EntityManager;

/// Errors raised while storing or restoring entities.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The entity is not loaded in any pool.
    #[error("entity {0} is not loaded")]
    NotActive(EntityRef),

    /// The entity's info marks it as not persisted.
    #[error("entity {0} is not persisted")]
    NotPersisted(EntityRef),

    /// A record cannot be restored over a loaded entity.
    #[error("entity id {0} is already in use")]
    IdInUse(u64),

    /// A component or record failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One stored component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    /// Registered type URI of the component.
    pub uri: TypeUri,
    /// MessagePack encoding of the component.
    pub data: Vec<u8>,
}

/// One stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Id the entity is restored under.
    pub id: u64,
    /// Persisted components, in the entity's component order.
    pub components: Vec<ComponentRecord>,
}

impl EntityRecord {
    /// Encode the record as MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Codec`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        Ok(rmp_serde::to_vec_named(self).map_err(CodecError::from)?)
    }

    /// Decode a record produced by [`EntityRecord::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Codec`] if `bytes` is not a valid record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistError> {
        Ok(rmp_serde::from_slice(bytes).map_err(CodecError::from)?)
    }
}

impl EntityManager {
    /// Encode the persisted components of `entity`.
    ///
    /// Components whose type is not registered or not persisted are left
    /// out. Fails if the entity is not loaded or its entity info marks it as
    /// not persisted.
    pub fn persist(&self, entity: EntityRef) -> Result<EntityRecord, PersistError> {
        if !self.is_active(entity) {
            return Err(PersistError::NotActive(entity));
        }
        if self
            .get_component::<EntityInfoComponent>(entity)
            .is_some_and(|info| !info.persisted)
        {
            return Err(PersistError::NotPersisted(entity));
        }
        let mut components = Vec::new();
        for component in self.components(entity) {
            let Some(metadata) = self.library().metadata_of(&**component) else {
                warn!(
                    entity = entity.id(),
                    component = component.component_type_name(),
                    "component type is not registered, not persisted"
                );
                continue;
            };
            if !metadata.is_persisted() {
                continue;
            }
            components.push(ComponentRecord {
                uri: metadata.uri().clone(),
                data: metadata.serialize(&**component)?,
            });
        }
        Ok(EntityRecord {
            id: entity.id(),
            components,
        })
    }

    /// Persist `entity` and then deactivate it for storage.
    pub fn store(&mut self, entity: EntityRef) -> Result<EntityRecord, PersistError> {
        let record = self.persist(entity)?;
        self.deactivate_for_storage(entity);
        Ok(record)
    }

    /// Recreate an entity from `record` under its recorded id.
    ///
    /// No lifecycle events are sent. Components of unknown types are skipped
    /// with a warning. Nothing is committed if any component fails to decode.
    pub fn restore(&mut self, record: &EntityRecord) -> Result<EntityRef, PersistError> {
        if self.is_active(EntityRef(record.id)) || record.id == 0 {
            return Err(PersistError::IdInUse(record.id));
        }
        let mut components: Vec<ComponentBox> = Vec::with_capacity(record.components.len());
        for stored in &record.components {
            let Some(metadata) = self.library().metadata_by_uri(&stored.uri) else {
                warn!(entity = record.id, uri = %stored.uri, "unknown component type, skipped");
                continue;
            };
            components.push(metadata.deserialize(&stored.data)?);
        }

        let mut builder = EntityBuilder::from_components(components);
        builder.set_id(record.id).set_send_lifecycle_events(false);
        let entity = builder.build(self);
        if !entity.is_valid() {
            return Err(PersistError::IdInUse(record.id));
        }
        debug!(entity = record.id, "restored entity");
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::EntityScope;
    use crate::manager::tests::{NameComponent, PositionComponent, position, test_manager};
    use crate::pool::PoolId;

    #[test]
    fn test_store_and_restore() {
        let mut manager = test_manager();
        let entity = manager.create(vec![
            position(1.0, 2.0, 3.0),
            Box::new(NameComponent { name: "crate".into() }),
        ]);
        let record = manager.store(entity).unwrap();
        assert!(!manager.is_active(entity));
        assert_eq!(record.components.len(), 2);

        let bytes = record.to_bytes().unwrap();
        let decoded = EntityRecord::from_bytes(&bytes).unwrap();
        let restored = manager.restore(&decoded).unwrap();
        assert_eq!(restored, entity);
        assert_eq!(
            manager.get_component::<PositionComponent>(restored),
            Some(&PositionComponent { x: 1.0, y: 2.0, z: 3.0 })
        );
        assert_eq!(
            manager.get_component::<NameComponent>(restored).unwrap().name,
            "crate"
        );
    }

    #[test]
    fn test_restore_keeps_scope() {
        let mut manager = test_manager();
        let entity = manager.create(vec![Box::new(EntityInfoComponent {
            scope: EntityScope::Global,
            ..EntityInfoComponent::default()
        })]);
        let record = manager.store(entity).unwrap();
        let restored = manager.restore(&record).unwrap();
        assert_eq!(manager.pool_of(restored), Some(PoolId::GLOBAL));
    }

    #[test]
    fn test_unpersisted_entity_is_rejected() {
        let mut manager = test_manager();
        let entity = manager.create(vec![Box::new(EntityInfoComponent {
            persisted: false,
            ..EntityInfoComponent::default()
        })]);
        assert!(matches!(
            manager.persist(entity),
            Err(PersistError::NotPersisted(e)) if e == entity
        ));
        assert!(matches!(
            manager.persist(EntityRef(77)),
            Err(PersistError::NotActive(_))
        ));
    }

    #[test]
    fn test_restore_into_loaded_id_fails() {
        let mut manager = test_manager();
        let entity = manager.create(vec![position(0.0, 0.0, 0.0)]);
        let record = manager.persist(entity).unwrap();
        assert!(matches!(
            manager.restore(&record),
            Err(PersistError::IdInUse(id)) if id == entity.id()
        ));
    }

    #[test]
    fn test_unknown_component_is_skipped() {
        let mut manager = test_manager();
        let record = EntityRecord {
            id: 40,
            components: vec![ComponentRecord {
                uri: TypeUri::new("mods", "Unknown"),
                data: vec![],
            }],
        };
        let entity = manager.restore(&record).unwrap();
        assert_eq!(entity, EntityRef(40));
        assert!(manager.components(entity).is_empty());
    }

    #[test]
    fn test_corrupt_component_commits_nothing() {
        let mut manager = test_manager();
        let record = EntityRecord {
            id: 41,
            components: vec![ComponentRecord {
                uri: TypeUri::new("test", "Position"),
                data: vec![0xc1],
            }],
        };
        assert!(matches!(manager.restore(&record), Err(PersistError::Codec(_))));
        assert!(!manager.is_active(EntityRef(41)));
    }
}
