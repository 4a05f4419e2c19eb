//! Component and event libraries.
//!
//! A library maps a [`TypeUri`] to immutable metadata and supports reverse
//! lookup by `TypeId` or by instance. It has two phases:
//!
//! 1. A [`LibraryBuilder`] is mutable and owned by whoever loads modules.
//!    Types are registered into it one at a time.
//! 2. [`LibraryBuilder::freeze`] turns it into a [`Library`], which has no
//!    registration methods at all. A frozen library is cheap to clone and
//!    can be read from any number of threads.
//!
//! [`Library::create_copy_using_strategy`] produces a second frozen library
//! that shares every metadata entry with the first but copies one value type
//! differently. Background serialisers use it to get an isolated snapshot
//! without touching the library the simulation reads.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::class::ClassMetadata;
use crate::component::{AnyComponent, Component, ComponentBox, ComponentMetadata};
use crate::copy::{CopyStrategy, CopyStrategyLibrary, OwnedEntityCopier};
use crate::error::{LibraryError, MetadataError};
use crate::event::{Event, EventMetadata};
use crate::uri::TypeUri;

/// Metadata types a library can hold.
pub trait TypeMetadata: Send + Sync + fmt::Debug + 'static {
    /// The class description the metadata was built from.
    fn class(&self) -> &ClassMetadata;
}

impl TypeMetadata for ComponentMetadata {
    fn class(&self) -> &ClassMetadata {
        ComponentMetadata::class(self)
    }
}

impl TypeMetadata for EventMetadata {
    fn class(&self) -> &ClassMetadata {
        EventMetadata::class(self)
    }
}

/// The shared, immutable tables behind a frozen library.
struct Tables<M> {
    entries: Vec<Arc<M>>,
    by_type: HashMap<TypeId, Arc<M>>,
    by_uri: HashMap<TypeUri, Arc<M>>,
}

impl<M> Default for Tables<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_type: HashMap::new(),
            by_uri: HashMap::new(),
        }
    }
}

impl<M> Clone for Tables<M> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            by_type: self.by_type.clone(),
            by_uri: self.by_uri.clone(),
        }
    }
}

/// Mutable registration phase of a library.
pub struct LibraryBuilder<M> {
    tables: Tables<M>,
    strategies: CopyStrategyLibrary,
    replicate_by_default: bool,
}

/// Builder for the component library.
pub type ComponentLibraryBuilder = LibraryBuilder<ComponentMetadata>;

/// Builder for the event library.
pub type EventLibraryBuilder = LibraryBuilder<EventMetadata>;

impl<M: TypeMetadata> LibraryBuilder<M> {
    /// Replicate fields that carry no replication marker.
    #[must_use]
    pub fn with_replicate_by_default(mut self, replicate_by_default: bool) -> Self {
        self.replicate_by_default = replicate_by_default;
        self
    }

    /// Start from a custom copy strategy table.
    #[must_use]
    pub fn with_copy_strategies(mut self, strategies: CopyStrategyLibrary) -> Self {
        self.strategies = strategies;
        self
    }

    /// Reopen a frozen library for further registration.
    ///
    /// The new builder starts with every entry of `library`; the frozen
    /// library itself is unaffected.
    #[must_use]
    pub fn from_library(library: &Library<M>) -> Self {
        Self {
            tables: (*library.tables).clone(),
            strategies: (*library.strategies).clone(),
            replicate_by_default: library.replicate_by_default,
        }
    }

    /// Whether fields without a marker are replicated.
    #[must_use]
    pub fn replicate_by_default(&self) -> bool {
        self.replicate_by_default
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.entries.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.entries.is_empty()
    }

    /// Freeze into an immutable library.
    #[must_use]
    pub fn freeze(self) -> Library<M> {
        debug!(types = self.tables.entries.len(), "library frozen");
        Library {
            tables: Arc::new(self.tables),
            strategies: Arc::new(self.strategies),
            replicate_by_default: self.replicate_by_default,
        }
    }

    /// Look up an existing binding for `uri` and `type_id`.
    ///
    /// Returns `Ok(Some(..))` when the exact binding already exists,
    /// `Ok(None)` when neither is bound, and an error on any conflict.
    fn existing_binding(
        &self,
        uri: &TypeUri,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<Option<Arc<M>>, LibraryError> {
        if let Some(existing) = self.tables.by_uri.get(uri) {
            let class = existing.class();
            if class.value_type() == type_id {
                return Ok(Some(Arc::clone(existing)));
            }
            return Err(LibraryError::UriConflict {
                uri: uri.clone(),
                existing: class.type_name(),
                requested: type_name,
            });
        }
        if let Some(existing) = self.tables.by_type.get(&type_id) {
            return Err(LibraryError::TypeAlreadyRegistered {
                type_name,
                existing: existing.class().uri().clone(),
            });
        }
        Ok(None)
    }

    fn insert(&mut self, metadata: M) -> Arc<M> {
        let metadata = Arc::new(metadata);
        let class = metadata.class();
        self.tables
            .by_uri
            .insert(class.uri().clone(), Arc::clone(&metadata));
        self.tables
            .by_type
            .insert(class.value_type(), Arc::clone(&metadata));
        self.tables.entries.push(Arc::clone(&metadata));
        metadata
    }

    fn register_with(
        &mut self,
        uri: TypeUri,
        type_id: TypeId,
        type_name: &'static str,
        build: impl FnOnce(TypeUri, bool) -> Result<M, MetadataError>,
    ) -> Result<Arc<M>, LibraryError> {
        match self.existing_binding(&uri, type_id, type_name) {
            Ok(Some(existing)) => {
                debug!(%uri, "type already registered");
                return Ok(existing);
            }
            Ok(None) => {}
            Err(err) => {
                error!(%uri, type_name, error = %err, "registration rejected");
                return Err(err);
            }
        }

        match build(uri.clone(), self.replicate_by_default) {
            Ok(metadata) => {
                debug!(%uri, type_name, "registered type");
                Ok(self.insert(metadata))
            }
            Err(err) => {
                warn!(%uri, type_name, error = %err, "skipping type");
                Err(err.into())
            }
        }
    }
}

impl LibraryBuilder<ComponentMetadata> {
    /// A component library builder. Components are not replicated unless
    /// marked.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Tables::default(),
            strategies: CopyStrategyLibrary::new(),
            replicate_by_default: false,
        }
    }

    /// Register component type `T` under `uri`.
    ///
    /// Registering the same type under the same uri again returns the
    /// existing metadata.
    ///
    /// # Errors
    ///
    /// * [`LibraryError::UriConflict`] if `uri` is bound to another type.
    /// * [`LibraryError::TypeAlreadyRegistered`] if `T` is bound to another uri.
    /// * [`LibraryError::Metadata`] if `T` cannot be instantiated.
    ///
    /// Every failure is logged and leaves the builder unchanged.
    pub fn register<T: Component>(
        &mut self,
        uri: TypeUri,
    ) -> Result<Arc<ComponentMetadata>, LibraryError> {
        self.register_with(
            uri,
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            ComponentMetadata::build::<T>,
        )
    }
}

impl Default for LibraryBuilder<ComponentMetadata> {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryBuilder<EventMetadata> {
    /// An event library builder. Event fields are replicated unless marked
    /// otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Tables::default(),
            strategies: CopyStrategyLibrary::new(),
            replicate_by_default: true,
        }
    }

    /// Register event type `T` under `uri`.
    ///
    /// # Errors
    ///
    /// Same conflict rules as component registration. An uninstantiable
    /// network event is not an error; it registers as a local event.
    pub fn register<T: Event>(&mut self, uri: TypeUri) -> Result<Arc<EventMetadata>, LibraryError> {
        self.register_with(
            uri,
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            EventMetadata::build::<T>,
        )
    }
}

impl Default for LibraryBuilder<EventMetadata> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: TypeMetadata> fmt::Debug for LibraryBuilder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryBuilder")
            .field("types", &self.tables.entries.len())
            .field("replicate_by_default", &self.replicate_by_default)
            .finish()
    }
}

/// A frozen, thread-safe library.
pub struct Library<M> {
    tables: Arc<Tables<M>>,
    strategies: Arc<CopyStrategyLibrary>,
    replicate_by_default: bool,
}

/// The frozen component library.
pub type ComponentLibrary = Library<ComponentMetadata>;

/// The frozen event library.
pub type EventLibrary = Library<EventMetadata>;

impl<M> Clone for Library<M> {
    fn clone(&self) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
            strategies: Arc::clone(&self.strategies),
            replicate_by_default: self.replicate_by_default,
        }
    }
}

impl<M: TypeMetadata> Library<M> {
    /// Metadata for the type with `type_id`.
    #[must_use]
    pub fn metadata_for(&self, type_id: TypeId) -> Option<&Arc<M>> {
        self.tables.by_type.get(&type_id)
    }

    /// Metadata for `T`.
    #[must_use]
    pub fn metadata<T: 'static>(&self) -> Option<&Arc<M>> {
        self.metadata_for(TypeId::of::<T>())
    }

    /// Metadata registered under `uri`.
    #[must_use]
    pub fn metadata_by_uri(&self, uri: &TypeUri) -> Option<&Arc<M>> {
        self.tables.by_uri.get(uri)
    }

    /// Metadata for the concrete type of `value`.
    #[must_use]
    pub fn metadata_of_value(&self, value: &dyn Any) -> Option<&Arc<M>> {
        self.metadata_for(value.type_id())
    }

    /// Resolve a name to metadata.
    ///
    /// Accepts a full `<module>:<TypeName>` uri, or a bare type name when
    /// exactly one registered type carries it.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&Arc<M>> {
        if let Ok(uri) = name.parse::<TypeUri>() {
            return self.metadata_by_uri(&uri);
        }
        let mut candidates = self
            .tables
            .entries
            .iter()
            .filter(|m| m.class().uri().name().eq_ignore_ascii_case(name));
        let first = candidates.next()?;
        if candidates.next().is_some() {
            debug!(name, "ambiguous type name");
            return None;
        }
        Some(first)
    }

    /// Every registered entry in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<M>> {
        self.tables.entries.iter()
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.entries.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.entries.is_empty()
    }

    /// Whether fields without a marker were replicated at registration.
    #[must_use]
    pub fn replicate_by_default(&self) -> bool {
        self.replicate_by_default
    }

    /// The copy strategy overrides in effect.
    #[must_use]
    pub fn copy_strategies(&self) -> &CopyStrategyLibrary {
        &self.strategies
    }

    /// A library sharing every metadata entry with this one, except that
    /// values of `value_type` are copied with `strategy`.
    ///
    /// This library is not modified.
    #[must_use]
    pub fn create_copy_using_strategy(
        &self,
        value_type: TypeId,
        strategy: Arc<dyn CopyStrategy>,
    ) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
            strategies: Arc::new(self.strategies.with_strategy(value_type, strategy)),
            replicate_by_default: self.replicate_by_default,
        }
    }

    /// Returns `true` if both libraries share the same metadata tables.
    #[must_use]
    pub fn shares_metadata_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tables, &other.tables)
    }
}

impl Library<ComponentMetadata> {
    /// Metadata for the concrete type of `component`.
    #[must_use]
    pub fn metadata_of(&self, component: &dyn AnyComponent) -> Option<&Arc<ComponentMetadata>> {
        self.metadata_for(component.component_type())
    }

    /// Copy `component`. `None` if its type is not registered.
    #[must_use]
    pub fn copy(&self, component: &dyn AnyComponent) -> Option<ComponentBox> {
        self.metadata_of(component)?
            .copy(component, &self.strategies)
    }

    /// Copy a typed component.
    #[must_use]
    pub fn copy_typed<T: Component>(&self, component: &T) -> Option<T> {
        let copy = self.copy(component)?;
        copy.into_any().downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Copy `component`, deep-copying owned entities through `copier`.
    #[must_use]
    pub fn copy_with_owned_entities(
        &self,
        component: &dyn AnyComponent,
        copier: &mut dyn OwnedEntityCopier,
    ) -> Option<ComponentBox> {
        self.metadata_of(component)?
            .copy_with_owned_entities(component, &self.strategies, copier)
    }
}

impl Library<EventMetadata> {
    /// Copy a typed event. `None` if `T` is not registered or cannot be
    /// instantiated.
    #[must_use]
    pub fn copy_event<T: Event>(&self, event: &T) -> Option<T> {
        let copy = self.metadata::<T>()?.copy(event, &self.strategies)?;
        copy.downcast::<T>().ok().map(|boxed| *boxed)
    }
}

impl<M: TypeMetadata> fmt::Debug for Library<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field(
                "types",
                &self
                    .tables
                    .entries
                    .iter()
                    .map(|m| m.class().uri().to_string())
                    .collect::<Vec<_>>(),
            )
            .field("strategies", &self.strategies)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::component::ComponentDeclaration;
    use crate::copy::FnCopyStrategy;
    use crate::entity::EntityRef;
    use crate::event::{EventDeclaration, NetworkEventType};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
    }

    impl Component for Position {
        fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
            decl.default_constructor()
                .field("x", |p: &Position| &p.x, |p: &mut Position| &mut p.x)
                .field("y", |p: &Position| &p.y, |p: &mut Position| &mut p.y)
                .field("z", |p: &Position| &p.z, |p: &mut Position| &mut p.z)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Follow {
        target: EntityRef,
    }

    impl Component for Follow {
        fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
            decl.default_constructor()
                .field("target", |f: &Follow| &f.target, |f: &mut Follow| &mut f.target)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Unbuildable(u8);

    impl Component for Unbuildable {
        fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
            decl
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Jump {
        height: f32,
    }

    impl Event for Jump {
        fn declare(decl: EventDeclaration<Self>) -> EventDeclaration<Self> {
            decl.default_constructor()
                .network(NetworkEventType::Server)
                .field("height", |j: &Jump| &j.height, |j: &mut Jump| &mut j.height)
        }
    }

    fn uri(name: &str) -> TypeUri {
        TypeUri::new("test", name)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut builder = ComponentLibraryBuilder::new();
        builder.register::<Position>(uri("Position")).unwrap();
        let library = builder.freeze();

        assert_eq!(library.len(), 1);
        let by_type = library.metadata::<Position>().unwrap();
        let by_uri = library.metadata_by_uri(&"TEST:position".parse().unwrap()).unwrap();
        assert!(Arc::ptr_eq(by_type, by_uri));
        assert!(Arc::ptr_eq(by_type, library.metadata_of(&Position::default()).unwrap()));
        assert!(library.metadata::<Follow>().is_none());
    }

    #[test]
    fn test_double_registration_is_idempotent() {
        let mut builder = ComponentLibraryBuilder::new();
        let first = builder.register::<Position>(uri("Position")).unwrap();
        let second = builder.register::<Position>(uri("Position")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_uri_conflict_keeps_original_binding() {
        let mut builder = ComponentLibraryBuilder::new();
        builder.register::<Position>(uri("Thing")).unwrap();
        builder.register::<Position>(uri("Thing")).unwrap();
        let result = builder.register::<Follow>(uri("Thing"));
        assert!(matches!(result, Err(LibraryError::UriConflict { .. })));

        let library = builder.freeze();
        assert_eq!(library.len(), 1);
        let bound = library.metadata_by_uri(&uri("Thing")).unwrap();
        assert_eq!(bound.component_type(), TypeId::of::<Position>());
        assert!(library.metadata::<Follow>().is_none());
    }

    #[test]
    fn test_type_under_second_uri_rejected() {
        let mut builder = ComponentLibraryBuilder::new();
        builder.register::<Position>(uri("Position")).unwrap();
        let result = builder.register::<Position>(uri("Location"));
        assert!(matches!(result, Err(LibraryError::TypeAlreadyRegistered { .. })));
    }

    #[test]
    fn test_unbuildable_component_skipped() {
        let mut builder = ComponentLibraryBuilder::new();
        assert!(builder.register::<Unbuildable>(uri("Unbuildable")).is_err());
        builder.register::<Position>(uri("Position")).unwrap();
        let library = builder.freeze();
        assert_eq!(library.len(), 1);
        assert!(library.metadata::<Unbuildable>().is_none());
    }

    #[test]
    fn test_resolve_names() {
        let mut builder = ComponentLibraryBuilder::new();
        builder.register::<Position>(uri("Position")).unwrap();
        builder
            .register::<Follow>(TypeUri::new("other", "Position2"))
            .unwrap();
        let library = builder.freeze();
        assert!(library.resolve("test:Position").is_some());
        assert!(library.resolve("position").is_some());
        assert!(library.resolve("Missing").is_none());
    }

    #[test]
    fn test_resolve_ambiguous_name() {
        let mut builder = ComponentLibraryBuilder::new();
        builder.register::<Position>(TypeUri::new("a", "Spot")).unwrap();
        builder.register::<Follow>(TypeUri::new("b", "Spot")).unwrap();
        let library = builder.freeze();
        assert!(library.resolve("Spot").is_none());
        assert!(library.resolve("b:Spot").is_some());
    }

    #[test]
    fn test_copy_through_library() {
        let mut builder = ComponentLibraryBuilder::new();
        builder.register::<Position>(uri("Position")).unwrap();
        let library = builder.freeze();
        let source = Position { x: 1.0, y: 2.0, z: 3.0 };
        assert_eq!(library.copy_typed(&source), Some(source));
        assert!(library.copy(&Follow::default()).is_none());
    }

    #[test]
    fn test_create_copy_using_strategy_leaves_original() {
        let mut builder = ComponentLibraryBuilder::new();
        builder.register::<Follow>(uri("Follow")).unwrap();
        let library = builder.freeze();

        let forked = library.create_copy_using_strategy(
            TypeId::of::<EntityRef>(),
            Arc::new(FnCopyStrategy::new(|_: &EntityRef| EntityRef::NULL)),
        );
        let source = Follow {
            target: EntityRef(42),
        };

        assert_eq!(library.copy_typed(&source).unwrap().target, EntityRef(42));
        assert_eq!(forked.copy_typed(&source).unwrap().target, EntityRef::NULL);
        assert!(library.shares_metadata_with(&forked));
        assert!(library.copy_strategies().is_empty());
    }

    #[test]
    fn test_from_library_reopens_without_touching_original() {
        let mut builder = ComponentLibraryBuilder::new();
        builder.register::<Position>(uri("Position")).unwrap();
        let library = builder.freeze();

        let mut reopened = ComponentLibraryBuilder::from_library(&library);
        reopened.register::<Follow>(uri("Follow")).unwrap();
        let extended = reopened.freeze();

        assert_eq!(library.len(), 1);
        assert_eq!(extended.len(), 2);
        assert!(Arc::ptr_eq(
            library.metadata::<Position>().unwrap(),
            extended.metadata::<Position>().unwrap()
        ));
    }

    #[test]
    fn test_event_library_defaults_to_replicated() {
        let mut builder = EventLibraryBuilder::new();
        let meta = builder.register::<Jump>(uri("Jump")).unwrap();
        assert!(meta.class().field("height").unwrap().replication().replicated);
        let library = builder.freeze();
        assert!(library.replicate_by_default());
        assert_eq!(library.copy_event(&Jump { height: 2.0 }), Some(Jump { height: 2.0 }));
    }

    #[test]
    fn test_frozen_library_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ComponentLibrary>();
        assert_send_sync::<EventLibrary>();
    }
}
