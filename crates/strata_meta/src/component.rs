//! The [`Component`] trait and per-component metadata.
//!
//! A component is a plain data record attached to an entity. Each component
//! type describes itself once through [`Component::declare`]; registering the
//! type with a library turns that declaration into an immutable
//! [`ComponentMetadata`].
//!
//! ## Derived flags
//!
//! Type-level markers are taken as declared. Field-level markers then widen
//! them: any replicated field makes the component replicated, any field
//! replicated from the owner makes the component replicated-from-owner, and
//! any owned entity reference makes the component an ownership holder.

use std::any::{Any, TypeId, type_name};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::class::{ClassDeclaration, ClassMetadata, FieldMetadata};
use crate::copy::{BoxedValue, CopyStrategyLibrary, OwnedEntityCopier, OwnedReferences};
use crate::entity::EntityRef;
use crate::error::{CodecError, MetadataError};
use crate::uri::{TypeTag, TypeUri};

/// The core component trait.
///
/// # Examples
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use strata_meta::{Component, ComponentDeclaration};
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Health {
///     current: f32,
///     max: f32,
/// }
///
/// impl Component for Health {
///     fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self> {
///         decl.default_constructor()
///             .field("current", |h: &Health| &h.current, |h: &mut Health| &mut h.current)
///             .field("max", |h: &Health| &h.max, |h: &mut Health| &mut h.max)
///     }
/// }
/// ```
pub trait Component:
    Send + Sync + fmt::Debug + 'static + Serialize + for<'de> Deserialize<'de>
{
    /// Describe the type: constructor, fields, and markers.
    fn declare(decl: ComponentDeclaration<Self>) -> ComponentDeclaration<Self>
    where
        Self: Sized;
}

/// Object-safe view of a boxed component.
pub trait AnyComponent: Send + Sync + fmt::Debug {
    /// Borrow as `dyn Any`.
    fn as_any(&self) -> &dyn Any;

    /// Mutably borrow as `dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Convert the box into `Box<dyn Any>` for owned downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    /// The concrete component type.
    fn component_type(&self) -> TypeId;

    /// The concrete component type's Rust name.
    fn component_type_name(&self) -> &'static str;
}

impl<T: Component> AnyComponent for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn component_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn component_type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

impl<'a> dyn AnyComponent + 'a {
    /// Downcast to a concrete component type.
    #[must_use]
    pub fn downcast_ref<T: Component>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Mutably downcast to a concrete component type.
    #[must_use]
    pub fn downcast_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Returns `true` if the component is a `T`.
    #[must_use]
    pub fn is<T: Component>(&self) -> bool {
        self.component_type() == TypeId::of::<T>()
    }
}

/// A boxed, type-erased component.
pub type ComponentBox = Box<dyn AnyComponent>;

/// Type-level component markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentFlags {
    persisted: bool,
    replicated: bool,
    force_block_active: bool,
    retain_unaltered_on_block_change: bool,
    block_lifecycle_events_required: bool,
}

impl Default for ComponentFlags {
    fn default() -> Self {
        Self {
            persisted: true,
            replicated: false,
            force_block_active: false,
            retain_unaltered_on_block_change: false,
            block_lifecycle_events_required: false,
        }
    }
}

/// Declaration of a component type.
pub type ComponentDeclaration<T> = ClassDeclaration<T, ComponentFlags>;

impl<T: Component> ClassDeclaration<T, ComponentFlags> {
    /// Never write this component to storage.
    #[must_use]
    pub fn do_not_persist(mut self) -> Self {
        self.flags.persisted = false;
        self
    }

    /// Replicate the component as a whole.
    #[must_use]
    pub fn replicate(mut self) -> Self {
        self.flags.replicated = true;
        self
    }

    /// Keep the block an entity with this component sits in active.
    ///
    /// With `retain_unaltered_on_block_change`, the component survives the
    /// block being replaced by a block of another type.
    #[must_use]
    pub fn force_block_active(mut self, retain_unaltered_on_block_change: bool) -> Self {
        self.flags.force_block_active = true;
        self.flags.retain_unaltered_on_block_change = retain_unaltered_on_block_change;
        self
    }

    /// Block entities carrying this component need block lifecycle events.
    #[must_use]
    pub fn requires_block_lifecycle_events(mut self) -> Self {
        self.flags.block_lifecycle_events_required = true;
        self
    }

    /// Declare a field that owns the entities it references.
    ///
    /// `V` is a single [`EntityRef`] or a homogeneous collection of them.
    /// Deep copies of the component deep-copy the referenced entities
    /// instead of aliasing them.
    #[must_use]
    pub fn owned_field<V>(
        mut self,
        name: &'static str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> Self
    where
        V: OwnedReferences,
    {
        self.push_owned_field(name, get, get_mut);
        self
    }
}

/// Immutable metadata for one registered component type.
pub struct ComponentMetadata {
    class: ClassMetadata,
    tag: TypeTag,
    persisted: bool,
    replicated: bool,
    replicated_from_owner: bool,
    references_owned_entities: bool,
    force_block_active: bool,
    retain_unaltered_on_block_change: bool,
    block_lifecycle_events_required: bool,
    unbox: fn(BoxedValue) -> Option<ComponentBox>,
    encode: fn(&dyn Any) -> Result<Vec<u8>, CodecError>,
    decode: fn(&[u8]) -> Result<ComponentBox, CodecError>,
}

impl ComponentMetadata {
    /// Derive metadata for `T` registered under `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::AbstractType`] or
    /// [`MetadataError::MissingConstructor`] if `T` cannot be instantiated,
    /// and [`MetadataError::DuplicateField`] for a malformed declaration.
    pub fn build<T: Component>(
        uri: TypeUri,
        replicate_by_default: bool,
    ) -> Result<Self, MetadataError> {
        let declaration = T::declare(ComponentDeclaration::<T>::new());
        let (class, flags) = declaration.build(uri, replicate_by_default)?;

        if class.is_abstract() {
            return Err(MetadataError::AbstractType(class.type_name().to_string()));
        }
        if !class.is_constructable() {
            return Err(MetadataError::MissingConstructor(class.type_name().to_string()));
        }

        let mut replicated = flags.replicated;
        let mut replicated_from_owner = false;
        let mut references_owned_entities = false;
        for field in class.fields() {
            let replication = field.replication();
            if replication.replicated {
                replicated = true;
                if replication.replicated_from_owner() {
                    replicated_from_owner = true;
                }
            }
            if field.owns_entities() {
                references_owned_entities = true;
            }
        }

        debug!(
            uri = %class.uri(),
            replicated,
            references_owned_entities,
            "built component metadata"
        );

        Ok(Self {
            tag: class.uri().tag(),
            class,
            persisted: flags.persisted,
            replicated,
            replicated_from_owner,
            references_owned_entities,
            force_block_active: flags.force_block_active,
            retain_unaltered_on_block_change: flags.retain_unaltered_on_block_change,
            block_lifecycle_events_required: flags.block_lifecycle_events_required,
            unbox: unbox_component::<T>,
            encode: encode_component::<T>,
            decode: decode_component::<T>,
        })
    }

    /// The uri the component is registered under.
    #[must_use]
    pub fn uri(&self) -> &TypeUri {
        self.class.uri()
    }

    /// The wire/storage tag.
    #[must_use]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// The concrete type's `TypeId`.
    #[must_use]
    pub fn component_type(&self) -> TypeId {
        self.class.value_type()
    }

    /// The concrete type's Rust name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.class.type_name()
    }

    /// The underlying class metadata.
    #[must_use]
    pub fn class(&self) -> &ClassMetadata {
        &self.class
    }

    /// Declared fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldMetadata] {
        self.class.fields()
    }

    /// Whether the component is written to storage.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Whether any part of the component is replicated.
    #[must_use]
    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    /// Whether a replicated field flows from the owning client.
    #[must_use]
    pub fn is_replicated_from_owner(&self) -> bool {
        self.replicated_from_owner
    }

    /// Whether any field owns the entities it references.
    #[must_use]
    pub fn references_owned_entities(&self) -> bool {
        self.references_owned_entities
    }

    /// Whether the component keeps its block active.
    #[must_use]
    pub fn is_force_block_active(&self) -> bool {
        self.force_block_active
    }

    /// Whether the component survives a block type change unaltered.
    #[must_use]
    pub fn is_retain_unaltered_on_block_change(&self) -> bool {
        self.retain_unaltered_on_block_change
    }

    /// Whether the component needs block lifecycle events.
    #[must_use]
    pub fn is_block_lifecycle_events_required(&self) -> bool {
        self.block_lifecycle_events_required
    }

    /// Fields that are replicated.
    pub fn replicated_fields(&self) -> impl Iterator<Item = &FieldMetadata> {
        self.fields().iter().filter(|f| f.replication().replicated)
    }

    /// A fresh default instance.
    #[must_use]
    pub fn new_instance(&self) -> Option<ComponentBox> {
        self.class.new_instance().and_then(self.unbox)
    }

    /// Copy `component`; owned references are aliased, not duplicated.
    #[must_use]
    pub fn copy(
        &self,
        component: &dyn AnyComponent,
        strategies: &CopyStrategyLibrary,
    ) -> Option<ComponentBox> {
        self.class
            .copy(component.as_any(), strategies)
            .and_then(self.unbox)
    }

    /// Copy `component`, deep-copying every owned entity through `copier`.
    ///
    /// For a component with no owned-reference fields this is identical to
    /// [`ComponentMetadata::copy`] and never calls `copier`.
    #[must_use]
    pub fn copy_with_owned_entities(
        &self,
        component: &dyn AnyComponent,
        strategies: &CopyStrategyLibrary,
        copier: &mut dyn OwnedEntityCopier,
    ) -> Option<ComponentBox> {
        if !self.references_owned_entities {
            return self.copy(component, strategies);
        }
        self.class
            .copy_with_owned_entities(component.as_any(), strategies, copier)
            .and_then(self.unbox)
    }

    /// Every entity owned by `component`.
    #[must_use]
    pub fn owned_entities(&self, component: &dyn AnyComponent) -> Vec<EntityRef> {
        if !self.references_owned_entities {
            return Vec::new();
        }
        self.fields()
            .iter()
            .flat_map(|f| f.owned_references(component.as_any()))
            .collect()
    }

    /// Encode `component` as MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] if `component` is not of this
    /// type, or [`CodecError::Encode`] if serialisation fails.
    pub fn serialize(&self, component: &dyn AnyComponent) -> Result<Vec<u8>, CodecError> {
        (self.encode)(component.as_any())
    }

    /// Decode a component of this type from MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid encoding.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<ComponentBox, CodecError> {
        (self.decode)(bytes)
    }
}

impl fmt::Debug for ComponentMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentMetadata")
            .field("uri", self.uri())
            .field("persisted", &self.persisted)
            .field("replicated", &self.replicated)
            .field("replicated_from_owner", &self.replicated_from_owner)
            .field("references_owned_entities", &self.references_owned_entities)
            .field("force_block_active", &self.force_block_active)
            .finish()
    }
}

fn unbox_component<T: Component>(value: BoxedValue) -> Option<ComponentBox> {
    value
        .downcast::<T>()
        .ok()
        .map(|component| component as ComponentBox)
}

fn encode_component<T: Component>(value: &dyn Any) -> Result<Vec<u8>, CodecError> {
    let component = value
        .downcast_ref::<T>()
        .ok_or(CodecError::TypeMismatch(type_name::<T>()))?;
    Ok(rmp_serde::to_vec_named(component)?)
}

fn decode_component<T: Component>(bytes: &[u8]) -> Result<ComponentBox, CodecError> {
    let component: T = rmp_serde::from_slice(bytes)?;
    Ok(Box::new(component))
}
