//! Class metadata: explicit accessor tables for value types.
//!
//! A type is described once, at registration, by a [`ClassDeclaration`]: how
//! to default-construct it and, per field, a getter/setter pair. The
//! declaration is turned into a type-erased [`ClassMetadata`] that can build
//! new instances and copy existing ones field by field without knowing the
//! concrete type.
//!
//! The declaration is shared between components and events; the `K`
//! parameter carries the type-level markers specific to each kind.

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::warn;

use crate::copy::{
    BoxedValue, CopyStrategy, CopyStrategyLibrary, OwnedEntityCopier, OwnedReferences,
    clone_strategy,
};
use crate::entity::EntityRef;
use crate::error::MetadataError;
use crate::replication::{FieldReplication, ReplicateKind, ReplicationMarkers};
use crate::uri::TypeUri;

/// Type-erased get/set access to one field of one type.
trait FieldAccess: Send + Sync {
    fn get<'a>(&self, target: &'a dyn Any) -> Option<&'a dyn Any>;
    fn get_mut<'a>(&self, target: &'a mut dyn Any) -> Option<&'a mut dyn Any>;
    fn set(&self, target: &mut dyn Any, value: BoxedValue) -> bool;
}

struct TypedField<T, V> {
    get: fn(&T) -> &V,
    get_mut: fn(&mut T) -> &mut V,
}

impl<T, V> FieldAccess for TypedField<T, V>
where
    T: 'static,
    V: 'static,
{
    fn get<'a>(&self, target: &'a dyn Any) -> Option<&'a dyn Any> {
        let target = target.downcast_ref::<T>()?;
        Some((self.get)(target) as &dyn Any)
    }

    fn get_mut<'a>(&self, target: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        let target = target.downcast_mut::<T>()?;
        Some((self.get_mut)(target) as &mut dyn Any)
    }

    fn set(&self, target: &mut dyn Any, value: BoxedValue) -> bool {
        let Some(target) = target.downcast_mut::<T>() else {
            return false;
        };
        match value.downcast::<V>() {
            Ok(value) => {
                *(self.get_mut)(target) = *value;
                true
            }
            Err(_) => false,
        }
    }
}

/// Access to the entity references held by an owned-reference field.
trait OwnedAccess: Send + Sync {
    fn references(&self, value: &dyn Any) -> Vec<EntityRef>;
    fn remap(&self, value: &dyn Any, copier: &mut dyn OwnedEntityCopier) -> Option<BoxedValue>;
}

struct OwnedRefs<V>(PhantomData<fn(&V)>);

impl<V: OwnedReferences> OwnedAccess for OwnedRefs<V> {
    fn references(&self, value: &dyn Any) -> Vec<EntityRef> {
        value
            .downcast_ref::<V>()
            .map(V::references)
            .unwrap_or_default()
    }

    fn remap(&self, value: &dyn Any, copier: &mut dyn OwnedEntityCopier) -> Option<BoxedValue> {
        let value = value.downcast_ref::<V>()?;
        Some(Box::new(value.remap(&mut |e| copier.copy_owned(e))))
    }
}

/// One declared field.
struct FieldDeclaration {
    name: &'static str,
    value_type: TypeId,
    value_type_name: &'static str,
    access: Arc<dyn FieldAccess>,
    default_copy: Arc<dyn CopyStrategy>,
    owned: Option<Arc<dyn OwnedAccess>>,
    markers: ReplicationMarkers,
}

/// Builder describing a value type before it is registered.
///
/// `K` holds the kind-specific type markers (see
/// [`ComponentFlags`](crate::component::ComponentFlags) and
/// [`EventFlags`](crate::event::EventFlags)).
pub struct ClassDeclaration<T, K> {
    constructor: Option<fn() -> T>,
    is_abstract: bool,
    fields: Vec<FieldDeclaration>,
    pub(crate) flags: K,
}

impl<T, K> ClassDeclaration<T, K>
where
    T: Send + Sync + 'static,
    K: Default,
{
    /// An empty declaration: no constructor, no fields, default markers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            constructor: None,
            is_abstract: false,
            fields: Vec::new(),
            flags: K::default(),
        }
    }
}

impl<T, K> ClassDeclaration<T, K>
where
    T: Send + Sync + 'static,
{
    /// Use `constructor` to create fresh instances.
    #[must_use]
    pub fn constructor(mut self, constructor: fn() -> T) -> Self {
        self.constructor = Some(constructor);
        self
    }

    /// Use `T::default` to create fresh instances.
    #[must_use]
    pub fn default_constructor(self) -> Self
    where
        T: Default,
    {
        self.constructor(T::default)
    }

    /// Mark the type abstract: it describes a family of types and is never
    /// instantiated itself.
    #[must_use]
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Declare a field copied with `Clone` (or a library override for `V`).
    #[must_use]
    pub fn field<V>(
        mut self,
        name: &'static str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> Self
    where
        V: Clone + Send + Sync + 'static,
    {
        self.fields.push(FieldDeclaration {
            name,
            value_type: TypeId::of::<V>(),
            value_type_name: type_name::<V>(),
            access: Arc::new(TypedField { get, get_mut }),
            default_copy: clone_strategy::<V>(),
            owned: None,
            markers: ReplicationMarkers::default(),
        });
        self
    }

    /// Mark a declared field replicated.
    ///
    /// Takes precedence over [`ClassDeclaration::no_replicate_field`] on the
    /// same field, whatever the call order.
    #[must_use]
    pub fn replicate_field(self, name: &str, kind: ReplicateKind) -> Self {
        self.mark(name, |m| m.mark_replicate(kind, false))
    }

    /// Mark a declared field replicated only with the initial state.
    #[must_use]
    pub fn replicate_field_initial(self, name: &str, kind: ReplicateKind) -> Self {
        self.mark(name, |m| m.mark_replicate(kind, true))
    }

    /// Exclude a declared field from replication.
    #[must_use]
    pub fn no_replicate_field(self, name: &str) -> Self {
        self.mark(name, ReplicationMarkers::mark_no_replicate)
    }

    fn mark(mut self, name: &str, apply: impl FnOnce(&mut ReplicationMarkers)) -> Self {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => apply(&mut field.markers),
            None => warn!(
                type_name = type_name::<T>(),
                field = name,
                "replication marker on undeclared field ignored"
            ),
        }
        self
    }

    pub(crate) fn push_owned_field<V>(
        &mut self,
        name: &'static str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) where
        V: OwnedReferences,
    {
        self.fields.push(FieldDeclaration {
            name,
            value_type: TypeId::of::<V>(),
            value_type_name: type_name::<V>(),
            access: Arc::new(TypedField { get, get_mut }),
            default_copy: clone_strategy::<V>(),
            owned: Some(Arc::new(OwnedRefs::<V>(PhantomData))),
            markers: ReplicationMarkers::default(),
        });
    }

    /// Resolve the declaration into metadata registered under `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::DuplicateField`] if two fields share a name.
    /// A missing constructor or an abstract type is *not* an error here; it
    /// leaves the metadata non-constructable and the caller decides.
    pub(crate) fn build(
        self,
        uri: TypeUri,
        replicate_by_default: bool,
    ) -> Result<(ClassMetadata, K), MetadataError> {
        let mut fields: Vec<FieldMetadata> = Vec::with_capacity(self.fields.len());
        for decl in self.fields {
            if fields.iter().any(|f| f.name == decl.name) {
                return Err(MetadataError::DuplicateField {
                    type_name: type_name::<T>().to_string(),
                    field: decl.name.to_string(),
                });
            }
            fields.push(FieldMetadata {
                name: decl.name,
                value_type: decl.value_type,
                value_type_name: decl.value_type_name,
                access: decl.access,
                default_copy: decl.default_copy,
                owned: decl.owned,
                replication: decl.markers.resolve(replicate_by_default),
            });
        }

        let constructor: Option<Arc<dyn Fn() -> BoxedValue + Send + Sync>> =
            match (self.is_abstract, self.constructor) {
                (false, Some(ctor)) => Some(Arc::new(move || Box::new(ctor()) as BoxedValue)),
                _ => None,
            };

        let class = ClassMetadata {
            uri,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            is_abstract: self.is_abstract,
            constructor,
            fields,
        };
        Ok((class, self.flags))
    }
}

impl<T, K> Default for ClassDeclaration<T, K>
where
    T: Send + Sync + 'static,
    K: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata for one field of a registered type.
pub struct FieldMetadata {
    name: &'static str,
    value_type: TypeId,
    value_type_name: &'static str,
    access: Arc<dyn FieldAccess>,
    default_copy: Arc<dyn CopyStrategy>,
    owned: Option<Arc<dyn OwnedAccess>>,
    replication: FieldReplication,
}

impl FieldMetadata {
    /// The field name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `TypeId` of the field's value type.
    #[must_use]
    pub fn value_type(&self) -> TypeId {
        self.value_type
    }

    /// Rust name of the field's value type.
    #[must_use]
    pub fn value_type_name(&self) -> &'static str {
        self.value_type_name
    }

    /// Resolved replication state.
    #[must_use]
    pub fn replication(&self) -> FieldReplication {
        self.replication
    }

    /// Whether the field owns the entities it references.
    #[must_use]
    pub fn owns_entities(&self) -> bool {
        self.owned.is_some()
    }

    /// Read the field from `target`. `None` if `target` is the wrong type.
    #[must_use]
    pub fn get<'a>(&self, target: &'a dyn Any) -> Option<&'a dyn Any> {
        self.access.get(target)
    }

    /// Read the field from `target` as `V`.
    #[must_use]
    pub fn get_as<'a, V: 'static>(&self, target: &'a dyn Any) -> Option<&'a V> {
        self.access.get(target)?.downcast_ref::<V>()
    }

    /// Mutable access to the field on `target`.
    pub fn get_mut<'a>(&self, target: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        self.access.get_mut(target)
    }

    /// Overwrite the field on `target`. Returns `false` on a type mismatch.
    pub fn set(&self, target: &mut dyn Any, value: BoxedValue) -> bool {
        self.access.set(target, value)
    }

    /// The entity references held by this field on `target`, if it is an
    /// owned-reference field.
    #[must_use]
    pub fn owned_references(&self, target: &dyn Any) -> Vec<EntityRef> {
        match (&self.owned, self.access.get(target)) {
            (Some(owned), Some(value)) => owned.references(value),
            _ => Vec::new(),
        }
    }

    fn copy_value(&self, value: &dyn Any, strategies: &CopyStrategyLibrary) -> Option<BoxedValue> {
        match strategies.get(self.value_type) {
            Some(strategy) => strategy.copy(value),
            None => self.default_copy.copy(value),
        }
    }
}

impl fmt::Debug for FieldMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMetadata")
            .field("name", &self.name)
            .field("value_type", &self.value_type_name)
            .field("owns_entities", &self.owns_entities())
            .field("replication", &self.replication)
            .finish()
    }
}

/// Type-erased description of a registered value type.
pub struct ClassMetadata {
    uri: TypeUri,
    type_id: TypeId,
    type_name: &'static str,
    is_abstract: bool,
    constructor: Option<Arc<dyn Fn() -> BoxedValue + Send + Sync>>,
    fields: Vec<FieldMetadata>,
}

impl ClassMetadata {
    /// The uri the type is registered under.
    #[must_use]
    pub fn uri(&self) -> &TypeUri {
        &self.uri
    }

    /// The concrete type's `TypeId`.
    #[must_use]
    pub fn value_type(&self) -> TypeId {
        self.type_id
    }

    /// The concrete type's Rust name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the type was declared abstract.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Whether new instances can be created.
    #[must_use]
    pub fn is_constructable(&self) -> bool {
        self.constructor.is_some()
    }

    /// Declared fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Default-construct a new instance.
    #[must_use]
    pub fn new_instance(&self) -> Option<BoxedValue> {
        self.constructor.as_ref().map(|ctor| ctor())
    }

    /// Copy `source` field by field using `strategies`.
    ///
    /// Owned-reference fields are copied like any other field: the copy
    /// aliases the same entities. Returns `None` if `source` is not of this
    /// type or the type cannot be constructed.
    #[must_use]
    pub fn copy(&self, source: &dyn Any, strategies: &CopyStrategyLibrary) -> Option<BoxedValue> {
        self.copy_fields(source, |field, value| field.copy_value(value, strategies))
    }

    /// Copy `source`, deep-copying every entity referenced by an
    /// owned-reference field through `copier`.
    #[must_use]
    pub fn copy_with_owned_entities(
        &self,
        source: &dyn Any,
        strategies: &CopyStrategyLibrary,
        copier: &mut dyn OwnedEntityCopier,
    ) -> Option<BoxedValue> {
        self.copy_fields(source, |field, value| match &field.owned {
            Some(owned) => owned.remap(value, copier),
            None => field.copy_value(value, strategies),
        })
    }

    fn copy_fields(
        &self,
        source: &dyn Any,
        mut copy_value: impl FnMut(&FieldMetadata, &dyn Any) -> Option<BoxedValue>,
    ) -> Option<BoxedValue> {
        if source.type_id() != self.type_id {
            return None;
        }
        let mut target = self.new_instance()?;
        for field in &self.fields {
            let value = field.get(source)?;
            let copied = copy_value(field, value)?;
            if !field.set(&mut *target, copied) {
                warn!(
                    type_name = self.type_name,
                    field = field.name,
                    "copy strategy produced a value of the wrong type"
                );
                return None;
            }
        }
        Some(target)
    }
}

impl fmt::Debug for ClassMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassMetadata")
            .field("uri", &self.uri)
            .field("type_name", &self.type_name)
            .field("constructable", &self.is_constructable())
            .field("fields", &self.fields)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::FnCopyStrategy;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Bag {
        label: String,
        weights: Vec<f32>,
        holder: EntityRef,
    }

    fn bag_declaration() -> ClassDeclaration<Bag, ()> {
        ClassDeclaration::new()
            .default_constructor()
            .field("label", |b: &Bag| &b.label, |b: &mut Bag| &mut b.label)
            .field("weights", |b: &Bag| &b.weights, |b: &mut Bag| &mut b.weights)
            .field("holder", |b: &Bag| &b.holder, |b: &mut Bag| &mut b.holder)
    }

    fn bag_metadata() -> ClassMetadata {
        bag_declaration()
            .build(TypeUri::new("test", "Bag"), false)
            .unwrap()
            .0
    }

    #[test]
    fn test_new_instance_uses_constructor() {
        let meta = bag_metadata();
        let bag = meta.new_instance().unwrap();
        assert_eq!(*bag.downcast::<Bag>().unwrap(), Bag::default());
    }

    #[test]
    fn test_copy_is_independent() {
        let meta = bag_metadata();
        let source = Bag {
            label: "pack".into(),
            weights: vec![1.0, 2.5],
            holder: EntityRef(4),
        };
        let copy = *meta
            .copy(&source, &CopyStrategyLibrary::new())
            .unwrap()
            .downcast::<Bag>()
            .unwrap();
        assert_eq!(copy, source);
        assert_ne!(copy.weights.as_ptr(), source.weights.as_ptr());
    }

    #[test]
    fn test_copy_uses_strategy_override() {
        let meta = bag_metadata();
        let strategies = CopyStrategyLibrary::new().with_strategy(
            TypeId::of::<EntityRef>(),
            Arc::new(FnCopyStrategy::new(|_: &EntityRef| EntityRef::NULL)),
        );
        let source = Bag {
            holder: EntityRef(9),
            ..Bag::default()
        };
        let copy = *meta.copy(&source, &strategies).unwrap().downcast::<Bag>().unwrap();
        assert_eq!(copy.holder, EntityRef::NULL);
    }

    #[test]
    fn test_copy_rejects_other_types() {
        let meta = bag_metadata();
        assert!(meta.copy(&3u8, &CopyStrategyLibrary::new()).is_none());
    }

    #[test]
    fn test_field_get_and_set() {
        let meta = bag_metadata();
        let mut bag = Bag::default();
        let label = meta.field("label").unwrap();
        assert!(label.set(&mut bag, Box::new("coin purse".to_string())));
        assert_eq!(label.get_as::<String>(&bag).unwrap(), "coin purse");
        assert!(!label.set(&mut bag, Box::new(12u32)));
    }

    #[test]
    fn test_missing_constructor_is_not_constructable() {
        let (meta, _) = ClassDeclaration::<Bag, ()>::new()
            .build(TypeUri::new("test", "Bag"), false)
            .unwrap();
        assert!(!meta.is_constructable());
        assert!(meta.new_instance().is_none());
        assert!(meta.copy(&Bag::default(), &CopyStrategyLibrary::new()).is_none());
    }

    #[test]
    fn test_abstract_type_is_not_constructable() {
        let (meta, _) = bag_declaration()
            .abstract_type()
            .build(TypeUri::new("test", "Bag"), false)
            .unwrap();
        assert!(meta.is_abstract());
        assert!(!meta.is_constructable());
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let result = bag_declaration()
            .field("label", |b: &Bag| &b.label, |b: &mut Bag| &mut b.label)
            .build(TypeUri::new("test", "Bag"), false);
        assert!(matches!(result, Err(MetadataError::DuplicateField { .. })));
    }

    #[test]
    fn test_field_replication_resolves_against_default() {
        let (meta, _) = bag_declaration()
            .no_replicate_field("weights")
            .replicate_field("holder", ReplicateKind::ServerToOwner)
            .build(TypeUri::new("test", "Bag"), true)
            .unwrap();
        assert!(meta.field("label").unwrap().replication().replicated);
        assert!(!meta.field("weights").unwrap().replication().replicated);
        assert_eq!(
            meta.field("holder").unwrap().replication().kind,
            ReplicateKind::ServerToOwner
        );
    }
}
