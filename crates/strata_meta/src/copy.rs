//! Copy strategies and owned entity references.
//!
//! Field values are copied through a [`CopyStrategy`]. Every field carries a
//! default strategy derived from `Clone`; a [`CopyStrategyLibrary`] can
//! override the strategy for a whole value type. Libraries are forked rather
//! than mutated, so a reader holding the original never sees the override.
//!
//! Fields whose value type implements [`OwnedReferences`] can be declared as
//! owning the entities they point at. Copying such a field asks an
//! [`OwnedEntityCopier`] for a fresh copy of every referenced entity.

use std::any::{Any, TypeId, type_name};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::entity::EntityRef;

/// A boxed, thread-safe value produced by a copy.
pub type BoxedValue = Box<dyn Any + Send + Sync>;

/// Copies a value of one concrete type, seen through `dyn Any`.
pub trait CopyStrategy: Send + Sync {
    /// Returns a copy of `value`, or `None` if `value` is not of the
    /// strategy's type.
    fn copy(&self, value: &dyn Any) -> Option<BoxedValue>;

    /// The Rust name of the value type this strategy copies.
    fn value_type_name(&self) -> &'static str;
}

/// A [`CopyStrategy`] backed by a closure over the concrete value type.
pub struct FnCopyStrategy<V, F> {
    copy_fn: F,
    _marker: PhantomData<fn(&V) -> V>,
}

impl<V, F> FnCopyStrategy<V, F>
where
    V: Send + Sync + 'static,
    F: Fn(&V) -> V + Send + Sync,
{
    /// Wrap `copy_fn` as a strategy for `V`.
    #[must_use]
    pub fn new(copy_fn: F) -> Self {
        Self {
            copy_fn,
            _marker: PhantomData,
        }
    }
}

impl<V, F> CopyStrategy for FnCopyStrategy<V, F>
where
    V: Send + Sync + 'static,
    F: Fn(&V) -> V + Send + Sync,
{
    fn copy(&self, value: &dyn Any) -> Option<BoxedValue> {
        let value = value.downcast_ref::<V>()?;
        Some(Box::new((self.copy_fn)(value)))
    }

    fn value_type_name(&self) -> &'static str {
        type_name::<V>()
    }
}

/// The default strategy: `Clone`.
pub fn clone_strategy<V: Clone + Send + Sync + 'static>() -> Arc<dyn CopyStrategy> {
    Arc::new(FnCopyStrategy::<V, _>::new(V::clone))
}

/// Overrides of the copy strategy, keyed by value type.
#[derive(Clone, Default)]
pub struct CopyStrategyLibrary {
    strategies: HashMap<TypeId, Arc<dyn CopyStrategy>>,
}

impl CopyStrategyLibrary {
    /// An empty library: every field uses its default strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the override for `value_type`, if any.
    #[must_use]
    pub fn get(&self, value_type: TypeId) -> Option<&Arc<dyn CopyStrategy>> {
        self.strategies.get(&value_type)
    }

    /// Returns a new library identical to this one except that values of
    /// `value_type` are copied with `strategy`.
    #[must_use]
    pub fn with_strategy(&self, value_type: TypeId, strategy: Arc<dyn CopyStrategy>) -> Self {
        let mut strategies = self.strategies.clone();
        strategies.insert(value_type, strategy);
        Self { strategies }
    }

    /// Number of overridden value types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Returns `true` if nothing is overridden.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl fmt::Debug for CopyStrategyLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.strategies.values().map(|s| s.value_type_name()))
            .finish()
    }
}

/// Produces independent copies of owned entities during a deep copy.
///
/// Implemented by the entity manager; metadata only knows how to find the
/// references, not how to duplicate what they point at.
pub trait OwnedEntityCopier {
    /// Deep-copy `entity` and return a reference to the copy.
    ///
    /// Returns [`EntityRef::NULL`] when nothing can be copied.
    fn copy_owned(&mut self, entity: EntityRef) -> EntityRef;
}

/// Value types that may hold owned entity references: a single reference or a
/// homogeneous collection whose values are references.
pub trait OwnedReferences: Clone + Send + Sync + 'static {
    /// Every reference held by the value.
    fn references(&self) -> Vec<EntityRef>;

    /// A copy of the value with every reference passed through `remap`.
    fn remap(&self, remap: &mut dyn FnMut(EntityRef) -> EntityRef) -> Self;
}

impl OwnedReferences for EntityRef {
    fn references(&self) -> Vec<EntityRef> {
        vec![*self]
    }

    fn remap(&self, remap: &mut dyn FnMut(EntityRef) -> EntityRef) -> Self {
        remap(*self)
    }
}

impl OwnedReferences for Option<EntityRef> {
    fn references(&self) -> Vec<EntityRef> {
        self.iter().copied().collect()
    }

    fn remap(&self, remap: &mut dyn FnMut(EntityRef) -> EntityRef) -> Self {
        self.map(|e| remap(e))
    }
}

impl OwnedReferences for Vec<EntityRef> {
    fn references(&self) -> Vec<EntityRef> {
        self.clone()
    }

    fn remap(&self, remap: &mut dyn FnMut(EntityRef) -> EntityRef) -> Self {
        self.iter().map(|&e| remap(e)).collect()
    }
}

impl OwnedReferences for HashSet<EntityRef> {
    fn references(&self) -> Vec<EntityRef> {
        self.iter().copied().collect()
    }

    fn remap(&self, remap: &mut dyn FnMut(EntityRef) -> EntityRef) -> Self {
        self.iter().map(|&e| remap(e)).collect()
    }
}

impl OwnedReferences for BTreeSet<EntityRef> {
    fn references(&self) -> Vec<EntityRef> {
        self.iter().copied().collect()
    }

    fn remap(&self, remap: &mut dyn FnMut(EntityRef) -> EntityRef) -> Self {
        self.iter().map(|&e| remap(e)).collect()
    }
}

impl<K> OwnedReferences for HashMap<K, EntityRef>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn references(&self) -> Vec<EntityRef> {
        self.values().copied().collect()
    }

    fn remap(&self, remap: &mut dyn FnMut(EntityRef) -> EntityRef) -> Self {
        self.iter().map(|(k, &e)| (k.clone(), remap(e))).collect()
    }
}

impl<K> OwnedReferences for BTreeMap<K, EntityRef>
where
    K: Clone + Ord + Send + Sync + 'static,
{
    fn references(&self) -> Vec<EntityRef> {
        self.values().copied().collect()
    }

    fn remap(&self, remap: &mut dyn FnMut(EntityRef) -> EntityRef) -> Self {
        self.iter().map(|(k, &e)| (k.clone(), remap(e))).collect()
    }
}
