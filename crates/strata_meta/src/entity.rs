//! Entity references and id allocation.
//!
//! An [`EntityRef`] is a lightweight `u64` key into pool storage with no data
//! of its own. Ids are handed out by an [`EntityAllocator`] owned by the
//! entity manager and are never reused.

use serde::{Deserialize, Serialize};

/// A reference to an entity.
///
/// Components refer to other entities through this type. Whether such a
/// reference *owns* the target is declared on the component field, not on the
/// reference itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef(pub u64);

impl EntityRef {
    /// The null / invalid entity sentinel.
    pub const NULL: EntityRef = EntityRef(0);

    /// Create a reference from a raw `u64` identifier.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw `u64` identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }

    /// Returns `true` if this is not the null reference.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Default for EntityRef {
    fn default() -> Self {
        Self::NULL
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityRef({})", self.0)
    }
}

/// Allocates monotonically increasing entity ids.
///
/// Ids start at 1 (0 is reserved for [`EntityRef::NULL`]). Ids below
/// [`EntityAllocator::next_id`] are considered to have existed at some point,
/// whether or not they are currently loaded.
#[derive(Debug)]
pub struct EntityAllocator {
    next_id: u64,
}

impl EntityAllocator {
    /// Creates a new allocator.
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// Allocates a fresh entity id.
    pub fn allocate(&mut self) -> EntityRef {
        if self.next_id == EntityRef::NULL.0 {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        EntityRef(id)
    }

    /// Marks `id` as taken so that later allocations never return it.
    pub fn reserve(&mut self, id: u64) {
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }

    /// Returns the id the next allocation will produce.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Overrides the next id, e.g. when resuming from a save.
    ///
    /// Never moves backwards: ids handed out earlier must stay unique.
    pub fn set_next_id(&mut self, id: u64) {
        self.next_id = self.next_id.max(id);
    }

    /// Returns `true` if `id` has been handed out (or reserved) before.
    #[must_use]
    pub fn has_issued(&self, id: u64) -> bool {
        id != 0 && id < self.next_id
    }

    /// Resets the allocator to its initial state.
    pub fn reset(&mut self) {
        self.next_id = 1;
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ref_creation() {
        let e = EntityRef::from_raw(42);
        assert_eq!(e.id(), 42);
        assert!(e.is_valid());
    }

    #[test]
    fn test_null_entity() {
        assert!(!EntityRef::NULL.is_valid());
        assert_eq!(EntityRef::default(), EntityRef::NULL);
    }

    #[test]
    fn test_allocator_produces_unique_ids() {
        let mut alloc = EntityAllocator::new();
        let e1 = alloc.allocate();
        let e2 = alloc.allocate();
        let e3 = alloc.allocate();
        assert_eq!(e1.id(), 1);
        assert_eq!(e2.id(), 2);
        assert_eq!(e3.id(), 3);
        assert_eq!(alloc.next_id(), 4);
    }

    #[test]
    fn test_reserve_skips_ids() {
        let mut alloc = EntityAllocator::new();
        alloc.reserve(10);
        assert!(alloc.has_issued(10));
        assert_eq!(alloc.allocate().id(), 11);
    }

    #[test]
    fn test_set_next_id_never_rewinds() {
        let mut alloc = EntityAllocator::new();
        alloc.allocate();
        alloc.allocate();
        alloc.set_next_id(1);
        assert_eq!(alloc.allocate().id(), 3);
    }

    #[test]
    fn test_entity_ref_serialization_roundtrip() {
        let entity = EntityRef::from_raw(999);
        let bytes = rmp_serde::to_vec(&entity).unwrap();
        let restored: EntityRef = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(entity, restored);
    }
}
