//! Cross-thread access to one entity manager.
//!
//! Every mutation of [`EntityManager`] takes `&mut self`, so a write guard
//! makes each operation, pool moves included, atomic with respect to
//! readers on other threads.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::manager::EntityManager;

/// A cloneable handle to an [`EntityManager`] behind a read-write lock.
#[derive(Clone)]
pub struct SharedEntityManager {
    inner: Arc<RwLock<EntityManager>>,
}

impl SharedEntityManager {
    /// Wrap `manager` for sharing between threads.
    #[must_use]
    pub fn new(manager: EntityManager) -> Self {
        Self {
            inner: Arc::new(RwLock::new(manager)),
        }
    }

    /// Shared access. A lock poisoned by a panicking writer is recovered,
    /// since every manager operation leaves the pools consistent before it
    /// can call out to listeners.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityManager> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access.
    pub fn write(&self) -> RwLockWriteGuard<'_, EntityManager> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SharedEntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEntityManager")
            .field("manager", &*self.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::any::TypeId;
    use std::thread;

    use super::*;
    use crate::manager::tests::{PositionComponent, position, test_manager};
    use crate::pool::PoolId;

    #[test]
    fn test_moving_entity_is_never_seen_twice_or_missing() {
        let mut manager = test_manager();
        let world = manager.create_world_pool("overworld");
        manager.set_current_world("overworld");
        let entity = manager.create(vec![position(0.0, 0.0, 0.0)]);
        let shared = SharedEntityManager::new(manager);

        let mover = {
            let shared = shared.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let target = if i % 2 == 0 { PoolId::GLOBAL } else { world };
                    assert!(shared.write().move_to_pool(entity, target));
                }
            })
        };
        for _ in 0..500 {
            let seen = shared
                .read()
                .entities_with(&[TypeId::of::<PositionComponent>()]);
            assert_eq!(seen, vec![entity]);
        }
        mover.join().unwrap();
    }

    #[test]
    fn test_handles_share_state() {
        let shared = SharedEntityManager::new(test_manager());
        let other = shared.clone();
        let entity = shared.write().create(vec![]);
        assert!(other.read().is_active(entity));
    }
}
