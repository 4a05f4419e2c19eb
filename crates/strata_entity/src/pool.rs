//! Entity pools.
//!
//! A pool is one partition of the entity space with its own component
//! storage. The manager always has a global pool and a sector pool, plus one
//! pool per world. An entity id lives in exactly one pool at a time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::table::ComponentTable;

/// Identifies a pool within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub u32);

impl PoolId {
    /// The global pool.
    pub const GLOBAL: PoolId = PoolId(0);

    /// The sector pool.
    pub const SECTOR: PoolId = PoolId(1);
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// What a pool holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Persistent and always-relevant entities.
    Global,
    /// Entities scoped to one world.
    World(String),
    /// Position-addressed entities with simulation-delta bounds.
    Sector,
}

/// One partition of entity storage.
#[derive(Debug)]
pub struct EntityPool {
    id: PoolId,
    kind: PoolKind,
    table: ComponentTable,
}

impl EntityPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(id: PoolId, kind: PoolKind) -> Self {
        Self {
            id,
            kind,
            table: ComponentTable::new(),
        }
    }

    /// The pool's id.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// What the pool holds.
    #[must_use]
    pub fn kind(&self) -> &PoolKind {
        &self.kind
    }

    /// Returns `true` if `id` lives in this pool.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.table.contains(id)
    }

    /// Number of entities in the pool.
    #[must_use]
    pub fn active_entity_count(&self) -> usize {
        self.table.len()
    }

    /// Read access to the pool's storage.
    #[must_use]
    pub fn table(&self) -> &ComponentTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut ComponentTable {
        &mut self.table
    }
}
