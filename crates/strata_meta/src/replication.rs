//! Replication markers for fields.
//!
//! A field is replicated when it carries an explicit `replicate` marker, or
//! when it carries no marker at all and its library replicates by default.
//! An explicit `replicate` marker always beats `no_replicate`, whichever was
//! applied last.

use serde::{Deserialize, Serialize};

/// Direction in which a replicated field travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplicateKind {
    /// Server to every client.
    #[default]
    ServerToClient,
    /// Server to the owning client only.
    ServerToOwner,
    /// Owning client to server.
    OwnerToServer,
}

impl ReplicateKind {
    /// Whether values flow from the owning client.
    #[must_use]
    pub const fn from_owner(self) -> bool {
        matches!(self, Self::OwnerToServer)
    }
}

/// Markers applied to a field at declaration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicationMarkers {
    replicate: Option<ReplicateKind>,
    initial_only: bool,
    no_replicate: bool,
}

impl ReplicationMarkers {
    /// Apply an explicit `replicate` marker.
    pub fn mark_replicate(&mut self, kind: ReplicateKind, initial_only: bool) {
        self.replicate = Some(kind);
        self.initial_only = initial_only;
    }

    /// Apply an explicit `no_replicate` marker.
    pub fn mark_no_replicate(&mut self) {
        self.no_replicate = true;
    }

    /// Resolve the markers against the library's default policy.
    #[must_use]
    pub fn resolve(self, replicate_by_default: bool) -> FieldReplication {
        match self.replicate {
            Some(kind) => FieldReplication {
                replicated: true,
                kind,
                initial_only: self.initial_only,
            },
            None if self.no_replicate => FieldReplication::NONE,
            None => FieldReplication {
                replicated: replicate_by_default,
                kind: ReplicateKind::default(),
                initial_only: false,
            },
        }
    }
}

/// The resolved replication state of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldReplication {
    /// Whether the field is part of the network-visible state.
    pub replicated: bool,
    /// Direction of travel. Meaningless when `replicated` is `false`.
    pub kind: ReplicateKind,
    /// Sent only when the owning entity is first replicated.
    pub initial_only: bool,
}

impl FieldReplication {
    /// Not replicated.
    pub const NONE: Self = Self {
        replicated: false,
        kind: ReplicateKind::ServerToClient,
        initial_only: false,
    };

    /// Replicated and flowing from the owning client.
    #[must_use]
    pub const fn replicated_from_owner(&self) -> bool {
        self.replicated && self.kind.from_owner()
    }
}
