//! # strata_meta
//!
//! Type metadata for the Strata entity runtime: how components and events
//! are described, copied, and looked up.
//!
//! This crate provides:
//!
//! - [`EntityRef`] and [`EntityAllocator`]: `u64` entity keys, never reused.
//! - [`TypeUri`] and [`TypeTag`]: stable `<module>:<TypeName>` identifiers.
//! - [`ClassDeclaration`] / [`ClassMetadata`]: explicit accessor tables that
//!   construct and copy values field by field.
//! - [`FieldReplication`]: per-field network replication state.
//! - [`Component`] / [`ComponentMetadata`] and [`Event`] / [`EventMetadata`].
//! - [`LibraryBuilder`] / [`Library`]: register, freeze, then share.

pub mod class;
pub mod component;
pub mod copy;
pub mod entity;
pub mod error;
pub mod event;
pub mod library;
pub mod replication;
pub mod uri;

pub use class::{ClassDeclaration, ClassMetadata, FieldMetadata};
pub use component::{
    AnyComponent, Component, ComponentBox, ComponentDeclaration, ComponentFlags, ComponentMetadata,
};
pub use copy::{
    BoxedValue, CopyStrategy, CopyStrategyLibrary, FnCopyStrategy, OwnedEntityCopier,
    OwnedReferences, clone_strategy,
};
pub use entity::{EntityAllocator, EntityRef};
pub use error::{CodecError, LibraryError, MetadataError};
pub use event::{Event, EventDeclaration, EventFlags, EventMetadata, NetworkEventType};
pub use library::{
    ComponentLibrary, ComponentLibraryBuilder, EventLibrary, EventLibraryBuilder, Library,
    LibraryBuilder, TypeMetadata,
};
pub use replication::{FieldReplication, ReplicateKind, ReplicationMarkers};
pub use uri::{TypeTag, TypeUri};
