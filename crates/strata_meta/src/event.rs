//! The [`Event`] trait and per-event metadata.

use std::any::{Any, TypeId};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::class::{ClassDeclaration, ClassMetadata, FieldMetadata};
use crate::copy::{BoxedValue, CopyStrategyLibrary};
use crate::error::MetadataError;
use crate::uri::{TypeTag, TypeUri};

/// Which peers a network event is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetworkEventType {
    /// Local only.
    #[default]
    None,
    /// Client to server.
    Server,
    /// Server to the owning client.
    Owner,
    /// Server to every client.
    Broadcast,
}

impl NetworkEventType {
    /// Whether the event crosses the network at all.
    #[must_use]
    pub const fn is_network(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// The core event trait.
///
/// Events carry no storage requirements of their own; they are only
/// described so the network layer knows where to route them.
pub trait Event: Send + Sync + fmt::Debug + 'static {
    /// Describe the type: constructor, fields, and markers.
    fn declare(decl: EventDeclaration<Self>) -> EventDeclaration<Self>
    where
        Self: Sized;
}

/// Type-level event markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags {
    network: NetworkEventType,
    lag_compensate: bool,
    skip_instigator: bool,
}

/// Declaration of an event type.
pub type EventDeclaration<T> = ClassDeclaration<T, EventFlags>;

impl<T: Event> ClassDeclaration<T, EventFlags> {
    /// Route the event over the network.
    #[must_use]
    pub fn network(mut self, kind: NetworkEventType) -> Self {
        self.flags.network = kind;
        self
    }

    /// Rewind the world to the instigator's view before handling.
    #[must_use]
    pub fn lag_compensate(mut self) -> Self {
        self.flags.lag_compensate = true;
        self
    }

    /// Do not deliver a broadcast back to the client that caused it.
    #[must_use]
    pub fn skip_instigator(mut self) -> Self {
        self.flags.skip_instigator = true;
        self
    }
}

/// Immutable metadata for one registered event type.
pub struct EventMetadata {
    class: ClassMetadata,
    tag: TypeTag,
    network_type: NetworkEventType,
    lag_compensated: bool,
    skip_instigator: bool,
}

impl EventMetadata {
    /// Derive metadata for `T` registered under `uri`.
    ///
    /// A network event that cannot be instantiated is downgraded to a local
    /// event with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::DuplicateField`] for a malformed declaration.
    pub fn build<T: Event>(
        uri: TypeUri,
        replicate_by_default: bool,
    ) -> Result<Self, MetadataError> {
        let declaration = T::declare(EventDeclaration::<T>::new());
        let (class, flags) = declaration.build(uri, replicate_by_default)?;

        let mut network_type = flags.network;
        if network_type.is_network() && !class.is_constructable() {
            let reason = if class.is_abstract() {
                "abstract"
            } else {
                "missing a default constructor"
            };
            warn!(
                uri = %class.uri(),
                reason,
                "network event cannot be instantiated, treating it as local"
            );
            network_type = NetworkEventType::None;
        }

        debug!(uri = %class.uri(), ?network_type, "built event metadata");

        Ok(Self {
            tag: class.uri().tag(),
            class,
            network_type,
            lag_compensated: flags.lag_compensate,
            skip_instigator: flags.skip_instigator,
        })
    }

    /// The uri the event is registered under.
    #[must_use]
    pub fn uri(&self) -> &TypeUri {
        self.class.uri()
    }

    /// The wire tag.
    #[must_use]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// The concrete type's `TypeId`.
    #[must_use]
    pub fn event_type(&self) -> TypeId {
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

    /// Effective network routing.
    #[must_use]
    pub fn network_type(&self) -> NetworkEventType {
        self.network_type
    }

    /// Whether the event crosses the network.
    #[must_use]
    pub fn is_network_event(&self) -> bool {
        self.network_type.is_network()
    }

    /// Whether handling is lag compensated.
    #[must_use]
    pub fn is_lag_compensated(&self) -> bool {
        self.lag_compensated
    }

    /// Whether broadcasts skip the instigating client.
    #[must_use]
    pub fn is_skip_instigator(&self) -> bool {
        self.skip_instigator
    }

    /// Fields sent over the network.
    pub fn replicated_fields(&self) -> impl Iterator<Item = &FieldMetadata> {
        self.fields().iter().filter(|f| f.replication().replicated)
    }

    /// Copy `event` field by field.
    #[must_use]
    pub fn copy(&self, event: &dyn Any, strategies: &CopyStrategyLibrary) -> Option<BoxedValue> {
        self.class.copy(event, strategies)
    }
}

impl fmt::Debug for EventMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMetadata")
            .field("uri", self.uri())
            .field("network_type", &self.network_type)
            .field("lag_compensated", &self.lag_compensated)
            .field("skip_instigator", &self.skip_instigator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Chat {
        message: String,
        channel: u8,
    }

    impl Event for Chat {
        fn declare(decl: EventDeclaration<Self>) -> EventDeclaration<Self> {
            decl.default_constructor()
                .network(NetworkEventType::Broadcast)
                .skip_instigator()
                .field("message", |c: &Chat| &c.message, |c: &mut Chat| &mut c.message)
                .field("channel", |c: &Chat| &c.channel, |c: &mut Chat| &mut c.channel)
                .no_replicate_field("channel")
        }
    }

    #[derive(Debug)]
    struct Attack;

    impl Event for Attack {
        fn declare(decl: EventDeclaration<Self>) -> EventDeclaration<Self> {
            decl.network(NetworkEventType::Server).lag_compensate()
        }
    }

    #[derive(Debug, Default)]
    struct Damage;

    impl Event for Damage {
        fn declare(decl: EventDeclaration<Self>) -> EventDeclaration<Self> {
            decl.default_constructor()
                .abstract_type()
                .network(NetworkEventType::Owner)
        }
    }

    #[derive(Debug)]
    struct Tick;

    impl Event for Tick {
        fn declare(decl: EventDeclaration<Self>) -> EventDeclaration<Self> {
            decl
        }
    }

    #[test]
    fn test_network_event_flags() {
        let meta = EventMetadata::build::<Chat>(TypeUri::new("test", "Chat"), true).unwrap();
        assert_eq!(meta.network_type(), NetworkEventType::Broadcast);
        assert!(meta.is_skip_instigator());
        assert!(!meta.is_lag_compensated());
        let replicated: Vec<_> = meta.replicated_fields().map(FieldMetadata::name).collect();
        assert_eq!(replicated, vec!["message"]);
    }

    #[test]
    fn test_network_event_without_constructor_is_local() {
        let meta = EventMetadata::build::<Attack>(TypeUri::new("test", "Attack"), true).unwrap();
        assert_eq!(meta.network_type(), NetworkEventType::None);
        assert!(!meta.is_network_event());
        assert!(meta.is_lag_compensated());
    }

    #[test]
    fn test_abstract_network_event_is_local() {
        let meta = EventMetadata::build::<Damage>(TypeUri::new("test", "Damage"), true).unwrap();
        assert_eq!(meta.network_type(), NetworkEventType::None);
    }

    #[test]
    fn test_local_event_without_constructor_is_fine() {
        let meta = EventMetadata::build::<Tick>(TypeUri::new("test", "Tick"), true).unwrap();
        assert_eq!(meta.network_type(), NetworkEventType::None);
        assert!(!meta.class().is_constructable());
    }

    #[test]
    fn test_copy_event() {
        let meta = EventMetadata::build::<Chat>(TypeUri::new("test", "Chat"), true).unwrap();
        let source = Chat {
            message: "hello".into(),
            channel: 2,
        };
        let copy = meta.copy(&source, &CopyStrategyLibrary::new()).unwrap();
        assert_eq!(*copy.downcast::<Chat>().unwrap(), source);
    }
}
