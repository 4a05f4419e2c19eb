//! Metadata and library error types.

use crate::uri::TypeUri;

/// Errors raised while deriving metadata for a single type.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The type was declared without a way to default-construct it.
    #[error("type {0} has no default constructor")]
    MissingConstructor(String),

    /// The type was declared abstract and cannot be instantiated.
    #[error("type {0} is abstract")]
    AbstractType(String),

    /// A string could not be parsed as `<module>:<TypeName>`.
    #[error("invalid type uri: {0:?}")]
    InvalidUri(String),

    /// Two fields of the same type share a name.
    #[error("type {type_name} declares field {field} twice")]
    DuplicateField {
        /// The declaring type.
        type_name: String,
        /// The duplicated field name.
        field: String,
    },
}

/// Errors raised by library registration.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    /// The uri is already bound to a different type.
    #[error("uri {uri} is already bound to {existing}, refusing to rebind it to {requested}")]
    UriConflict {
        /// The contested uri.
        uri: TypeUri,
        /// The type currently registered under `uri`.
        existing: &'static str,
        /// The type the caller attempted to register.
        requested: &'static str,
    },

    /// The type is already registered under another uri.
    #[error("type {type_name} is already registered as {existing}")]
    TypeAlreadyRegistered {
        /// The Rust type name.
        type_name: &'static str,
        /// The uri it is registered under.
        existing: TypeUri,
    },

    /// Metadata for the type could not be built.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Errors raised while encoding or decoding a component value.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a component to MessagePack.
    #[error("failed to encode component: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a component from MessagePack.
    #[error("failed to decode component: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The value handed to the codec is not of the metadata's type.
    #[error("value is not a {0}")]
    TypeMismatch(&'static str),
}
