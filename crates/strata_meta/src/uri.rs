//! Stable type identifiers.
//!
//! Every registered component and event type is named by a two-part
//! [`TypeUri`] of the form `<module>:<TypeName>`. The URI is the key used by
//! the libraries and the tag written to storage or the wire.
//!
//! ## Wire tag
//!
//! [`TypeTag`] is derived from the URI's string form using the FNV-1a 64-bit
//! hash. It is deterministic and language-neutral: any implementation that
//! hashes the same UTF-8 bytes gets the same tag.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetadataError;

/// A `<module>:<TypeName>` identifier.
///
/// Comparison is case-insensitive on both parts, matching how module and asset
/// names are resolved elsewhere in the engine. The original spelling is kept
/// for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeUri {
    module: String,
    name: String,
}

impl TypeUri {
    /// Create a URI from its two parts.
    #[must_use]
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// The originating module.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The type name within the module.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wire tag for this URI.
    #[must_use]
    pub fn tag(&self) -> TypeTag {
        TypeTag::from_name(&self.normalized())
    }

    fn normalized(&self) -> String {
        format!(
            "{}:{}",
            self.module.to_ascii_lowercase(),
            self.name.to_ascii_lowercase()
        )
    }
}

impl PartialEq for TypeUri {
    fn eq(&self, other: &Self) -> bool {
        self.module.eq_ignore_ascii_case(&other.module)
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for TypeUri {}

impl std::hash::Hash for TypeUri {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for TypeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.name)
    }
}

impl FromStr for TypeUri {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((module, name))
                if !module.is_empty() && !name.is_empty() && !name.contains(':') =>
            {
                Ok(Self::new(module, name))
            }
            _ => Err(MetadataError::InvalidUri(s.to_string())),
        }
    }
}

/// A stable 64-bit tag derived from a [`TypeUri`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TypeTag(pub u64);

impl TypeTag {
    /// FNV-1a 64-bit offset basis.
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

    /// FNV-1a 64-bit prime.
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    /// Hash a name with FNV-1a 64-bit.
    ///
    /// ```text
    /// hash = 0xcbf29ce484222325
    /// for each byte in name.as_bytes():
    ///     hash = hash XOR byte
    ///     hash = hash * 0x00000100000001b3
    /// ```
    #[must_use]
    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = Self::FNV_OFFSET_BASIS;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(Self::FNV_PRIME);
            i += 1;
        }
        Self(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        let uri: TypeUri = "engine:LocationComponent".parse().unwrap();
        assert_eq!(uri.module(), "engine");
        assert_eq!(uri.name(), "LocationComponent");
        assert_eq!(uri.to_string(), "engine:LocationComponent");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("LocationComponent".parse::<TypeUri>().is_err());
        assert!(":Location".parse::<TypeUri>().is_err());
        assert!("engine:".parse::<TypeUri>().is_err());
        assert!("a:b:c".parse::<TypeUri>().is_err());
    }

    #[test]
    fn test_uri_equality_ignores_case() {
        assert_eq!(
            TypeUri::new("Engine", "Location"),
            TypeUri::new("engine", "location")
        );
        assert_eq!(
            TypeUri::new("Engine", "Location").tag(),
            TypeUri::new("engine", "location").tag()
        );
    }

    #[test]
    fn test_fnv1a_known_vector() {
        assert_eq!(TypeTag::from_name(""), TypeTag(0xcbf2_9ce4_8422_2325));
        assert_ne!(TypeTag::from_name("a"), TypeTag::from_name("b"));
    }
}
