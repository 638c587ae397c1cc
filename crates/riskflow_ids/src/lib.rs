//! Shared identifier wrappers for Riskflow.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Separator between the scheme and value parts of an [`ObjectId`].
pub const OBJECT_ID_SEPARATOR: char = '~';

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

define_uuid_id!(JobId, "job ID");
define_uuid_id!(ViewDefinitionId, "view definition ID");

/// Identifier of a mutable object in the configuration/reference-data universe.
///
/// Rendered as `scheme~value`. Change sources emit these and watch sets hold them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId {
    scheme: String,
    value: String,
}

impl ObjectId {
    pub fn new(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, IdParseError> {
        let (scheme, value) = text
            .split_once(OBJECT_ID_SEPARATOR)
            .ok_or_else(|| IdParseError::new(format!("Invalid object ID (no scheme): {}", text)))?;
        if scheme.is_empty() || value.is_empty() {
            return Err(IdParseError::new(format!(
                "Invalid object ID (empty part): {}",
                text
            )));
        }
        Ok(Self::new(scheme, value))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.scheme, OBJECT_ID_SEPARATOR, self.value)
    }
}

impl std::str::FromStr for ObjectId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_string()
    }
}

/// Content address of an immutable value (lower-case hex blake3 digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, IdParseError> {
        let hex = hex.into();
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdParseError::new(format!("Invalid target key: {}", hex)));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Key of arbitrary content bytes.
    pub fn of_content(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, used in published names and log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_round_trips_through_display() {
        let id = ObjectId::new("Config", "curve-usd");
        assert_eq!(id.to_string(), "Config~curve-usd");
        let parsed: ObjectId = "Config~curve-usd".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"Config~curve-usd\"");
    }

    #[test]
    fn test_object_id_rejects_missing_scheme() {
        assert!(ObjectId::parse("no-separator").is_err());
        assert!(ObjectId::parse("~value").is_err());
        assert!(ObjectId::parse("scheme~").is_err());
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert!(ViewDefinitionId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_target_key_validates_hex() {
        let hex = "a".repeat(64);
        let key = TargetKey::from_hex(hex.clone()).unwrap();
        assert_eq!(key.short(), "aaaaaaaa");
        assert!(TargetKey::from_hex("xyz").is_err());
        let content = TargetKey::of_content(b"view");
        assert_eq!(TargetKey::from_hex(content.as_str()).unwrap(), content);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", hex));
    }
}
