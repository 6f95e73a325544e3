//! Identifiers for patches, datasources and registrations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A globally unique identifier for a patch or a datasource.
///
/// Usually a UUID, but an opaque string token is also accepted so that
/// externally minted identifiers survive a round trip. Equality is value
/// equality; the display form is safe to embed in URLs and JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Id {
    /// A UUID identifier.
    Uuid(Uuid),
    /// An opaque string token.
    Token(String),
}

impl Id {
    /// Mints a fresh random identifier.
    pub fn fresh() -> Self {
        Id::Uuid(Uuid::new_v4())
    }

    /// Parses an identifier, preferring the UUID form.
    pub fn parse(s: &str) -> Self {
        match Uuid::parse_str(s) {
            Ok(u) => Id::Uuid(u),
            Err(_) => Id::Token(s.to_string()),
        }
    }

    /// Returns the canonical string form.
    pub fn as_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Uuid(u) => write!(f, "{u}"),
            Id::Token(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for Id {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Id::parse(s))
    }
}

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Id::parse(&s))
    }
}

/// A server-issued registration credential.
///
/// Created by `register`, required on mutating operations, invalidated by
/// `deregister`. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegToken(String);

impl RegToken {
    /// Mints a fresh token.
    pub fn fresh() -> Self {
        RegToken(Uuid::new_v4().to_string())
    }

    /// Wraps an existing token string.
    pub fn from_string(s: impl Into<String>) -> Self {
        RegToken(s.into())
    }

    /// Returns the token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(Id::fresh(), Id::fresh());
    }

    #[test]
    fn uuid_round_trip() {
        let id = Id::fresh();
        let parsed = Id::parse(&id.to_string());
        assert_eq!(parsed, id);
        assert!(matches!(parsed, Id::Uuid(_)));
    }

    #[test]
    fn token_fallback() {
        let id = Id::parse("not-a-uuid");
        assert!(matches!(id, Id::Token(_)));
        assert_eq!(id.to_string(), "not-a-uuid");
    }

    #[test]
    fn serde_as_string() {
        let id = Id::parse("ds-main");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ds-main\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn reg_tokens_are_distinct() {
        assert_ne!(RegToken::fresh(), RegToken::fresh());
    }
}
