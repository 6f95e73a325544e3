//! Datasource descriptions and log info snapshots.

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::Id;
use crate::version::Version;
use serde::{Deserialize, Serialize};

/// Identity of a managed dataset and its patch log.
///
/// The name is unique within a server and restricted to a URL-safe
/// character class (see [`validate_name`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDescription {
    /// The datasource id.
    pub id: Id,
    /// Human-readable name, unique within a server.
    pub name: String,
    /// URI identifying the dataset.
    pub uri: String,
}

impl DataSourceDescription {
    /// Creates a description with a fresh id.
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        DataSourceDescription {
            id: Id::fresh(),
            name: name.into(),
            uri: uri.into(),
        }
    }
}

/// A point-in-time snapshot of a log's extent.
///
/// Produced on demand from the log's index; not separately persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchLogInfo {
    /// The datasource this log belongs to.
    pub source: DataSourceDescription,
    /// Earliest fetchable version, or INIT if the log is empty.
    pub min_version: Version,
    /// Latest committed version, or INIT if the log is empty.
    pub max_version: Version,
    /// Id of the patch at `max_version`, if any.
    pub latest_patch: Option<Id>,
}

/// Returns true if `name` is an acceptable datasource name.
///
/// Names are alphanumeric plus `-`, `_`, `.`, with `$` permitted only as the
/// final character. The first character must be alphanumeric. Slashes,
/// spaces, `?` and `#` are rejected so names embed cleanly in URLs.
pub fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    for (i, &b) in rest.iter().enumerate() {
        let ok = b.is_ascii_alphanumeric()
            || b == b'-'
            || b == b'_'
            || b == b'.'
            || (b == b'$' && i == rest.len() - 1);
        if !ok {
            return false;
        }
    }
    true
}

/// Validates a datasource name, producing a bad-request error on failure.
pub fn validate_name(name: &str) -> ProtocolResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ProtocolError::BadName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_names() {
        for name in ["abc", "abc-123.test", "A1", "x_y", "data$", "a-"] {
            assert!(is_valid_name(name), "expected valid: {name}");
        }
    }

    #[test]
    fn rejected_names() {
        for name in ["", "bad name!", "a/b", "-abc", ".hidden", "a?b", "a#b", "$x", "a$b"] {
            assert!(!is_valid_name(name), "expected invalid: {name}");
        }
    }

    #[test]
    fn validate_reports_name() {
        let err = validate_name("a/b").unwrap_err();
        assert!(err.to_string().contains("a/b"));
    }

    #[test]
    fn description_json_round_trip() {
        let dsd = DataSourceDescription::new("inventory", "http://example.org/inventory");
        let json = serde_json::to_string(&dsd).unwrap();
        let back: DataSourceDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dsd);
    }

    #[test]
    fn log_info_json_round_trip() {
        let info = PatchLogInfo {
            source: DataSourceDescription::new("inventory", "http://example.org/inventory"),
            min_version: Version::FIRST,
            max_version: Version::new(2),
            latest_patch: Some(Id::fresh()),
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: PatchLogInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
