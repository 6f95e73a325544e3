//! Log version numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The position of a patch within its log.
///
/// Committed patches occupy versions `1, 2, 3, ...` with no gaps and no
/// reuse. Two sentinel values exist outside that range:
///
/// - [`Version::UNSET`] - no value / invalid
/// - [`Version::INIT`] - the log exists but holds no patches yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// No value.
    pub const UNSET: Version = Version(-1);
    /// Log exists, no patches yet.
    pub const INIT: Version = Version(0);
    /// The version assigned to the first patch of a log.
    pub const FIRST: Version = Version(1);

    /// Creates a version from a raw number.
    pub const fn new(value: i64) -> Self {
        Version(value)
    }

    /// Returns the raw version number.
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Returns true if this version denotes a committed patch (>= 1).
    pub fn is_valid(&self) -> bool {
        self.0 >= Self::FIRST.0
    }

    /// Returns true if this is the UNSET sentinel.
    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }

    /// The version that the next accepted append will receive.
    ///
    /// UNSET has no successor; asking for one is a logic error upstream,
    /// so it saturates to FIRST.
    pub fn next(&self) -> Version {
        if self.0 < Self::INIT.0 {
            Self::FIRST
        } else {
            Version(self.0 + 1)
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Version::UNSET => write!(f, "unset"),
            v => write!(f, "{}", v.0),
        }
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Version(value)
    }
}
