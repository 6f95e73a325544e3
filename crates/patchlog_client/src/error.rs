//! Error types for the patch log client.

use patchlog_protocol::{LinkError, Version};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur on the client side of the protocol.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A link operation failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A version inside the remote range had no fetchable patch.
    #[error("missing patch at version {version}")]
    MissingPatch {
        /// The version with no patch.
        version: Version,
    },

    /// The local cursor state is unusable.
    #[error("bad cursor state: {0}")]
    State(String),

    /// Applying a patch to the local dataset failed.
    #[error("apply failed: {0}")]
    Apply(String),

    /// I/O error while reading or writing local state.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns true if the failure was transport-level: the server may be
    /// fine, just unreachable.
    pub fn is_connection_problem(&self) -> bool {
        matches!(self, ClientError::Link(e) if e.is_connection_problem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_classification() {
        let err = ClientError::Link(LinkError::Connection("refused".into()));
        assert!(err.is_connection_problem());
        let err = ClientError::MissingPatch {
            version: Version::new(3),
        };
        assert!(!err.is_connection_problem());
        assert!(err.to_string().contains('3'));
    }
}
