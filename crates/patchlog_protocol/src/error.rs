//! Error taxonomy shared by every Link implementation.

use thiserror::Error;

/// Result type for protocol parsing and validation.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or validating protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A patch could not be decoded.
    #[error("bad patch: {0}")]
    BadPatch(String),

    /// A datasource name fails the naming rule.
    #[error("invalid datasource name: {0}")]
    BadName(String),

    /// An RPC message is missing a field or malformed.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for Link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors that a [`crate::Link`] operation can surface.
///
/// Not-found is deliberately absent: fetch-style calls return `Ok(None)` and
/// only the wire boundary turns that into a 404.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Invalid local setup: missing state file, malformed cursor, bad URL.
    /// Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The server rejected the request as malformed. Carries the server's
    /// message. Never retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The operation needs a registration token that is absent or no longer
    /// recognized.
    #[error("not registered: {0}")]
    NotRegistered(String),

    /// Transport-level failure: refused, timeout, DNS. Distinct from
    /// application errors so failover and tolerant sync can tell "server
    /// said no" from "server unreachable".
    #[error("connection problem: {0}")]
    Connection(String),

    /// The server reported an internal error.
    #[error("server error: {0}")]
    Server(String),

    /// A latent bug or storage corruption was detected: a version that did
    /// not advance, a duplicate save with a different payload.
    #[error("internal inconsistency: {0}")]
    Inconsistency(String),
}

impl LinkError {
    /// Returns true for transport-level failures that warrant switching to
    /// another server in a failover configuration.
    pub fn is_connection_problem(&self) -> bool {
        matches!(self, LinkError::Connection(_))
    }

    /// Returns true for errors that are pointless to retry against the same
    /// server with the same request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Configuration(_) | LinkError::BadRequest(_)
        )
    }
}

impl From<ProtocolError> for LinkError {
    fn from(err: ProtocolError) -> Self {
        LinkError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(LinkError::Connection("refused".into()).is_connection_problem());
        assert!(!LinkError::BadRequest("nope".into()).is_connection_problem());
        assert!(LinkError::BadRequest("nope".into()).is_fatal());
        assert!(!LinkError::Server("oops".into()).is_fatal());
    }

    #[test]
    fn protocol_error_converts_to_bad_request() {
        let err: LinkError = ProtocolError::BadName("a/b".into()).into();
        assert!(matches!(err, LinkError::BadRequest(_)));
    }
}
