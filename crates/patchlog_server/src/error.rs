//! Error types for the patch log server.

use patchlog_protocol::{LinkError, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the patch log server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed request: bad patch, missing field, invalid name.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The operation requires a registration token that is absent or
    /// unrecognized.
    #[error("not registered: {0}")]
    NotRegistered(String),

    /// Unknown datasource id or name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid server setup: missing directory, unreadable state file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A latent bug or storage corruption: version did not advance,
    /// duplicate save with a different payload, audit mismatch.
    #[error("internal inconsistency: {0}")]
    Inconsistency(String),

    /// Coordination service failure.
    #[error("coordination error: {0}")]
    Coordination(String),

    /// Protocol parse/validation failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx at the wire boundary).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::BadRequest(_)
                | ServerError::NotRegistered(_)
                | ServerError::NotFound(_)
                | ServerError::Protocol(_)
        )
    }

    /// The HTTP status this error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::BadRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::NotRegistered(_) => 401,
            ServerError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

impl From<ServerError> for LinkError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::BadRequest(m) => LinkError::BadRequest(m),
            ServerError::Protocol(e) => LinkError::BadRequest(e.to_string()),
            ServerError::NotRegistered(m) => LinkError::NotRegistered(m),
            ServerError::NotFound(m) => LinkError::BadRequest(format!("no such datasource: {m}")),
            ServerError::Configuration(m) => LinkError::Configuration(m),
            ServerError::Inconsistency(m) => LinkError::Inconsistency(m),
            other => LinkError::Server(other.to_string()),
        }
    }
}
