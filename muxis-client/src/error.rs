//! Client error types.

use muxis_protocol::{ProtocolError, ServerError};
use thiserror::Error;

/// Client errors.
///
/// Callers deciding whether to retry should separate
/// [`is_command_error`](ClientError::is_command_error) (the command itself was
/// rejected, the session is fine) from
/// [`is_connection_error`](ClientError::is_connection_error) (the session is
/// unusable and a new connection is required).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("command error: {0}")]
    Command(#[from] ServerError),

    #[error("request timeout")]
    Timeout,

    #[error("connection is in subscribed mode; only subscription commands are accepted")]
    SubscribedMode,

    #[error("invalid transaction state: {0}")]
    TransactionState(&'static str),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns whether the whole connection is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionLost(_) | ClientError::Protocol(_) | ClientError::Io(_)
        )
    }

    /// Returns whether the server rejected this particular command.
    pub fn is_command_error(&self) -> bool {
        matches!(self, ClientError::Command(_))
    }

    /// Returns the server error, if this is a command error.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            ClientError::Command(err) => Some(err),
            _ => None,
        }
    }
}
