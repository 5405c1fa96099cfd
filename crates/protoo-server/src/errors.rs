//! Server-side error types.

use thiserror::Error;

/// Errors from the admission flow of one connection attempt.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// `accept` or `reject` was already called for this attempt.
    #[error("connection request already replied")]
    AlreadyReplied,
    /// The HTTP request went away before the decision was delivered.
    #[error("connection request abandoned")]
    Abandoned,
    /// The WebSocket upgrade did not complete after `accept`.
    #[error("websocket upgrade failed")]
    UpgradeFailed,
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("config file not found: {0}")]
    NotFound(String),
    /// Layered sources could not be merged or deserialized.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),
}

/// Failures starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The server was already stopped.
    #[error("server stopped")]
    Stopped,
    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures opening a client connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The URL or a header could not be turned into a handshake request.
    #[error("invalid connection request: {0}")]
    InvalidRequest(String),
    /// The server answered the handshake with a non-101 status.
    #[error("connection rejected [status:{status}, reason:{reason}]")]
    Rejected {
        /// HTTP status of the rejection.
        status: u16,
        /// Response body, if any.
        reason: String,
    },
    /// The server accepted but did not agree on the `protoo` sub-protocol.
    #[error("server did not select sub-protocol {0}")]
    SubprotocolMismatch(String),
    /// Transport-level handshake failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}
