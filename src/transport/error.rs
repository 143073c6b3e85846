//! Transport error types
//!
//! Errors raised while talking to the broker over the duplex link.

use thiserror::Error;

/// Errors that can occur in the transport layer
#[derive(Error, Debug)]
pub enum TransportError {
    /// Broker rejected or never completed the handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Broker refused the supplied credentials
    #[error("Authorization violation: {0}")]
    Authorization(String),

    /// The session was closed (by either side)
    #[error("Connection closed")]
    Closed,

    /// Malformed frame or unexpected protocol operation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid broker URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Subject or pattern rejected before reaching the wire
    #[error("Invalid subject: {0}")]
    InvalidSubject(#[from] super::topic::TopicError),

    /// WebSocket layer failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(e) => TransportError::Io(e),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
