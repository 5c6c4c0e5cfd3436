//! Error types for the relay-link client library.

use thiserror::Error;

/// Errors produced by the relay client.
///
/// Operation-level failures (a join rejected by the server, a session that died
/// while a request was parked) are *not* errors — they surface as
/// [`AckResponse`](crate::protocol::AckResponse) values with `success: false`.
/// This enum covers configuration mistakes and transport/serialization plumbing.
#[derive(Error, Debug)]
pub enum RelayLinkError {
    /// Client misconfiguration (missing relay URL, invalid endpoint, ...).
    /// Always surfaced synchronously at build time, never thrown asynchronously.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Credential fetch or handshake authentication failure.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Transport-level failure (connect, send, or unexpected close).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// An operation exceeded its configured timeout.
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Failed to serialize or parse a wire payload.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for RelayLinkError {
    fn from(e: serde_json::Error) -> Self {
        RelayLinkError::SerializationError(e.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RelayLinkError>;
