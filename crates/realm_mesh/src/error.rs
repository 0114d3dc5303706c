//! Mesh error types.

use std::time::Duration;

/// Errors surfaced by the mesh node.
///
/// Only connection setup and explicit sends report errors to callers; failures
/// inside a connection's read loop or a timer are logged and absorbed.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// An outbound connection could not be established.
    #[error("Connection to {endpoint} failed: {source}")]
    ConnectionFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The endpoint string is not of the form `host:port`.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node has not been started (or has been stopped).
    #[error("Node not running")]
    NotRunning,

    /// `start` was called on a node that is already running.
    #[error("Node already running")]
    AlreadyRunning,

    /// A frame header announced more bytes than the configured maximum.
    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The outbound queue for a peer is full or closed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
