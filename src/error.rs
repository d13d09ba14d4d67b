//! Error types for sockwire.

use thiserror::Error;

use crate::protocol::Status;

/// Main error type for all sockwire operations.
#[derive(Debug, Error)]
pub enum SockwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket-level error (handshake, framing, close).
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed header, length mismatch, undecodable payload).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error status returned by the remote peer.
    #[error("Remote error ({status:?}): {message}")]
    Remote { status: Status, message: String },

    /// The connection was shut down gracefully; the reason was supplied
    /// by whichever side requested the shutdown.
    #[error("Connection was shut down: {reason}")]
    WasShutdown { reason: String },

    /// The transport dropped underneath us (abnormal closure, read/write
    /// failure). Recoverable on the dialer side by reconnecting.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The WebSocket handshake could not complete.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// A call was attempted with auto-connect disabled and no open connection.
    #[error("Connection is not open")]
    ConnectionNotOpen,

    /// The instance was disposed.
    #[error("Instance was disposed")]
    Disposed,

    /// The request-id space is saturated. Transient; retry after some
    /// outstanding calls complete.
    #[error("Request id space exhausted")]
    IdSpaceExhausted,
}

impl SockwireError {
    /// Status carried by a remote error, if this is one.
    pub fn remote_status(&self) -> Option<Status> {
        match self {
            SockwireError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True if this error means the connection went away (for any reason).
    pub fn is_connection_gone(&self) -> bool {
        matches!(
            self,
            SockwireError::WasShutdown { .. }
                | SockwireError::ConnectionLost(_)
                | SockwireError::Disposed
        )
    }
}

/// Result type alias using SockwireError.
pub type Result<T> = std::result::Result<T, SockwireError>;
