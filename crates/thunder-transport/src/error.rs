//! Transport errors.

use std::io;
use thunder_core::PeerHandleError;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Could not reach the remote
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer manager refused the connection
    #[error("Peer rejected: {0}")]
    Rejected(#[from] PeerHandleError),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
