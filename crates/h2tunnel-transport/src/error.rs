//! Transport error taxonomy

use h2::Reason;
use thiserror::Error;

/// Transport-level errors
///
/// The three HTTP/2 variants (`StreamReset`, `ConnectionProtocol`, `GoAway`)
/// are the protocol-fatal set: the remote side of the stream is in a broken
/// state and bytes written so far may not have been delivered.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// RST_STREAM received for (or sent on) the tunnel stream
    #[error("Stream reset: {0}")]
    StreamReset(Reason),

    /// Connection-level protocol error detected locally
    #[error("Connection protocol error: {0}")]
    ConnectionProtocol(Reason),

    /// Peer sent GOAWAY
    #[error("Connection shut down by peer (GOAWAY): {0}")]
    GoAway(Reason),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

impl From<h2::Error> for TransportError {
    fn from(err: h2::Error) -> Self {
        if err.is_go_away() {
            let reason = err.reason().unwrap_or(Reason::NO_ERROR);
            return if err.is_remote() {
                TransportError::GoAway(reason)
            } else {
                TransportError::ConnectionProtocol(reason)
            };
        }

        if err.is_reset() {
            return TransportError::StreamReset(err.reason().unwrap_or(Reason::CANCEL));
        }

        if err.is_io() {
            return match err.into_io() {
                Some(io) => TransportError::IoError(io),
                None => TransportError::ConnectionError("H2 I/O failure".to_string()),
            };
        }

        match err.reason() {
            Some(reason) => TransportError::ConnectionProtocol(reason),
            None => TransportError::ProtocolError(err.to_string()),
        }
    }
}

impl TransportError {
    /// Whether this error belongs to the HTTP/2 protocol-fatal set
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::StreamReset(_)
                | TransportError::ConnectionProtocol(_)
                | TransportError::GoAway(_)
        )
    }
}
