//! Error types for the transport layer.

use crate::member::MemberError;
use crate::wire::FrameError;

/// Errors that can occur while driving an exchange over a connection.
///
/// Kept `Clone` so a single failure can be delivered both to the exchange's
/// completion channel and to the transport loop's own error handling. I/O
/// errors are captured as their display string for the same reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Malformed header or length mismatch. Connection-fatal.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// Unexpected packet kind or unmatched continuation. The packet is
    /// dropped and logged; the connection stays open.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The exchange's cancellation token fired before completion.
    #[error("exchange canceled")]
    Cancelled,

    /// A deadline-bound request ran out of time.
    #[error("request timed out")]
    Timeout,

    /// The remote server's exchange pool is exhausted.
    #[error("remote peer is busy")]
    Busy,

    /// The remote exchange faulted while processing the request.
    #[error("remote exchange faulted")]
    RemoteFault,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Disconnected,

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,

    /// Socket read or write failure.
    #[error("i/o failure: {0}")]
    Io(String),

    /// The local member facade rejected or failed the operation.
    #[error("member error: {0}")]
    Member(String),

    /// The exchange was asked to do something its current state forbids.
    #[error("invalid exchange state: {0}")]
    InvalidState(String),

    /// Configuration rejected before the transport started.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl TransportError {
    /// Whether this failure leaves the connection unusable.
    ///
    /// Framing errors and I/O failures corrupt or lose the byte stream;
    /// everything else resolves the exchange and leaves the connection open.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Frame(_) | TransportError::Io(_) | TransportError::Disconnected
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<MemberError> for TransportError {
    fn from(err: MemberError) -> Self {
        TransportError::Member(err.to_string())
    }
}
