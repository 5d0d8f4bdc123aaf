// Error types for the messaging core

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the transport layer.
///
/// Connection failures never reach callers directly; they are absorbed by
/// the reconnection logic and only show up in the published status. The
/// variants a caller can see come from acknowledged sends.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel is not connected or the circuit breaker is open
    #[error("Channel not connected or circuit open")]
    NotConnected,

    /// No acknowledgement arrived in time
    #[error("Acknowledgement timed out after {0:?}")]
    AckTimeout(Duration),

    /// The server answered, but not with `{received: true}`
    #[error("Invalid acknowledgement received: {0}")]
    InvalidAck(String),

    /// The channel went away while an acknowledgement was outstanding
    #[error("Channel closed before acknowledgement")]
    ChannelClosed,

    /// Creating or opening the channel failed
    #[error("Connection error: {0}")]
    Connect(String),

    /// A payload could not be encoded for the wire
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The connection driver has stopped
    #[error("Transport has shut down")]
    Shutdown,
}
