// Abstraction over the underlying bidirectional event channel
//
// A `Connector` creates one `Channel` per connection attempt. Creation is
// synchronous and cheap; the actual handshake happens in the background
// and its outcome comes back as `ChannelEvent`s through the
// `ChannelEventSender` the channel was opened with.

use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::connection::DriverMessage;
use super::events::EventName;
use crate::error::TransportError;

/// Resolves an acknowledged send with the raw ack payload
pub type AckResponder = oneshot::Sender<Result<Value, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    PingTimeout,
    TransportClose,
    TransportError,
    ServerDisconnect,
    ClientDisconnect,
    Other(String),
}

impl DisconnectReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "ping timeout" => DisconnectReason::PingTimeout,
            "transport close" => DisconnectReason::TransportClose,
            "transport error" => DisconnectReason::TransportError,
            "io server disconnect" => DisconnectReason::ServerDisconnect,
            "io client disconnect" => DisconnectReason::ClientDisconnect,
            other => DisconnectReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::ServerDisconnect => "io server disconnect",
            DisconnectReason::ClientDisconnect => "io client disconnect",
            DisconnectReason::Other(reason) => reason,
        }
    }

    /// Reasons that warrant an automatic reconnect
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::PingTimeout
                | DisconnectReason::TransportClose
                | DisconnectReason::TransportError
                | DisconnectReason::ServerDisconnect
        )
    }
}

/// Lifecycle and data events reported by a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected(DisconnectReason),
    ConnectError(String),
    Pong(Duration),
    Inbound { name: EventName, data: Value },
}

/// Handle a channel uses to report events back to the connection driver.
/// Events are tagged with the attempt they belong to, so anything a
/// replaced channel still says is ignored.
#[derive(Clone)]
pub struct ChannelEventSender {
    epoch: u64,
    tx: mpsc::UnboundedSender<DriverMessage>,
}

impl ChannelEventSender {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<DriverMessage>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the driver has gone away
    pub fn send(&self, event: ChannelEvent) -> bool {
        self.tx
            .send(DriverMessage::Channel { epoch: self.epoch, event })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One open (or opening) channel bound to a single identity
pub trait Channel: Send + Sync {
    /// Identity the channel was created for; fixed for its lifetime
    fn identity(&self) -> &str;

    /// Emit without waiting for anything back
    fn emit(&mut self, event: EventName, payload: Value) -> Result<(), TransportError>;

    /// Emit and resolve `ack` with whatever the server acknowledges.
    /// The channel must either resolve `ack` or drop it.
    fn emit_with_ack(&mut self, event: EventName, payload: Value, ack: AckResponder);

    /// Close the channel. Must not report `Disconnected` afterwards.
    fn close(&mut self);
}

pub trait Connector: Send + Sync {
    fn open(&self, identity: &str, events: ChannelEventSender) -> Result<Box<dyn Channel>, TransportError>;
}
