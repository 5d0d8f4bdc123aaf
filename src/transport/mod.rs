// Real-time transport for the messaging core
// Owns the connection to the event server: reconnect backoff, circuit
// breaker, acknowledged and fire-and-forget sends, inbound dispatch.

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

pub mod backoff;
pub mod channel;
pub mod circuit;
pub mod connection;
pub mod events;
pub mod websocket;

pub use channel::{Channel, ChannelEvent, ChannelEventSender, Connector, DisconnectReason};
pub use connection::{ConnectionState, ConnectionStatus};
pub use events::*;
pub use websocket::WebSocketConnector;

use crate::config::TransportConfig;
use crate::error::TransportError;
use connection::{Command, ConnectionDriver, DriverMessage};

/// Capacity of the subscriber event queue
const EVENT_QUEUE_CAPACITY: usize = 100;

/// The sending side the conversation store needs from a transport
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send a chat message and wait for the server acknowledgement
    async fn send_message(&self, message: &OutgoingMessage) -> Result<Ack, TransportError>;

    fn send_typing(&self, signal: &TypingSignal);

    fn send_read_receipt(&self, receipt: &ReadReceipt);
}

struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverMessage>,
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        // Last handle gone: stop the driver, which closes the channel and timers
        let _ = self.tx.send(DriverMessage::Command(Command::Shutdown));
    }
}

/// Handle to the transport. Cheap to clone; the connection itself is
/// owned by a background driver task that stops when the last handle drops.
#[derive(Clone)]
pub struct TransportConnection {
    handle: Arc<DriverHandle>,
    status_rx: watch::Receiver<ConnectionStatus>,
    ack_timeout: Duration,
}

impl TransportConnection {
    /// Spawn the driver. Inbound events and status changes arrive on the
    /// returned receiver. Must be called inside a tokio runtime.
    pub fn new(config: TransportConfig, connector: Arc<dyn Connector>) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::idle());
        let ack_timeout = config.ack_timeout();

        let driver = ConnectionDriver::new(config, connector, loop_tx.clone(), status_tx, event_tx);
        tokio::spawn(driver.run(loop_rx));

        (
            Self {
                handle: Arc::new(DriverHandle { tx: loop_tx }),
                status_rx,
                ack_timeout,
            },
            event_rx,
        )
    }

    fn command(&self, command: Command) -> bool {
        let sent = self.handle.tx.send(DriverMessage::Command(command)).is_ok();
        if !sent {
            error!("Transport driver is gone");
        }
        sent
    }

    /// Bind to `identity` and start connecting. A different identity than
    /// the current one tears the old channel down first.
    pub fn connect(&self, identity: &str) {
        self.command(Command::Connect(identity.to_string()));
    }

    /// Manual retry; ignored while connected or while the circuit is open
    pub fn retry_connection(&self) {
        self.command(Command::RetryConnection);
    }

    /// Close the circuit and clear the failure counter without reconnecting
    pub fn reset_circuit(&self) {
        self.command(Command::ResetCircuit);
    }

    /// Drop the identity, close the channel and cancel every timer.
    /// Idempotent. Used on logout and on shutdown.
    pub fn teardown(&self) {
        self.command(Command::Teardown);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Emit `event` and wait for the acknowledgement, at most `timeout`
    /// (the configured ack timeout when `None`). Resolves with the raw
    /// ack payload, which must carry `received: true`.
    pub async fn send_ack(
        &self,
        event: EventName,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, TransportError> {
        let status = self.status();
        if !status.is_connected() || status.circuit_open() {
            error!("Cannot send {}: not connected or circuit open", event);
            return Err(TransportError::NotConnected);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if !self.command(Command::EmitWithAck {
            event,
            payload,
            ack: ack_tx,
        }) {
            return Err(TransportError::Shutdown);
        }

        let wait = timeout.unwrap_or(self.ack_timeout);
        let raw = match tokio::time::timeout(wait, ack_rx).await {
            Err(_) => {
                warn!("No acknowledgement for {} within {:?}", event, wait);
                return Err(TransportError::AckTimeout(wait));
            }
            Ok(Err(_)) => return Err(TransportError::ChannelClosed),
            Ok(Ok(result)) => result?,
        };

        match serde_json::from_value::<Ack>(raw.clone()) {
            Ok(ack) if ack.received => {
                debug!("{} acknowledged", event);
                Ok(raw)
            }
            _ => {
                warn!("Invalid acknowledgement for {}: {}", event, raw);
                Err(TransportError::InvalidAck(raw.to_string()))
            }
        }
    }

    /// Emit without acknowledgement. Logs and does nothing unless connected.
    pub fn send_fire_and_forget(&self, event: EventName, payload: Value) {
        let status = self.status();
        if !status.is_connected() || status.circuit_open() {
            warn!("Cannot send {}: not connected or circuit open", event);
            return;
        }
        self.command(Command::Emit { event, payload });
    }

    fn emit_serialized<T: Serialize>(&self, event: EventName, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.send_fire_and_forget(event, value),
            Err(e) => error!("Failed to encode {} payload: {}", event, e),
        }
    }
}

#[async_trait]
impl MessageTransport for TransportConnection {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<Ack, TransportError> {
        let payload = serde_json::to_value(message)?;
        let raw = self.send_ack(EventName::Message, payload, None).await?;
        serde_json::from_value(raw.clone()).map_err(|_| TransportError::InvalidAck(raw.to_string()))
    }

    fn send_typing(&self, signal: &TypingSignal) {
        self.emit_serialized(EventName::Typing, signal);
    }

    fn send_read_receipt(&self, receipt: &ReadReceipt) {
        self.emit_serialized(EventName::ReadReceipt, receipt);
    }
}
