// Connection management for the transport
// The driver below is the single owner of the channel, the counters and
// the reconnect/circuit timers. Commands, channel events and timer
// firings all arrive on one queue and are handled one at a time.

use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::backoff::BackoffPolicy;
use super::channel::{AckResponder, Channel, ChannelEvent, ChannelEventSender, Connector, DisconnectReason};
use super::circuit::CircuitBreaker;
use super::events::{decode_inbound, EventName, TransportEvent};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::timers::TimerTable;

/// Enum for representing connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    CircuitOpen,
}

/// Snapshot published on every state or counter change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub failure_count: u32,
    pub retry_count: u32,
}

impl ConnectionStatus {
    pub fn idle() -> Self {
        ConnectionStatus {
            state: ConnectionState::Idle,
            failure_count: 0,
            retry_count: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn circuit_open(&self) -> bool {
        self.state == ConnectionState::CircuitOpen
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    Reconnect,
    CircuitReset,
}

pub(crate) enum Command {
    Connect(String),
    RetryConnection,
    ResetCircuit,
    Emit { event: EventName, payload: Value },
    EmitWithAck { event: EventName, payload: Value, ack: AckResponder },
    Teardown,
    Shutdown,
}

pub(crate) enum DriverMessage {
    Command(Command),
    Channel { epoch: u64, event: ChannelEvent },
    Timer { key: TimerKey, generation: u64 },
}

pub(crate) struct ConnectionDriver {
    backoff: BackoffPolicy,
    breaker: CircuitBreaker,
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    identity: Option<String>,
    channel: Option<Box<dyn Channel>>,
    // Bumped whenever the current channel is replaced or dropped
    epoch: u64,
    // Retry index of the attempt that created the current channel
    attempt_retry: u32,
    retry_count: u32,
    state: ConnectionState,
    timers: TimerTable<TimerKey>,
    loop_tx: mpsc::UnboundedSender<DriverMessage>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl ConnectionDriver {
    pub(crate) fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        loop_tx: mpsc::UnboundedSender<DriverMessage>,
        status_tx: watch::Sender<ConnectionStatus>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            backoff: BackoffPolicy::from_config(&config),
            breaker: CircuitBreaker::new(config.max_failures),
            config,
            connector,
            identity: None,
            channel: None,
            epoch: 0,
            attempt_retry: 0,
            retry_count: 0,
            state: ConnectionState::Idle,
            timers: TimerTable::new(),
            loop_tx,
            status_tx,
            event_tx,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DriverMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                DriverMessage::Command(Command::Shutdown) => {
                    info!("Transport shutting down");
                    self.teardown().await;
                    break;
                }
                DriverMessage::Command(command) => self.handle_command(command).await,
                DriverMessage::Channel { epoch, event } => {
                    if epoch != self.epoch {
                        debug!("Ignoring {:?} from stale channel (epoch {} != {})", event, epoch, self.epoch);
                        continue;
                    }
                    self.handle_channel_event(event).await;
                }
                DriverMessage::Timer { key, generation } => {
                    if !self.timers.complete(&key, generation) {
                        debug!("Ignoring stale {:?} timer (generation {})", key, generation);
                        continue;
                    }
                    self.handle_timer(key).await;
                }
            }
        }
        debug!("Transport driver loop ended");
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            failure_count: self.breaker.failures(),
            retry_count: self.retry_count,
        }
    }

    async fn publish(&mut self) {
        let status = self.status();
        if *self.status_tx.borrow() == status {
            return;
        }
        debug!("Connection status: {:?}", status);
        self.status_tx.send_replace(status.clone());
        self.forward(TransportEvent::StatusChanged(status)).await;
    }

    async fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.publish().await;
    }

    async fn forward(&self, event: TransportEvent) {
        let tx = self.event_tx.clone();
        if let Err(e) = tx.send(event).await {
            debug!("No subscriber for transport event: {}", e);
        }
    }

    fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            debug!("Closing channel for {}", channel.identity());
            channel.close();
        }
        self.epoch += 1;
    }

    fn can_send(&self) -> bool {
        self.state == ConnectionState::Connected && !self.breaker.is_open() && self.channel.is_some()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(identity) => self.connect(identity).await,
            Command::RetryConnection => self.retry_connection().await,
            Command::ResetCircuit => self.reset_circuit().await,
            Command::Emit { event, payload } => {
                if !self.can_send() {
                    warn!("Cannot send {}: channel not connected or circuit open", event);
                    return;
                }
                if let Some(channel) = self.channel.as_mut() {
                    debug!("Emitting {} event", event);
                    if let Err(e) = channel.emit(event, payload) {
                        error!("Failed to emit {} event: {}", event, e);
                    }
                }
            }
            Command::EmitWithAck { event, payload, ack } => {
                if !self.can_send() {
                    let _ = ack.send(Err(TransportError::NotConnected));
                    return;
                }
                match self.channel.as_mut() {
                    Some(channel) => {
                        debug!("Emitting {} event with acknowledgement", event);
                        channel.emit_with_ack(event, payload, ack);
                    }
                    None => {
                        let _ = ack.send(Err(TransportError::NotConnected));
                    }
                }
            }
            Command::Teardown => self.teardown().await,
            // Handled by the loop itself
            Command::Shutdown => {}
        }
    }

    async fn connect(&mut self, identity: String) {
        let identity_changed = self.identity.as_deref().map_or(false, |current| current != identity)
            || self.channel.as_ref().map_or(false, |c| c.identity() != identity);
        if identity_changed {
            info!("Identity changed to {}, tearing down the old channel", identity);
            self.reset_session().await;
        }
        self.identity = Some(identity);

        match self.state {
            ConnectionState::Connected => {
                debug!("Already connected");
                return;
            }
            ConnectionState::Connecting => {
                debug!("Connection attempt already in progress");
                return;
            }
            _ => {}
        }
        if self.breaker.is_open() {
            info!("Circuit breaker is open, connection attempt halted");
            return;
        }
        self.connect_with_backoff(self.retry_count).await;
    }

    async fn connect_with_backoff(&mut self, retry: u32) {
        let Some(identity) = self.identity.clone() else {
            debug!("No identity, skipping connection");
            return;
        };
        if self.state == ConnectionState::Connected && self.channel.is_some() {
            debug!("Already connected");
            return;
        }
        if self.breaker.is_open() {
            info!("Circuit breaker is open, connection attempt halted");
            return;
        }

        if self.backoff.retries_exhausted(retry) {
            info!("Maximum connection attempts ({}) reached, stopping", self.backoff.max_retries);
            self.state = ConnectionState::Disconnected;
            if self.breaker.record_failure() {
                self.open_circuit().await;
            } else {
                self.publish().await;
            }
            return;
        }

        let delay = self.backoff.delay_for_attempt(retry, &mut rand::thread_rng());
        info!(
            "Connection attempt {}/{} for {} in {:?}",
            retry + 1,
            self.backoff.max_retries,
            identity,
            delay
        );
        self.retry_count = retry;
        self.set_state(ConnectionState::Connecting).await;

        let tx = self.loop_tx.clone();
        self.timers.arm(TimerKey::Reconnect, delay, move |generation| async move {
            let _ = tx.send(DriverMessage::Timer {
                key: TimerKey::Reconnect,
                generation,
            });
        });
    }

    /// The reconnect timer fired: replace whatever channel exists with a fresh one
    async fn attempt(&mut self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        if self.breaker.is_open() {
            return;
        }

        self.close_channel();
        self.attempt_retry = self.retry_count;
        let events = ChannelEventSender::new(self.epoch, self.loop_tx.clone());
        match self.connector.open(&identity, events) {
            Ok(channel) => {
                debug!("Channel created for {} (epoch {})", identity, self.epoch);
                self.channel = Some(channel);
            }
            Err(e) => {
                error!("Failed to create channel: {}", e);
                self.on_connect_failure().await;
            }
        }
    }

    async fn on_connect_failure(&mut self) {
        self.close_channel();
        self.state = ConnectionState::Disconnected;
        if self.breaker.record_failure() {
            self.open_circuit().await;
            return;
        }
        self.publish().await;
        self.connect_with_backoff(self.attempt_retry + 1).await;
    }

    async fn open_circuit(&mut self) {
        self.timers.cancel(&TimerKey::Reconnect);
        self.close_channel();
        let reset_delay = self.config.circuit_reset_delay();
        warn!("Circuit open, halting connection attempts for {:?}", reset_delay);
        self.set_state(ConnectionState::CircuitOpen).await;

        let tx = self.loop_tx.clone();
        self.timers.arm(TimerKey::CircuitReset, reset_delay, move |generation| async move {
            let _ = tx.send(DriverMessage::Timer {
                key: TimerKey::CircuitReset,
                generation,
            });
        });
    }

    async fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Reconnect => self.attempt().await,
            TimerKey::CircuitReset => {
                info!("Circuit reset delay elapsed, closing circuit and reconnecting");
                self.breaker.reset();
                self.retry_count = 0;
                if self.identity.is_some() {
                    self.state = ConnectionState::Disconnected;
                    self.connect_with_backoff(0).await;
                } else {
                    self.set_state(ConnectionState::Idle).await;
                }
            }
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                info!("Connected as {}", self.identity.as_deref().unwrap_or("<none>"));
                self.retry_count = 0;
                self.breaker.record_success();
                self.set_state(ConnectionState::Connected).await;
            }
            ChannelEvent::Disconnected(reason) => {
                warn!("Disconnected, reason: \"{}\"", reason.as_str());
                self.close_channel();
                if reason.is_retryable() && !self.breaker.is_open() {
                    info!("Disconnect reason \"{}\" warrants a retry", reason.as_str());
                    self.set_state(ConnectionState::Disconnected).await;
                    self.connect_with_backoff(self.retry_count + 1).await;
                } else if reason == DisconnectReason::ClientDisconnect {
                    info!("Disconnected locally, no automatic retry");
                    self.set_state(ConnectionState::Idle).await;
                } else {
                    info!("Disconnect reason \"{}\" does not trigger a retry", reason.as_str());
                    self.set_state(ConnectionState::Disconnected).await;
                }
            }
            ChannelEvent::ConnectError(message) => {
                error!("Connection error: {}", message);
                self.on_connect_failure().await;
            }
            ChannelEvent::Pong(latency) => {
                debug!("Pong received, latency {:?}", latency);
                if self.breaker.failures() > 0 && !self.breaker.is_open() {
                    self.breaker.record_success();
                    self.publish().await;
                }
            }
            ChannelEvent::Inbound { name, data } => {
                debug!("Inbound {} event", name);
                match decode_inbound(name, data) {
                    Ok(event) => self.forward(event).await,
                    Err(e) => warn!("Dropping malformed {} event: {}", name, e),
                }
            }
        }
    }

    async fn retry_connection(&mut self) {
        if self.state == ConnectionState::Connected || self.breaker.is_open() {
            info!("Manual retry skipped: already connected or circuit is open");
            return;
        }
        if self.identity.is_none() {
            info!("Manual retry skipped: no identity");
            return;
        }
        info!("Manual retry triggered");
        self.timers.cancel(&TimerKey::Reconnect);
        self.retry_count = 0;
        self.connect_with_backoff(0).await;
    }

    async fn reset_circuit(&mut self) {
        self.timers.cancel(&TimerKey::CircuitReset);
        if self.breaker.reset() {
            self.state = if self.identity.is_some() {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Idle
            };
        }
        self.publish().await;
    }

    /// Drop the channel, the timers and the counters. Identity is kept.
    async fn reset_session(&mut self) {
        self.timers.cancel_all();
        self.close_channel();
        self.breaker.reset();
        self.retry_count = 0;
        self.attempt_retry = 0;
        self.set_state(ConnectionState::Idle).await;
    }

    async fn teardown(&mut self) {
        if self.identity.is_none() && self.channel.is_none() && self.timers.is_empty() {
            self.set_state(ConnectionState::Idle).await;
            return;
        }
        info!("Tearing down transport");
        self.identity = None;
        self.reset_session().await;
    }
}
