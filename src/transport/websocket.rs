// WebSocket implementation of the event channel
//
// Frames are JSON text envelopes: `{"event": name, "data": payload}` for
// events, with an `ackId` when the sender wants an acknowledgement, and
// `{"ackId": n, "data": ack}` for the acknowledgement itself.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use super::channel::{AckResponder, Channel, ChannelEvent, ChannelEventSender, Connector, DisconnectReason};
use super::events::EventName;
use crate::config::TransportConfig;
use crate::error::TransportError;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
    ack_id: Option<u64>,
}

/// A decoded inbound text frame
#[derive(Debug, PartialEq)]
enum Frame {
    Event { name: EventName, data: Value },
    Ack { id: u64, data: Value },
    Ignored(String),
}

fn encode_frame(event: EventName, data: Value, ack_id: Option<u64>) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        event: Some(event.as_str().to_string()),
        data,
        ack_id,
    })
}

fn decode_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("event").is_none() && value.get("ackId").is_none() {
        // Bare payload, routed by its `type` tag
        return Ok(match value.get("type").and_then(Value::as_str) {
            Some("ping") | Some("error") | Some("connection") => Frame::Ignored(text.to_string()),
            _ => Frame::Event {
                name: EventName::Message,
                data: value,
            },
        });
    }

    let envelope: Envelope = serde_json::from_value(value)?;
    match (envelope.event, envelope.ack_id) {
        (Some(name), _) => match EventName::parse(&name) {
            Some(name) => Ok(Frame::Event {
                name,
                data: envelope.data,
            }),
            None => Ok(Frame::Ignored(name)),
        },
        (None, Some(id)) => Ok(Frame::Ack {
            id,
            data: envelope.data,
        }),
        (None, None) => Ok(Frame::Ignored(text.to_string())),
    }
}

enum Outbound {
    Text { text: String, ack: Option<(u64, AckResponder)> },
    Close,
}

/// Opens one WebSocket per connection attempt
pub struct WebSocketConnector {
    base_url: Url,
    ping_interval: Duration,
    ping_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(server_url: &str, config: &TransportConfig) -> Result<Self, TransportError> {
        let base_url = Url::parse(server_url)
            .map_err(|e| TransportError::Connect(format!("Invalid server URL {}: {}", server_url, e)))?;
        match base_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::Connect(format!(
                    "Unsupported URL scheme {}, expected ws or wss",
                    other
                )))
            }
        }
        Ok(Self {
            base_url,
            ping_interval: config.ping_interval(),
            ping_timeout: config.ping_timeout(),
        })
    }

    fn url_for(&self, identity: &str) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("userId", identity)
            .append_pair("client", "web");
        url
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, identity: &str, events: ChannelEventSender) -> Result<Box<dyn Channel>, TransportError> {
        let url = self.url_for(identity);
        info!("Opening WebSocket to {}", url);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url, out_rx, events, self.ping_interval, self.ping_timeout));
        Ok(Box::new(WebSocketChannel {
            identity: identity.to_string(),
            out_tx,
            next_ack_id: 0,
            closed: false,
        }))
    }
}

pub struct WebSocketChannel {
    identity: String,
    out_tx: mpsc::UnboundedSender<Outbound>,
    next_ack_id: u64,
    closed: bool,
}

impl Channel for WebSocketChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn emit(&mut self, event: EventName, payload: Value) -> Result<(), TransportError> {
        let text = encode_frame(event, payload, None)?;
        self.out_tx
            .send(Outbound::Text { text, ack: None })
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn emit_with_ack(&mut self, event: EventName, payload: Value, ack: AckResponder) {
        self.next_ack_id += 1;
        let id = self.next_ack_id;
        let text = match encode_frame(event, payload, Some(id)) {
            Ok(text) => text,
            Err(e) => {
                let _ = ack.send(Err(TransportError::Encode(e)));
                return;
            }
        };
        if let Err(mpsc::error::SendError(Outbound::Text { ack: Some((_, ack)), .. })) =
            self.out_tx.send(Outbound::Text { text, ack: Some((id, ack)) })
        {
            let _ = ack.send(Err(TransportError::ChannelClosed));
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.out_tx.send(Outbound::Close);
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pong_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Callers waiting for an acknowledgement, by ack id. A caller that timed
/// out has dropped its receiver; those entries are pruned on every insert.
#[derive(Default)]
struct AckWaiters {
    waiting: HashMap<u64, AckResponder>,
}

impl AckWaiters {
    fn register(&mut self, id: u64, responder: AckResponder) {
        self.waiting.retain(|_, waiter| !waiter.is_closed());
        self.waiting.insert(id, responder);
    }

    fn resolve(&mut self, id: u64, data: Value) {
        match self.waiting.remove(&id) {
            Some(responder) => {
                if responder.send(Ok(data)).is_err() {
                    debug!("Acknowledgement {} arrived after its caller gave up", id);
                }
            }
            None => debug!("Acknowledgement {} has no waiter", id),
        }
    }

    fn len(&self) -> usize {
        self.waiting.len()
    }
}

async fn run_socket(
    url: Url,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    events: ChannelEventSender,
    ping_interval: Duration,
    ping_timeout: Duration,
) {
    let connect = connect_async(url.as_str());
    tokio::pin!(connect);

    // The driver only emits after `Connected`, which is sent below
    let ws_stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((ws_stream, _)) => break ws_stream,
                Err(e) => {
                    error!("WebSocket connection failed: {}", e);
                    events.send(ChannelEvent::ConnectError(e.to_string()));
                    return;
                }
            },
            command = out_rx.recv() => match command {
                Some(Outbound::Close) | None => {
                    debug!("Channel closed before the handshake finished");
                    return;
                }
                Some(Outbound::Text { ack, .. }) => {
                    warn!("Dropping frame sent before the handshake finished");
                    if let Some((_, responder)) = ack {
                        let _ = responder.send(Err(TransportError::NotConnected));
                    }
                }
            },
        }
    };

    info!("WebSocket connected (epoch {})", events.epoch());
    events.send(ChannelEvent::Connected);

    let (mut write, mut read) = ws_stream.split();
    let mut acks = AckWaiters::default();
    let mut ping_timer = tokio::time::interval(ping_interval);
    // The first tick completes immediately
    ping_timer.tick().await;
    let mut ping_sent: Option<Instant> = None;

    let reason = loop {
        tokio::select! {
            command = out_rx.recv() => match command {
                Some(Outbound::Text { text, ack }) => {
                    if let Some((id, responder)) = ack {
                        acks.register(id, responder);
                        debug!("{} acknowledgements outstanding", acks.len());
                    }
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        warn!("WebSocket write failed: {}", e);
                        break DisconnectReason::TransportError;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("Closing WebSocket (epoch {})", events.epoch());
                    let _ = write.send(WsMessage::Close(None)).await;
                    // Dropping `acks` resolves any waiter with a closed channel
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(WsMessage::Text(text))) => handle_text(&text, &mut acks, &events),
                Some(Ok(WsMessage::Pong(_))) => {
                    if let Some(sent) = ping_sent.take() {
                        events.send(ChannelEvent::Pong(sent.elapsed()));
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!("Server closed the WebSocket: {:?}", frame);
                    break DisconnectReason::ServerDisconnect;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket read failed: {}", e);
                    break DisconnectReason::TransportError;
                }
                None => break DisconnectReason::TransportClose,
            },
            _ = ping_timer.tick() => {
                if ping_sent.is_none() {
                    ping_sent = Some(Instant::now());
                    if let Err(e) = write.send(WsMessage::Ping(Vec::new())).await {
                        warn!("WebSocket ping failed: {}", e);
                        break DisconnectReason::TransportError;
                    }
                }
            }
            _ = pong_deadline(ping_sent.map(|sent| sent + ping_timeout)) => {
                break DisconnectReason::PingTimeout;
            }
        }
    };

    events.send(ChannelEvent::Disconnected(reason));
}

fn handle_text(text: &str, acks: &mut AckWaiters, events: &ChannelEventSender) {
    match decode_frame(text) {
        Ok(Frame::Event { name, data }) => {
            events.send(ChannelEvent::Inbound { name, data });
        }
        Ok(Frame::Ack { id, data }) => acks.resolve(id, data),
        Ok(Frame::Ignored(what)) => debug!("Ignoring frame: {}", what),
        Err(e) => warn!("Undecodable frame: {}", e),
    }
}
