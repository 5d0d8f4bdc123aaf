// Wire payloads exchanged over the event channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::models::{DeliveryStatus, MessageKind, Role};
use super::connection::ConnectionStatus;

/// Named events on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    Message,
    File,
    Typing,
    ReadReceipt,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Message => "message",
            EventName::File => "file",
            EventName::Typing => "typing",
            EventName::ReadReceipt => "read_receipt",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "message" => Some(EventName::Message),
            "file" => Some(EventName::File),
            "typing" => Some(EventName::Typing),
            "read_receipt" => Some(EventName::ReadReceipt),
            _ => None,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound `message` payload, acknowledged by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub id: String,
    pub content: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub sender_role: Role,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Typing,
}

/// Outbound `typing` payload, fire-and-forget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub is_typing: bool,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub sender_role: Role,
    pub timestamp: DateTime<Utc>,
}

/// Outbound `read_receipt` payload, fire-and-forget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: String,
    pub receiver_id: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    pub message_ids: Vec<String>,
}

/// Server acknowledgement of an outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub received: bool,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Inbound `message`/`file` payload. Either a new message from the
/// counterpart or the server echoing our own message back with
/// delivery confirmation fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    pub conversation_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub sender_role: Option<Role>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub img_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_key: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confirmed_delivery_at: Option<DateTime<Utc>>,
}

impl InboundMessage {
    /// Chat kind of this payload; `None` for anything that is not a chat message
    pub fn message_kind(&self) -> Option<MessageKind> {
        match self.kind.as_deref() {
            Some("message") => Some(MessageKind::Message),
            Some("file") => Some(MessageKind::File),
            None => Some(if self.img_url.is_some() { MessageKind::File } else { MessageKind::Message }),
            Some(_) => None,
        }
    }

    pub fn is_delivery_echo(&self, current_user: &str) -> bool {
        self.id.is_some() && self.sender_id == current_user && self.confirmed_delivery_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundTyping {
    pub conversation_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub is_typing: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundReadReceipt {
    pub conversation_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub message_ids: Option<Vec<String>>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// What the transport hands to its single subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StatusChanged(ConnectionStatus),
    Message(InboundMessage),
    Typing(InboundTyping),
    ReadReceipt(InboundReadReceipt),
}

/// Decode an inbound named event into a subscriber event.
///
/// Some servers push every payload on the `message` stream and tag it
/// with a `type` field, so a `message` event typed `typing` or
/// `read_receipt` is routed like the dedicated event would be.
pub fn decode_inbound(event: EventName, data: Value) -> Result<TransportEvent, serde_json::Error> {
    let routed = match event {
        EventName::Message | EventName::File => {
            match data.get("type").and_then(Value::as_str).and_then(EventName::parse) {
                Some(EventName::Typing) => EventName::Typing,
                Some(EventName::ReadReceipt) => EventName::ReadReceipt,
                _ => event,
            }
        }
        other => other,
    };

    Ok(match routed {
        EventName::Message | EventName::File => TransportEvent::Message(serde_json::from_value(data)?),
        EventName::Typing => TransportEvent::Typing(serde_json::from_value(data)?),
        EventName::ReadReceipt => TransportEvent::ReadReceipt(serde_json::from_value(data)?),
    })
}
