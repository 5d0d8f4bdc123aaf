use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role a participant holds inside one conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Host,
    Tenant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "Host",
            Role::Tenant => "Tenant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending = 1,   // Optimistically shown, not yet confirmed
    Sent = 2,      // Accepted by the channel
    Delivered = 3, // Confirmed by the server or the durable fallback
    Read = 4,      // Read by the counterpart (terminal)
    Failed = 5,    // Transport and fallback both failed (terminal)
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Read | DeliveryStatus::Failed)
    }

    /// Whether moving from `self` to `next` goes forward.
    /// Staying in the same status is allowed and is a no-op.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        if *self == next {
            return true;
        }
        match (self, next) {
            (Read, _) | (Failed, _) => false,
            (Delivered, Read) => true,
            (Delivered, _) => false,
            (Sending, _) => true,
            (Sent, Sending) => false,
            (Sent, _) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    File,
}

/// A file picked by the user to go along with a message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileUpload {
    pub url: Option<String>,
    pub name: Option<String>,
    pub key: Option<String>,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub conversation_id: String,
    pub sender_role: Option<Role>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confirmed_delivery_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub is_read: bool,
}

impl Message {
    /// Move the delivery status forward. Returns false when the move
    /// would go backwards or leave a terminal status.
    pub fn advance_status(&mut self, next: DeliveryStatus) -> bool {
        if self.delivery_status.can_transition_to(next) {
            self.delivery_status = next;
            true
        } else {
            false
        }
    }

    pub fn mark_read(&mut self, at: DateTime<Utc>) {
        // A failed message keeps its status but still counts as seen
        self.advance_status(DeliveryStatus::Read);
        self.is_read = true;
        self.updated_at = Some(at);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub profile: Profile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub is_unread: bool,
}

impl Conversation {
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.role)
    }

    pub fn counterpart(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id != user_id)
    }

    /// Resolve `(me, counterpart)` for a two-party conversation
    pub fn resolve_parties(&self, user_id: &str) -> Option<(&Participant, &Participant)> {
        if self.participants.len() != 2 {
            return None;
        }
        let me = self.participants.iter().find(|p| p.user_id == user_id)?;
        let other = self.counterpart(user_id)?;
        Some((me, other))
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    pub fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }

    /// Ids of messages from anyone but `user_id` that are still unread
    pub fn unread_from_others(&self, user_id: &str) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.sender_id != user_id && !m.is_read)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn recompute_unread(&mut self, user_id: &str) {
        self.is_unread = self
            .messages
            .iter()
            .any(|m| m.sender_id != user_id && !m.is_read);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypingEntry {
    pub is_typing: bool,
    pub timestamp: DateTime<Utc>,
}

/// Conversation list filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TabKey {
    #[default]
    All,
    Host,
    Tenant,
}

impl TabKey {
    pub fn role(&self) -> Option<Role> {
        match self {
            TabKey::All => None,
            TabKey::Host => Some(Role::Host),
            TabKey::Tenant => Some(Role::Tenant),
        }
    }
}

impl FromStr for TabKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(TabKey::All),
            "host" => Ok(TabKey::Host),
            "tenant" => Ok(TabKey::Tenant),
            other => Err(format!("Unknown tab '{}'", other)),
        }
    }
}
