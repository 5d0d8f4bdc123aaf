// External services the conversation store leans on

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;

use crate::models::{Conversation, DeliveryStatus, Message, Participant, Profile, Role};
use crate::transport::OutgoingMessage;

/// Durable create-message path used when the real-time send fails
#[async_trait]
pub trait MessageFallback: Send + Sync {
    async fn create_message(&self, payload: &OutgoingMessage) -> Result<Message>;
}

#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Create (or look up) the conversation between the current user and
    /// `counterpart`, with the two canonical roles
    async fn create_conversation(&self, counterpart: &str, first_role: Role, second_role: Role) -> Result<Conversation>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ReadStatePersister: Send + Sync {
    async fn persist_read(&self, conversation_id: &str, read_at: DateTime<Utc>) -> Result<()>;
}

/// The full set of collaborators handed to a store
#[derive(Clone)]
pub struct Collaborators {
    pub fallback: Arc<dyn MessageFallback>,
    pub conversations: Arc<dyn ConversationService>,
    pub read_state: Arc<dyn ReadStatePersister>,
}

/// Collaborators for running without a backend: conversations are built
/// locally, read state is only logged, the durable fallback is unavailable.
pub struct LocalCollaborators {
    current_user: String,
}

impl LocalCollaborators {
    pub fn new(current_user: &str) -> Self {
        Self {
            current_user: current_user.to_string(),
        }
    }

    pub fn into_collaborators(self) -> Collaborators {
        let shared = Arc::new(self);
        Collaborators {
            fallback: shared.clone(),
            conversations: shared.clone(),
            read_state: shared,
        }
    }
}

#[async_trait]
impl MessageFallback for LocalCollaborators {
    async fn create_message(&self, payload: &OutgoingMessage) -> Result<Message> {
        Err(anyhow!("No durable message store configured, cannot save {}", payload.id))
    }
}

#[async_trait]
impl ConversationService for LocalCollaborators {
    async fn create_conversation(&self, counterpart: &str, first_role: Role, second_role: Role) -> Result<Conversation> {
        if counterpart.trim().is_empty() || counterpart == self.current_user {
            return Err(anyhow!("Invalid counterpart {:?}", counterpart));
        }
        let participant = |user_id: &str, role: Role| Participant {
            user_id: user_id.to_string(),
            role,
            profile: Profile {
                id: user_id.to_string(),
                ..Default::default()
            },
        };
        let conversation = Conversation {
            id: format!("conv_{}", uuid::Uuid::new_v4()),
            participants: vec![
                participant(&self.current_user, first_role),
                participant(counterpart, second_role),
            ],
            messages: Vec::new(),
            is_unread: false,
        };
        info!("Created local conversation {} with {}", conversation.id, counterpart);
        Ok(conversation)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        debug!("Deleting local conversation {}", conversation_id);
        Ok(())
    }
}

#[async_trait]
impl ReadStatePersister for LocalCollaborators {
    async fn persist_read(&self, conversation_id: &str, read_at: DateTime<Utc>) -> Result<()> {
        debug!("Conversation {} read at {}", conversation_id, read_at);
        Ok(())
    }
}

/// Fold the canonical fields a durable save returns into the optimistic
/// message. The client id stays.
pub fn merge_saved(message: &mut Message, saved: &Message) {
    message.created_at = saved.created_at;
    if saved.updated_at.is_some() {
        message.updated_at = saved.updated_at;
    }
    if saved.delivered_at.is_some() {
        message.delivered_at = saved.delivered_at;
    }
    if saved.img_url.is_some() {
        message.img_url = saved.img_url.clone();
    }
    message.pending = false;
    message.failed = false;
    message.advance_status(DeliveryStatus::Delivered);
}
