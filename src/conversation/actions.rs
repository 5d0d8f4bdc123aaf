// User-driven actions on the conversation store

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use super::collaborators::merge_saved;
use super::ConversationStore;
use crate::models::{Conversation, DeliveryStatus, FileUpload, Message, MessageKind, Role, TabKey};
use crate::transport::{OutgoingMessage, ReadReceipt, SignalType, TypingSignal};

impl ConversationStore {
    /// Make `conversation_id` active, clear the matching unread counter and
    /// mark whatever the counterpart sent as read
    pub async fn select_conversation(&self, conversation_id: &str) {
        let (receipt, read_at) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(me) = state.current_user.clone() else {
                warn!("SelectConversation: no current user");
                return;
            };
            state.active = Some(conversation_id.to_string());

            let Some(role) = state.conversation(conversation_id).map(|c| c.role_of(&me)) else {
                warn!("SelectConversation: conversation {} not found", conversation_id);
                return;
            };
            match role {
                Some(role) => state.clear_unread(role),
                None => warn!("SelectConversation: not a participant of {}", conversation_id),
            }

            let Some(conversation) = state.conversation_mut(conversation_id) else {
                return;
            };
            let counterpart = conversation.counterpart(&me).map(|p| p.user_id.clone());
            let unread_ids: Vec<String> = conversation
                .messages
                .iter()
                .filter(|m| !m.is_read && Some(&m.sender_id) == counterpart.as_ref())
                .map(|m| m.id.clone())
                .collect();
            if unread_ids.is_empty() {
                debug!("No unread messages in {}", conversation_id);
                return;
            }

            let now = Utc::now();
            for message in conversation.messages.iter_mut().filter(|m| unread_ids.contains(&m.id)) {
                message.mark_read(now);
            }
            conversation.recompute_unread(&me);
            info!("Marked {} messages read in {}", unread_ids.len(), conversation_id);

            let receipt = counterpart.map(|receiver_id| ReadReceipt {
                conversation_id: conversation_id.to_string(),
                receiver_id,
                sender_id: me,
                timestamp: now,
                message_ids: unread_ids,
            });
            (receipt, now)
        };

        if let Some(receipt) = receipt {
            self.transport.send_read_receipt(&receipt);
        }
        if let Err(e) = self.collaborators.read_state.persist_read(conversation_id, read_at).await {
            error!("Failed to persist read state for {}: {}", conversation_id, e);
        }
    }

    /// Optimistically append a message to the active conversation, then
    /// deliver it over the transport or the durable fallback. Returns the
    /// client id of the new message, or `None` when nothing was sent.
    pub async fn send_message(&self, content: &str, file: Option<FileUpload>) -> Option<String> {
        let outgoing = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(me) = state.current_user.clone() else {
                warn!("SendMessage: no current user");
                return None;
            };
            let Some(active) = state.active.clone() else {
                warn!("SendMessage: no active conversation");
                return None;
            };
            let Some(conversation) = state.conversation_mut(&active) else {
                warn!("SendMessage: active conversation {} not found", active);
                return None;
            };
            let Some((mine, other)) = conversation.resolve_parties(&me) else {
                warn!("SendMessage: cannot resolve participants of {}", active);
                return None;
            };

            let file = file.unwrap_or_default();
            let kind = if file.url.is_some() {
                MessageKind::File
            } else {
                MessageKind::Message
            };
            let timestamp = Utc::now();
            let outgoing = OutgoingMessage {
                id: format!("msg_{}", Uuid::new_v4()),
                content: content.to_string(),
                conversation_id: active.clone(),
                sender_id: me.clone(),
                receiver_id: other.user_id.clone(),
                sender_role: mine.role,
                kind,
                timestamp,
                delivery_status: DeliveryStatus::Sending,
                pending: true,
                img_url: file.url,
                file_name: file.name,
                file_key: file.key,
                file_type: file.file_type,
            };

            conversation.messages.push(Message {
                id: outgoing.id.clone(),
                content: outgoing.content.clone(),
                sender_id: me,
                receiver_id: outgoing.receiver_id.clone(),
                conversation_id: active,
                sender_role: Some(outgoing.sender_role),
                kind,
                img_url: outgoing.img_url.clone(),
                file_name: outgoing.file_name.clone(),
                file_key: outgoing.file_key.clone(),
                file_type: outgoing.file_type.clone(),
                created_at: timestamp,
                updated_at: None,
                delivery_status: DeliveryStatus::Sending,
                delivered_at: None,
                confirmed_delivery_at: None,
                pending: true,
                failed: false,
                is_read: false,
            });
            outgoing
        };
        debug!("Appended optimistic message {}", outgoing.id);

        match self.transport.send_message(&outgoing).await {
            Ok(ack) => {
                info!("Message {} acknowledged", outgoing.id);
                self.update_message(&outgoing.conversation_id, &outgoing.id, |message| {
                    message.pending = false;
                    message.advance_status(DeliveryStatus::Delivered);
                    message.delivered_at = Some(ack.timestamp.unwrap_or_else(Utc::now));
                })
                .await;
            }
            Err(e) => {
                warn!("Transport send of {} failed ({}), trying durable fallback", outgoing.id, e);
                match self.collaborators.fallback.create_message(&outgoing).await {
                    Ok(saved) => {
                        info!("Message {} saved through fallback", outgoing.id);
                        self.update_message(&outgoing.conversation_id, &outgoing.id, |message| {
                            merge_saved(message, &saved)
                        })
                        .await;
                    }
                    Err(e) => {
                        error!("Message {} could not be delivered: {}", outgoing.id, e);
                        self.update_message(&outgoing.conversation_id, &outgoing.id, |message| {
                            message.pending = false;
                            if message.advance_status(DeliveryStatus::Failed) {
                                message.failed = true;
                            }
                        })
                        .await;
                    }
                }
            }
        }
        Some(outgoing.id)
    }

    async fn update_message<F>(&self, conversation_id: &str, message_id: &str, update: F)
    where
        F: FnOnce(&mut Message),
    {
        let mut state = self.state.lock().await;
        match state
            .conversation_mut(conversation_id)
            .and_then(|c| c.message_mut(message_id))
        {
            Some(message) => update(message),
            None => debug!("Message {} is gone from {}, nothing to update", message_id, conversation_id),
        }
    }

    pub async fn send_typing(&self, is_typing: bool) {
        let signal = {
            let state = self.state.lock().await;
            let Some(me) = state.current_user.as_deref() else {
                warn!("SendTyping: no current user");
                return;
            };
            let Some(active) = state.active.as_deref() else {
                warn!("SendTyping: no active conversation");
                return;
            };
            let Some((mine, other)) = state.conversation(active).and_then(|c| c.resolve_parties(me)) else {
                warn!("SendTyping: cannot resolve participants of {}", active);
                return;
            };
            TypingSignal {
                kind: SignalType::Typing,
                is_typing,
                conversation_id: active.to_string(),
                sender_id: me.to_string(),
                receiver_id: other.user_id.clone(),
                sender_role: mine.role,
                timestamp: Utc::now(),
            }
        };
        self.transport.send_typing(&signal);
    }

    /// Create a conversation with `counterpart`. The current user takes
    /// the host role. Returns `None` on failure or without a current user.
    pub async fn create_conversation(&self, counterpart: &str) -> Option<Conversation> {
        if self.state.lock().await.current_user.is_none() {
            warn!("CreateConversation: no current user");
            return None;
        }

        let created = match self
            .collaborators
            .conversations
            .create_conversation(counterpart, Role::Host, Role::Tenant)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                error!("Failed to create conversation with {}: {}", counterpart, e);
                return None;
            }
        };

        let mut state = self.state.lock().await;
        if let Some(existing) = state.conversation(&created.id) {
            debug!("Conversation {} already present", created.id);
            return Some(existing.clone());
        }
        let conversation = Conversation {
            id: created.id,
            participants: created.participants,
            messages: Vec::new(),
            is_unread: false,
        };
        info!("Conversation {} created with {}", conversation.id, counterpart);
        state.conversations.push(conversation.clone());
        Some(conversation)
    }

    /// Returns whether the conversation was deleted
    pub async fn delete_conversation(&self, conversation_id: &str) -> bool {
        if let Err(e) = self.collaborators.conversations.delete_conversation(conversation_id).await {
            error!("Failed to delete conversation {}: {}", conversation_id, e);
            return false;
        }
        self.remove_local(&[conversation_id.to_string()]).await;
        info!("Conversation {} deleted", conversation_id);
        true
    }

    /// Attempt every deletion; keep whatever failed. Returns the deleted ids.
    pub async fn delete_all_conversations(&self) -> Vec<String> {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.conversations.iter().map(|c| c.id.clone()).collect()
        };

        let mut deleted = Vec::with_capacity(ids.len());
        for id in ids {
            match self.collaborators.conversations.delete_conversation(&id).await {
                Ok(()) => deleted.push(id),
                Err(e) => error!("Failed to delete conversation {}: {}", id, e),
            }
        }

        self.remove_local(&deleted).await;
        info!("Deleted {} conversations", deleted.len());
        deleted
    }

    async fn remove_local(&self, removed: &[String]) {
        let mut state = self.state.lock().await;
        state.conversations.retain(|c| !removed.contains(&c.id));
        if state.active.as_ref().map_or(false, |active| removed.contains(active)) {
            state.active = None;
        }
        state.purge_typing(removed);
    }

    pub async fn change_tab(&self, tab: TabKey) {
        debug!("Tab changed to {:?}", tab);
        self.state.lock().await.tab = tab;
    }
}
