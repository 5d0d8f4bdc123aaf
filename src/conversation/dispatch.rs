// Inbound transport events applied to conversation state

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;

use super::{ConversationStore, TYPING_EXPIRY};
use crate::models::{DeliveryStatus, Message, TypingEntry};
use crate::transport::{
    ConnectionStatus, InboundMessage, InboundReadReceipt, InboundTyping, ReadReceipt, TransportEvent,
};

impl ConversationStore {
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StatusChanged(status) => self.on_status_change(status).await,
            TransportEvent::Message(message) => self.on_message(message).await,
            TransportEvent::Typing(typing) => self.on_typing(typing).await,
            TransportEvent::ReadReceipt(receipt) => self.on_read_receipt(receipt).await,
        }
    }

    async fn on_status_change(&self, status: ConnectionStatus) {
        debug!("Connection status changed: {:?}", status);
        self.state.lock().await.connection = status;
    }

    /// A new message from the counterpart, or the server echoing one of
    /// ours back with delivery confirmation
    pub async fn on_message(&self, message: InboundMessage) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(me) = state.current_user.clone() else {
            debug!("No current user, dropping inbound message");
            return;
        };

        if message.is_delivery_echo(&me) {
            let Some(id) = message.id.as_deref() else {
                return;
            };
            let Some(existing) = state
                .conversation_mut(&message.conversation_id)
                .and_then(|c| c.message_mut(id))
            else {
                debug!("Delivery echo for unknown message {}", id);
                return;
            };
            existing.pending = false;
            let status = message.delivery_status.unwrap_or(DeliveryStatus::Delivered);
            if !existing.advance_status(status) {
                debug!("Keeping {:?} for {}, echo reported {:?}", existing.delivery_status, id, status);
            }
            existing.delivered_at = Some(message.delivered_at.unwrap_or_else(Utc::now));
            existing.confirmed_delivery_at = message.confirmed_delivery_at;
            debug!("Delivery confirmed for {}", id);
            return;
        }

        if message.sender_id == me {
            debug!("Ignoring own message without delivery confirmation");
            return;
        }
        let Some(kind) = message.message_kind() else {
            debug!("Ignoring non-chat payload of type {:?}", message.kind);
            return;
        };
        let Some(id) = message.id.clone() else {
            warn!("Inbound message without an id in {}", message.conversation_id);
            return;
        };

        let is_active = state.active.as_deref() == Some(message.conversation_id.as_str());
        let Some(conversation) = state.conversation_mut(&message.conversation_id) else {
            warn!("Inbound message for unknown conversation {}", message.conversation_id);
            return;
        };
        if conversation.contains_message(&id) {
            debug!("Duplicate message {}, skipping", id);
            return;
        }

        let now = Utc::now();
        let mut incoming = Message {
            id: id.clone(),
            content: message.content,
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.unwrap_or_else(|| me.clone()),
            conversation_id: message.conversation_id.clone(),
            sender_role: message.sender_role,
            kind,
            img_url: message.img_url,
            file_name: message.file_name,
            file_key: message.file_key,
            file_type: message.file_type,
            created_at: message.timestamp.unwrap_or(now),
            updated_at: None,
            delivery_status: DeliveryStatus::Delivered,
            delivered_at: message.delivered_at,
            confirmed_delivery_at: None,
            pending: false,
            failed: false,
            is_read: false,
        };

        let from_counterpart = conversation
            .counterpart(&me)
            .map_or(false, |p| p.user_id == incoming.sender_id);
        let receipt = if is_active && from_counterpart {
            incoming.mark_read(now);
            Some(ReadReceipt {
                conversation_id: message.conversation_id.clone(),
                receiver_id: message.sender_id.clone(),
                sender_id: me.clone(),
                timestamp: now,
                message_ids: vec![id.clone()],
            })
        } else {
            None
        };

        let unread = !incoming.is_read;
        let my_role = conversation.role_of(&me);
        conversation.messages.push(incoming);
        info!("New message {} in {}", id, message.conversation_id);

        if unread {
            conversation.is_unread = true;
            if !is_active {
                match my_role {
                    Some(role) => state.bump_unread(role),
                    None => warn!("Not a participant of {}, unread counters untouched", message.conversation_id),
                }
            }
        }
        drop(guard);

        if let Some(receipt) = receipt {
            self.transport.send_read_receipt(&receipt);
        }
    }

    pub async fn on_typing(&self, typing: InboundTyping) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.current_user.as_deref() == Some(typing.sender_id.as_str()) {
            return;
        }
        let Some(is_typing) = typing.is_typing else {
            debug!("Typing event without isTyping from {}", typing.sender_id);
            return;
        };

        let key = (typing.conversation_id, typing.sender_id);
        state.typing.insert(
            key.clone(),
            TypingEntry {
                is_typing,
                timestamp: Utc::now(),
            },
        );
        if !is_typing {
            state.typing_timers.cancel(&key);
            return;
        }

        let shared = Arc::downgrade(&self.state);
        let timer_key = key.clone();
        state.typing_timers.arm(key, TYPING_EXPIRY, move |generation| async move {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.lock().await;
            if !state.typing_timers.complete(&timer_key, generation) {
                return;
            }
            debug!("Typing indicator for {:?} expired", timer_key);
            state.typing.insert(
                timer_key,
                TypingEntry {
                    is_typing: false,
                    timestamp: Utc::now(),
                },
            );
        });
    }

    pub async fn on_read_receipt(&self, receipt: InboundReadReceipt) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(me) = state.current_user.clone() else {
            return;
        };
        if receipt.sender_id == me {
            return;
        }
        let (Some(message_ids), Some(read_at)) = (receipt.message_ids, receipt.timestamp) else {
            warn!("Incomplete read receipt for {}", receipt.conversation_id);
            return;
        };
        let Some(conversation) = state.conversation_mut(&receipt.conversation_id) else {
            warn!("Read receipt for unknown conversation {}", receipt.conversation_id);
            return;
        };

        let mut marked = 0;
        for message in conversation.messages.iter_mut().filter(|m| message_ids.contains(&m.id)) {
            message.mark_read(read_at);
            marked += 1;
        }
        conversation.recompute_unread(&me);
        debug!("Read receipt marked {} messages in {}", marked, receipt.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::LocalCollaborators;
    use crate::error::TransportError;
    use crate::models::{Conversation, Participant, Profile, Role};
    use crate::transport::{Ack, MessageTransport, OutgoingMessage, TypingSignal};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ReceiptLog {
        receipts: Mutex<Vec<ReadReceipt>>,
    }

    #[async_trait]
    impl MessageTransport for ReceiptLog {
        async fn send_message(&self, _message: &OutgoingMessage) -> Result<Ack, TransportError> {
            Err(TransportError::NotConnected)
        }

        fn send_typing(&self, _signal: &TypingSignal) {}

        fn send_read_receipt(&self, receipt: &ReadReceipt) {
            self.receipts.lock().unwrap().push(receipt.clone());
        }
    }

    fn conversation(id: &str) -> Conversation {
        let participant = |user_id: &str, role| Participant {
            user_id: user_id.to_string(),
            role,
            profile: Profile::default(),
        };
        Conversation {
            id: id.to_string(),
            participants: vec![participant("host_1", Role::Host), participant("tenant_1", Role::Tenant)],
            messages: Vec::new(),
            is_unread: false,
        }
    }

    fn store_as(user: &str, log: Arc<ReceiptLog>) -> ConversationStore {
        ConversationStore::new(
            Some(user.to_string()),
            vec![conversation("c1"), conversation("c2")],
            log,
            LocalCollaborators::new(user).into_collaborators(),
        )
    }

    fn inbound(value: serde_json::Value) -> InboundMessage {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_inactive_message_counts_by_role_in_conversation() {
        let log = Arc::new(ReceiptLog::default());
        let store = store_as("tenant_1", log.clone());

        store
            .on_message(inbound(json!({
                "id": "m1", "content": "Viewing on Friday?", "conversationId": "c1",
                "senderId": "host_1", "senderRole": "Host", "type": "message"
            })))
            .await;

        let conversation = store.conversation("c1").await.unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert!(conversation.is_unread);
        assert_eq!(conversation.messages[0].delivery_status, DeliveryStatus::Delivered);
        let counts = store.unread_counts().await;
        assert_eq!(counts.tenant, 1);
        assert_eq!(counts.host, 0);
        assert!(log.receipts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_message_is_read_and_acknowledged() {
        let log = Arc::new(ReceiptLog::default());
        let store = store_as("tenant_1", log.clone());
        store.select_conversation("c1").await;

        store
            .on_message(inbound(json!({
                "id": "m1", "content": "hello", "conversationId": "c1", "senderId": "host_1"
            })))
            .await;

        let conversation = store.conversation("c1").await.unwrap();
        assert!(conversation.messages[0].is_read);
        assert_eq!(conversation.messages[0].delivery_status, DeliveryStatus::Read);
        assert!(!conversation.is_unread);
        assert_eq!(store.unread_counts().await.tenant, 0);

        let receipts = log.receipts.lock().unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].message_ids, vec!["m1".to_string()]);
        assert_eq!(receipts[0].receiver_id, "host_1");
        assert_eq!(receipts[0].sender_id, "tenant_1");
    }

    #[tokio::test]
    async fn test_duplicate_and_foreign_payloads_are_skipped() {
        let log = Arc::new(ReceiptLog::default());
        let store = store_as("host_1", log);
        let payload = json!({"id": "m1", "content": "x", "conversationId": "c2", "senderId": "tenant_1"});

        store.on_message(inbound(payload.clone())).await;
        store.on_message(inbound(payload)).await;
        // Own message without confirmation, unknown conversation, non-chat type
        store
            .on_message(inbound(json!({"id": "m2", "conversationId": "c2", "senderId": "host_1"})))
            .await;
        store
            .on_message(inbound(json!({"id": "m3", "conversationId": "nope", "senderId": "tenant_1"})))
            .await;
        store
            .on_message(inbound(json!({"id": "m4", "conversationId": "c2", "senderId": "tenant_1", "type": "system"})))
            .await;

        let conversation = store.conversation("c2").await.unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(store.unread_counts().await.host, 1);
    }

    #[tokio::test]
    async fn test_read_receipt_for_own_messages_keeps_unread_from_counterpart() {
        let log = Arc::new(ReceiptLog::default());
        let store = store_as("host_1", log);
        store
            .on_message(inbound(json!({"id": "in1", "content": "q", "conversationId": "c1", "senderId": "tenant_1"})))
            .await;
        {
            let mut state = store.state.lock().await;
            let conversation = state.conversation_mut("c1").unwrap();
            let mut mine = conversation.messages[0].clone();
            mine.id = "out1".to_string();
            mine.sender_id = "host_1".to_string();
            mine.receiver_id = "tenant_1".to_string();
            mine.delivery_status = DeliveryStatus::Delivered;
            conversation.messages.push(mine);
        }

        store
            .on_read_receipt(
                serde_json::from_value(json!({
                    "conversationId": "c1", "senderId": "tenant_1", "receiverId": "host_1",
                    "messageIds": ["out1"], "timestamp": "2024-05-01T10:00:00Z"
                }))
                .unwrap(),
            )
            .await;

        let conversation = store.conversation("c1").await.unwrap();
        let out = conversation.messages.iter().find(|m| m.id == "out1").unwrap();
        assert!(out.is_read);
        assert_eq!(out.delivery_status, DeliveryStatus::Read);
        assert!(conversation.is_unread, "Counterpart's message is still unread");
    }

    #[tokio::test]
    async fn test_own_read_receipt_is_ignored() {
        let log = Arc::new(ReceiptLog::default());
        let store = store_as("host_1", log);
        store
            .on_message(inbound(json!({"id": "in1", "content": "q", "conversationId": "c1", "senderId": "tenant_1"})))
            .await;
        let before = store.conversation("c1").await.unwrap();
        assert!(before.is_unread);

        // Our own receipt echoed back covers the counterpart's message
        store
            .on_read_receipt(
                serde_json::from_value(json!({
                    "conversationId": "c1", "senderId": "host_1", "receiverId": "tenant_1",
                    "messageIds": ["in1"], "timestamp": "2024-05-01T10:00:00Z"
                }))
                .unwrap(),
            )
            .await;

        let after = store.conversation("c1").await.unwrap();
        assert_eq!(after, before);
        assert!(after.is_unread);
        assert!(!after.messages[0].is_read);
        assert_eq!(after.messages[0].delivery_status, DeliveryStatus::Delivered);
        assert_eq!(store.unread_counts().await.host, 1);
    }

    #[tokio::test]
    async fn test_delivery_echo_updates_without_append() {
        let log = Arc::new(ReceiptLog::default());
        let store = store_as("host_1", log);
        store
            .on_message(inbound(json!({"id": "m1", "content": "x", "conversationId": "c1", "senderId": "tenant_1"})))
            .await;
        {
            let mut state = store.state.lock().await;
            let message = state.conversation_mut("c1").unwrap().message_mut("m1").unwrap();
            message.sender_id = "host_1".to_string();
            message.delivery_status = DeliveryStatus::Sending;
            message.pending = true;
        }

        store
            .on_message(inbound(json!({
                "id": "m1", "conversationId": "c1", "senderId": "host_1",
                "deliveryStatus": "delivered", "confirmedDeliveryAt": "2024-05-01T10:00:02Z"
            })))
            .await;

        let conversation = store.conversation("c1").await.unwrap();
        assert_eq!(conversation.messages.len(), 1);
        let message = &conversation.messages[0];
        assert!(!message.pending);
        assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
        assert!(message.confirmed_delivery_at.is_some());
        assert!(message.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_own_typing_is_ignored() {
        let store = store_as("host_1", Arc::new(ReceiptLog::default()));
        store
            .on_typing(serde_json::from_value(json!({"conversationId": "c1", "senderId": "host_1", "isTyping": true})).unwrap())
            .await;
        assert!(!store.is_typing("c1", "host_1").await);
        assert!(store.snapshot().await.typing.is_empty());
    }

    #[tokio::test]
    async fn test_status_change_is_recorded() {
        let store = store_as("host_1", Arc::new(ReceiptLog::default()));
        let status = ConnectionStatus {
            state: crate::transport::ConnectionState::Connected,
            failure_count: 0,
            retry_count: 0,
        };
        store.handle_event(TransportEvent::StatusChanged(status.clone())).await;
        assert_eq!(store.connection_status().await, status);
    }
}
