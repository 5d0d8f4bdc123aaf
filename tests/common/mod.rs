// Common test utilities for integration tests
// Scripted channel/connector for the transport, a recording transport
// and recording collaborators for the store, plus fixtures.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::LevelFilter;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use leasechat::conversation::{Collaborators, ConversationService, MessageFallback, ReadStatePersister};
use leasechat::transport::{
    Ack, Channel, ChannelEvent, ChannelEventSender, Connector, EventName, MessageTransport, OutgoingMessage,
    ReadReceipt, TypingSignal,
};
use leasechat::{Conversation, ConversationStore, Message, Participant, Profile, Role, TransportError};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// What a scripted channel does right after it is opened
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenBehavior {
    /// Report `Connected`
    Succeed,
    /// Report a `ConnectError`
    Fail,
    /// Report nothing; the test drives events through `last_sender`
    Manual,
}

/// How a scripted channel answers acknowledged emits
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AckReply {
    Received,
    Rejected,
    /// Hold the responder so the caller times out
    Silent,
}

struct ScriptState {
    behavior: OpenBehavior,
    ack_reply: AckReply,
    opens: Vec<(String, Instant)>,
    senders: Vec<ChannelEventSender>,
    emitted: Vec<(EventName, Value)>,
    held_acks: Vec<oneshot::Sender<Result<Value, TransportError>>>,
    closed: usize,
}

#[derive(Clone)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedConnector {
    pub fn new(behavior: OpenBehavior) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(ScriptState {
                behavior,
                ack_reply: AckReply::Received,
                opens: Vec::new(),
                senders: Vec::new(),
                emitted: Vec::new(),
                held_acks: Vec::new(),
                closed: 0,
            })),
        })
    }

    pub fn set_behavior(&self, behavior: OpenBehavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    pub fn set_ack_reply(&self, reply: AckReply) {
        self.state.lock().unwrap().ack_reply = reply;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens.len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().opens.iter().map(|(_, at)| *at).collect()
    }

    pub fn identities(&self) -> Vec<String> {
        self.state.lock().unwrap().opens.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn closed_count(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn emitted(&self) -> Vec<(EventName, Value)> {
        self.state.lock().unwrap().emitted.clone()
    }

    /// Event sender of the most recently opened channel
    pub fn last_sender(&self) -> ChannelEventSender {
        self.state
            .lock()
            .unwrap()
            .senders
            .last()
            .cloned()
            .expect("no channel opened yet")
    }

    pub fn sender(&self, index: usize) -> ChannelEventSender {
        self.state.lock().unwrap().senders[index].clone()
    }

    /// Push an inbound event through the most recent channel
    pub fn push_inbound(&self, name: EventName, data: Value) {
        self.last_sender().send(ChannelEvent::Inbound { name, data });
    }

    /// Wait (in virtual time) until at least `count` channels were opened
    pub async fn wait_for_opens(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(3600), async {
            while self.open_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {} channel opens", count);
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, identity: &str, events: ChannelEventSender) -> Result<Box<dyn Channel>, TransportError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.opens.push((identity.to_string(), Instant::now()));
            state.senders.push(events.clone());
            state.behavior
        };
        match behavior {
            OpenBehavior::Succeed => {
                events.send(ChannelEvent::Connected);
            }
            OpenBehavior::Fail => {
                events.send(ChannelEvent::ConnectError("connection refused".to_string()));
            }
            OpenBehavior::Manual => {}
        }
        Ok(Box::new(ScriptedChannel {
            identity: identity.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct ScriptedChannel {
    identity: String,
    state: Arc<Mutex<ScriptState>>,
}

impl Channel for ScriptedChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn emit(&mut self, event: EventName, payload: Value) -> Result<(), TransportError> {
        self.state.lock().unwrap().emitted.push((event, payload));
        Ok(())
    }

    fn emit_with_ack(&mut self, event: EventName, payload: Value, ack: oneshot::Sender<Result<Value, TransportError>>) {
        let mut state = self.state.lock().unwrap();
        state.emitted.push((event, payload));
        match state.ack_reply {
            AckReply::Received => {
                let _ = ack.send(Ok(json!({"received": true, "timestamp": Utc::now()})));
            }
            AckReply::Rejected => {
                let _ = ack.send(Ok(json!({"received": false})));
            }
            AckReply::Silent => state.held_acks.push(ack),
        }
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
    }
}

/// How the recording transport answers `send_message`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SendOutcome {
    Ack,
    Reject,
}

pub struct RecordingTransport {
    pub outcome: Mutex<SendOutcome>,
    pub sent: Mutex<Vec<OutgoingMessage>>,
    pub typing: Mutex<Vec<TypingSignal>>,
    pub receipts: Mutex<Vec<ReadReceipt>>,
    /// When set, `send_message` waits for a notification before answering
    pub gate: Option<Arc<Notify>>,
}

impl RecordingTransport {
    pub fn new(outcome: SendOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(outcome),
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
            receipts: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    pub fn gated(outcome: SendOutcome, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(outcome),
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
            receipts: Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn receipts(&self) -> Vec<ReadReceipt> {
        self.receipts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<Ack, TransportError> {
        self.sent.lock().unwrap().push(message.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let outcome = *self.outcome.lock().unwrap();
        match outcome {
            SendOutcome::Ack => Ok(serde_json::from_value(json!({"received": true, "timestamp": Utc::now()}))?),
            SendOutcome::Reject => Err(TransportError::AckTimeout(Duration::from_millis(5000))),
        }
    }

    fn send_typing(&self, signal: &TypingSignal) {
        self.typing.lock().unwrap().push(signal.clone());
    }

    fn send_read_receipt(&self, receipt: &ReadReceipt) {
        self.receipts.lock().unwrap().push(receipt.clone());
    }
}

/// Fallback, conversation service and read persister in one, recording calls
#[derive(Default)]
pub struct RecordingBackend {
    pub fallback_fails: Mutex<bool>,
    pub create_fails: Mutex<bool>,
    pub failing_deletes: Mutex<HashSet<String>>,
    pub fallback_calls: Mutex<Vec<OutgoingMessage>>,
    pub delete_calls: Mutex<Vec<String>>,
    pub persisted: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_fallback(&self) {
        *self.fallback_fails.lock().unwrap() = true;
    }

    pub fn fail_create(&self) {
        *self.create_fails.lock().unwrap() = true;
    }

    pub fn fail_delete_of(&self, conversation_id: &str) {
        self.failing_deletes.lock().unwrap().insert(conversation_id.to_string());
    }

    pub fn fallback_count(&self) -> usize {
        self.fallback_calls.lock().unwrap().len()
    }

    pub fn persisted(&self) -> Vec<(String, DateTime<Utc>)> {
        self.persisted.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageFallback for RecordingBackend {
    async fn create_message(&self, payload: &OutgoingMessage) -> Result<Message> {
        self.fallback_calls.lock().unwrap().push(payload.clone());
        if *self.fallback_fails.lock().unwrap() {
            return Err(anyhow!("HTTP 503 from message endpoint"));
        }
        Ok(serde_json::from_value(json!({
            "id": payload.id,
            "content": payload.content,
            "senderId": payload.sender_id,
            "receiverId": payload.receiver_id,
            "conversationId": payload.conversation_id,
            "senderRole": payload.sender_role,
            "type": payload.kind,
            "createdAt": payload.timestamp,
            "deliveryStatus": "delivered",
            "deliveredAt": Utc::now(),
        }))?)
    }
}

#[async_trait]
impl ConversationService for RecordingBackend {
    async fn create_conversation(&self, counterpart: &str, first_role: Role, second_role: Role) -> Result<Conversation> {
        if *self.create_fails.lock().unwrap() {
            return Err(anyhow!("HTTP 500 creating conversation"));
        }
        let mut conversation = two_party(&format!("conv_{}", counterpart), "host_1", counterpart);
        conversation.participants[0].role = first_role;
        conversation.participants[1].role = second_role;
        Ok(conversation)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.delete_calls.lock().unwrap().push(conversation_id.to_string());
        if self.failing_deletes.lock().unwrap().contains(conversation_id) {
            return Err(anyhow!("HTTP 409 deleting {}", conversation_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadStatePersister for RecordingBackend {
    async fn persist_read(&self, conversation_id: &str, read_at: DateTime<Utc>) -> Result<()> {
        self.persisted.lock().unwrap().push((conversation_id.to_string(), read_at));
        Ok(())
    }
}

pub fn collaborators(backend: &Arc<RecordingBackend>) -> Collaborators {
    Collaborators {
        fallback: backend.clone(),
        conversations: backend.clone(),
        read_state: backend.clone(),
    }
}

/// Conversation between `host` (Host role) and `tenant` (Tenant role)
pub fn two_party(id: &str, host: &str, tenant: &str) -> Conversation {
    let participant = |user_id: &str, role: Role| Participant {
        user_id: user_id.to_string(),
        role,
        profile: Profile {
            id: user_id.to_string(),
            ..Default::default()
        },
    };
    Conversation {
        id: id.to_string(),
        participants: vec![participant(host, Role::Host), participant(tenant, Role::Tenant)],
        messages: Vec::new(),
        is_unread: false,
    }
}

/// Inbound chat message payload as the server sends it
pub fn inbound_message(id: &str, conversation_id: &str, sender_id: &str, content: &str) -> Value {
    json!({
        "id": id,
        "content": content,
        "conversationId": conversation_id,
        "senderId": sender_id,
        "type": "message",
        "timestamp": Utc::now(),
    })
}

pub fn store_with(
    user: &str,
    conversations: Vec<Conversation>,
    transport: Arc<RecordingTransport>,
    backend: &Arc<RecordingBackend>,
) -> ConversationStore {
    setup_logging();
    ConversationStore::new(Some(user.to_string()), conversations, transport, collaborators(backend))
}

/// Every conversation's unread flag agrees with its messages
pub fn assert_unread_invariant(conversations: &[Conversation], user: &str) {
    for conversation in conversations {
        let expected = conversation.messages.iter().any(|m| m.sender_id != user && !m.is_read);
        assert_eq!(
            conversation.is_unread, expected,
            "unread flag out of sync in {}",
            conversation.id
        );
    }
}
