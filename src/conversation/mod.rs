// Conversation state for the messaging core
// Holds conversations, messages, typing and unread state, applies inbound
// transport events and drives the user actions (send, select, create,
// delete). Transport and collaborators are injected.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;

pub mod actions;
pub mod collaborators;
pub mod dispatch;

pub use collaborators::{Collaborators, ConversationService, LocalCollaborators, MessageFallback, ReadStatePersister};

use crate::models::{Conversation, Role, TabKey, TypingEntry};
use crate::timers::TimerTable;
use crate::transport::{ConnectionStatus, MessageTransport, TransportEvent};

/// How long a typing indicator stays up after the last `true` signal
pub const TYPING_EXPIRY: Duration = Duration::from_millis(5000);

/// `(conversation id, sender id)`
pub type TypingKey = (String, String);

pub(crate) struct StoreState {
    current_user: Option<String>,
    conversations: Vec<Conversation>,
    active: Option<String>,
    typing: HashMap<TypingKey, TypingEntry>,
    typing_timers: TimerTable<TypingKey>,
    unread_host: u32,
    unread_tenant: u32,
    tab: TabKey,
    connection: ConnectionStatus,
}

impl StoreState {
    fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn bump_unread(&mut self, role: Role) {
        match role {
            Role::Host => self.unread_host += 1,
            Role::Tenant => self.unread_tenant += 1,
        }
    }

    fn clear_unread(&mut self, role: Role) {
        match role {
            Role::Host => self.unread_host = 0,
            Role::Tenant => self.unread_tenant = 0,
        }
    }

    /// Forget typing state and timers for conversations that are gone
    fn purge_typing(&mut self, removed: &[String]) {
        let stale: Vec<TypingKey> = self
            .typing
            .keys()
            .filter(|(conversation_id, _)| removed.contains(conversation_id))
            .cloned()
            .collect();
        for key in stale {
            self.typing_timers.cancel(&key);
            self.typing.remove(&key);
        }
    }
}

/// Unread counters, one per canonical role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub host: u32,
    pub tenant: u32,
}

/// Point-in-time copy of everything a UI renders
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub current_user: Option<String>,
    pub conversations: Vec<Conversation>,
    pub active_conversation: Option<String>,
    pub typing: HashMap<TypingKey, TypingEntry>,
    pub unread: UnreadCounts,
    pub tab: TabKey,
    pub connection: ConnectionStatus,
}

/// Shared handle to the conversation state. Clones see the same state.
#[derive(Clone)]
pub struct ConversationStore {
    state: Arc<TokioMutex<StoreState>>,
    transport: Arc<dyn MessageTransport>,
    collaborators: Collaborators,
}

impl ConversationStore {
    pub fn new(
        current_user: Option<String>,
        initial: Vec<Conversation>,
        transport: Arc<dyn MessageTransport>,
        collaborators: Collaborators,
    ) -> Self {
        let mut conversations = initial;
        if let Some(user) = current_user.as_deref() {
            for conversation in conversations.iter_mut() {
                conversation.recompute_unread(user);
            }
        }
        info!("Conversation store loaded with {} conversations", conversations.len());

        Self {
            state: Arc::new(TokioMutex::new(StoreState {
                current_user,
                conversations,
                active: None,
                typing: HashMap::new(),
                typing_timers: TimerTable::new(),
                unread_host: 0,
                unread_tenant: 0,
                tab: TabKey::All,
                connection: ConnectionStatus::idle(),
            })),
            transport,
            collaborators,
        }
    }

    /// Apply transport events until the transport goes away
    pub async fn run(&self, events: mpsc::Receiver<TransportEvent>) {
        self.run_observed(events, |_| {}).await
    }

    /// Like `run`, showing each event to `observe` before it is applied
    pub async fn run_observed<F>(&self, mut events: mpsc::Receiver<TransportEvent>, mut observe: F)
    where
        F: FnMut(&TransportEvent),
    {
        while let Some(event) = events.recv().await {
            observe(&event);
            self.handle_event(event).await;
        }
        debug!("Transport event stream ended");
    }

    /// Spawn `run` on the current runtime. The transport blocks once its
    /// event queue is full, so something must keep draining it while
    /// sends wait for their acknowledgement.
    pub fn spawn_event_loop(&self, events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
        self.spawn_observed_event_loop(events, |_| {})
    }

    pub fn spawn_observed_event_loop<F>(&self, events: mpsc::Receiver<TransportEvent>, observe: F) -> JoinHandle<()>
    where
        F: FnMut(&TransportEvent) + Send + 'static,
    {
        let store = self.clone();
        tokio::spawn(async move { store.run_observed(events, observe).await })
    }

    /// Switch identity. Active conversation, typing state and counters
    /// belong to the previous user and are dropped.
    pub async fn set_current_user(&self, user: Option<String>) {
        let mut state = self.state.lock().await;
        if state.current_user == user {
            return;
        }
        info!("Current user is now {:?}", user);
        state.typing_timers.cancel_all();
        state.typing.clear();
        state.active = None;
        state.unread_host = 0;
        state.unread_tenant = 0;
        if let Some(user) = user.as_deref() {
            for conversation in state.conversations.iter_mut() {
                conversation.recompute_unread(user);
            }
        }
        state.current_user = user;
    }

    /// Cancel every typing timer
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.typing_timers.cancel_all();
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock().await;
        StoreSnapshot {
            current_user: state.current_user.clone(),
            conversations: state.conversations.clone(),
            active_conversation: state.active.clone(),
            typing: state.typing.clone(),
            unread: UnreadCounts {
                host: state.unread_host,
                tenant: state.unread_tenant,
            },
            tab: state.tab,
            connection: state.connection.clone(),
        }
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().await.conversations.clone()
    }

    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.state.lock().await.conversation(id).cloned()
    }

    pub async fn active_conversation_id(&self) -> Option<String> {
        self.state.lock().await.active.clone()
    }

    pub async fn unread_counts(&self) -> UnreadCounts {
        let state = self.state.lock().await;
        UnreadCounts {
            host: state.unread_host,
            tenant: state.unread_tenant,
        }
    }

    pub async fn tab(&self) -> TabKey {
        self.state.lock().await.tab
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.state.lock().await.connection.clone()
    }

    pub async fn is_typing(&self, conversation_id: &str, sender_id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .typing
            .get(&(conversation_id.to_string(), sender_id.to_string()))
            .map_or(false, |entry| entry.is_typing)
    }

    /// Conversations shown under the current tab: all of them, or those
    /// where the current user holds the tab's role
    pub async fn visible_conversations(&self) -> Vec<Conversation> {
        let state = self.state.lock().await;
        match (state.tab.role(), state.current_user.as_deref()) {
            (None, _) => state.conversations.clone(),
            (Some(role), Some(user)) => state
                .conversations
                .iter()
                .filter(|c| c.role_of(user) == Some(role))
                .cloned()
                .collect(),
            (Some(_), None) => Vec::new(),
        }
    }
}
