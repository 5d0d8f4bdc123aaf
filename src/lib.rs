// Client-side real-time messaging core for the leasing app
pub mod config;
pub mod conversation;
pub mod error;
pub mod models;
pub mod timers;
pub mod transport;

// Re-export main types for convenience
pub use conversation::{Collaborators, ConversationStore};
pub use error::TransportError;
pub use models::*;
pub use transport::{ConnectionState, ConnectionStatus, MessageTransport, TransportConnection, TransportEvent};
