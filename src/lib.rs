//! Streaming conversational turn relay
//!
//! Accepts a human message for a conversation, relays the assistant's reply
//! from an upstream token stream as server-sent events, and commits the
//! finished turn to the conversation history exactly once, charged against
//! the account's question allowance.

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod metrics;
pub mod upstream;

pub use error::{RelayError, Result};

/// Prelude for common imports
pub mod prelude {
    pub use crate::chat::{
        ChatService, Conversation, ConversationStore, LedgerStore, QuotaLedger, Turn,
        TurnOutcome, TurnSettings,
    };
    pub use crate::config::Config;
    pub use crate::error::{RelayError, Result};
    pub use crate::upstream::{UpstreamClient, UpstreamEvent};
}
