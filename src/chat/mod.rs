//! Conversational turn orchestration
//!
//! - `quota` gates admission against an account's allowance
//! - `history` commits finished turns exactly once
//! - `session` runs the streaming state machine for one turn
//! - `relay` frames output for the client and owns channel closure
//! - `service` wires the pieces behind the HTTP handlers

pub mod history;
pub mod models;
pub mod quota;
pub mod relay;
pub mod service;
pub mod session;
pub mod store;

pub use history::{CommitResult, HistoryLog};
pub use models::{Conversation, QuotaLedger, Role, Turn, UpstreamRefs};
pub use quota::{Admission, DenialReason, QuotaGate};
pub use relay::{sse_response, StreamRelay};
pub use service::{ChatService, StreamHandle, TurnSettings};
pub use session::{FailureReason, SessionState, TurnOutcome, TurnRequest, TurnSession};
pub use store::{
    ConversationStore, LedgerStore, MemoryConversationStore, MemoryLedgerStore, SeedData,
};
