//! Request and response bodies for the chat API

use crate::chat::{Conversation, Turn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of a message submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    pub message: String,
}

/// Plain acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Query string of `GET /api/v1/chats/:id`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatQuery {
    #[serde(default)]
    pub stream: bool,
}

/// Read-only view of a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatView {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub chat_history: Vec<Turn>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl From<Conversation> for ChatView {
    fn from(conversation: Conversation) -> Self {
        Self {
            uuid: conversation.id,
            title: conversation.title,
            chat_history: conversation.turns,
            created: conversation.created_at,
            updated: conversation.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub chat: ChatView,
}

/// API error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Error codes carried in [`ApiError::code`]
pub mod error_codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INVALID_STATE: &str = "INVALID_STATE";
    pub const QUOTA_EXCEEDED: &str = "QUOTA_EXCEEDED";
    pub const CONFLICT: &str = "CONFLICT";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UPSTREAM_DISABLED: &str = "UPSTREAM_DISABLED";
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}
