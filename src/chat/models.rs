//! Data models for conversations, turns and quota ledgers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

/// One committed entry of a conversation's history
///
/// The sequence position is the entry's index in [`Conversation::turns`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(rename = "type")]
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self {
            role: Role::Ai,
            content: content.into(),
        }
    }
}

/// A persisted exchange linked to an upstream thread and assistant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Human text admitted and posted upstream, awaiting its reply
    #[serde(default)]
    pub pending_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(account_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            title: None,
            thread_id: None,
            assistant_id: None,
            turns: Vec::new(),
            pending_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_upstream(
        mut self,
        thread_id: impl Into<String>,
        assistant_id: impl Into<String>,
    ) -> Self {
        self.thread_id = Some(thread_id.into());
        self.assistant_id = Some(assistant_id.into());
        self
    }

    /// Upstream thread and assistant ids, if both are set
    pub fn upstream_refs(&self) -> Option<UpstreamRefs> {
        match (&self.thread_id, &self.assistant_id) {
            (Some(thread_id), Some(assistant_id)) => Some(UpstreamRefs {
                thread_id: thread_id.clone(),
                assistant_id: assistant_id.clone(),
            }),
            _ => None,
        }
    }
}

/// Upstream identifiers a session needs before it may start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRefs {
    pub thread_id: String,
    pub assistant_id: String,
}

/// Per-account remaining allowance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLedger {
    pub account_id: String,
    pub remaining: i64,
    pub active: bool,
}

impl QuotaLedger {
    pub fn active(account_id: impl Into<String>, remaining: i64) -> Self {
        Self {
            account_id: account_id.into(),
            remaining,
            active: true,
        }
    }

    pub fn admits(&self) -> bool {
        self.active && self.remaining > 0
    }
}
