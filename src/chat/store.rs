//! Persistence seams for conversations and quota ledgers
//!
//! Both stores are injected into the chat service as trait objects. The
//! in-memory implementations back local development and tests.

use super::models::{Conversation, QuotaLedger, Turn};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Conversation read/write store
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Conversation>>;

    /// Record (or clear) the human message awaiting its reply
    async fn set_pending(&self, id: &str, message: Option<String>) -> Result<()>;

    /// Append `turns` if the stored sequence still has `expected_len` entries.
    ///
    /// A successful append clears the pending message and returns the new
    /// sequence length. A length mismatch fails with [`RelayError::Conflict`]
    /// and leaves the conversation untouched.
    async fn append_turns(&self, id: &str, expected_len: usize, turns: &[Turn]) -> Result<usize>;
}

/// Quota ledger store
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// The account's active ledger, if any
    async fn find_active(&self, account_id: &str) -> Result<Option<QuotaLedger>>;

    /// Decrement the active ledger by one, never below zero.
    ///
    /// Returns the remaining allowance after the decrement.
    async fn decrement(&self, account_id: &str) -> Result<i64>;

    /// Return one unit taken by [`LedgerStore::decrement`]
    async fn refund(&self, account_id: &str) -> Result<i64>;
}

/// In-memory conversation store
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conversation: Conversation) {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(id).cloned())
    }

    async fn set_pending(&self, id: &str, message: Option<String>) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        conversation.pending_message = message;
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn append_turns(&self, id: &str, expected_len: usize, turns: &[Turn]) -> Result<usize> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;

        if conversation.turns.len() != expected_len {
            return Err(RelayError::Conflict(format!(
                "history of {} has {} turns, expected {}",
                id,
                conversation.turns.len(),
                expected_len
            )));
        }

        conversation.turns.extend_from_slice(turns);
        conversation.pending_message = None;
        conversation.updated_at = Utc::now();
        Ok(conversation.turns.len())
    }
}

/// In-memory quota ledger store
#[derive(Default)]
pub struct MemoryLedgerStore {
    ledgers: RwLock<HashMap<String, QuotaLedger>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, ledger: QuotaLedger) {
        self.ledgers
            .write()
            .await
            .insert(ledger.account_id.clone(), ledger);
    }

    pub async fn remaining(&self, account_id: &str) -> Option<i64> {
        self.ledgers.read().await.get(account_id).map(|l| l.remaining)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_active(&self, account_id: &str) -> Result<Option<QuotaLedger>> {
        Ok(self
            .ledgers
            .read()
            .await
            .get(account_id)
            .filter(|l| l.active)
            .cloned())
    }

    async fn decrement(&self, account_id: &str) -> Result<i64> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers
            .get_mut(account_id)
            .filter(|l| l.active)
            .ok_or_else(|| RelayError::NotFound(format!("active ledger for {}", account_id)))?;

        if ledger.remaining <= 0 {
            return Err(RelayError::QuotaDenied);
        }
        ledger.remaining -= 1;
        Ok(ledger.remaining)
    }

    async fn refund(&self, account_id: &str) -> Result<i64> {
        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers
            .get_mut(account_id)
            .ok_or_else(|| RelayError::NotFound(format!("ledger for {}", account_id)))?;

        ledger.remaining += 1;
        Ok(ledger.remaining)
    }
}

/// Fixture data loaded into the in-memory stores at startup
#[derive(Debug, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub ledgers: Vec<QuotaLedger>,
}

impl SeedData {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("reading {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| RelayError::Config(format!("parsing {}: {}", path.display(), e)))
    }

    pub async fn load_into(
        self,
        conversations: &MemoryConversationStore,
        ledgers: &MemoryLedgerStore,
    ) {
        for conversation in self.conversations {
            conversations.insert(conversation).await;
        }
        for ledger in self.ledgers {
            ledgers.insert(ledger).await;
        }
    }
}
