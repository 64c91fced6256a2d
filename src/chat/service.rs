//! Chat service: admission, streaming and read paths over injected collaborators

use super::history::HistoryLog;
use super::models::{Conversation, UpstreamRefs};
use super::quota::{Admission, QuotaGate};
use super::relay::StreamRelay;
use super::session::{TurnOutcome, TurnRequest, TurnSession};
use super::store::{ConversationStore, LedgerStore};
use crate::error::{RelayError, Result};
use crate::upstream::UpstreamClient;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Tunables for streamed turns
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub turn_timeout: Duration,
    pub channel_capacity: usize,
    pub max_commit_attempts: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(300),
            channel_capacity: 64,
            max_commit_attempts: 3,
        }
    }
}

/// A running turn: the frame receiver for the response body and the task
/// driving the session.
pub struct StreamHandle {
    pub frames: mpsc::Receiver<Bytes>,
    pub task: JoinHandle<TurnOutcome>,
}

/// Marks a conversation busy until dropped
struct InFlight {
    slots: Arc<DashMap<String, ()>>,
    conversation_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.slots.remove(&self.conversation_id);
    }
}

#[derive(Clone)]
pub struct ChatService {
    conversations: Arc<dyn ConversationStore>,
    upstream: Arc<dyn UpstreamClient>,
    quota: QuotaGate,
    history: HistoryLog,
    in_flight: Arc<DashMap<String, ()>>,
    settings: TurnSettings,
}

impl ChatService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        ledgers: Arc<dyn LedgerStore>,
        upstream: Arc<dyn UpstreamClient>,
        settings: TurnSettings,
    ) -> Self {
        let history = HistoryLog::new(conversations.clone(), settings.max_commit_attempts);
        Self {
            conversations,
            upstream,
            quota: QuotaGate::new(ledgers),
            history,
            in_flight: Arc::new(DashMap::new()),
            settings,
        }
    }

    /// Read-only fetch of a conversation
    pub async fn fetch(&self, conversation_id: &str) -> Result<Conversation> {
        self.conversations
            .get(conversation_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(conversation_id.to_string()))
    }

    /// Whether a turn is currently running for the conversation
    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.in_flight.contains_key(conversation_id)
    }

    fn claim(&self, conversation_id: &str) -> Result<InFlight> {
        match self.in_flight.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => Err(RelayError::Conflict(format!(
                "a turn is already in progress for {}",
                conversation_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlight {
                    slots: self.in_flight.clone(),
                    conversation_id: conversation_id.to_string(),
                })
            }
        }
    }

    async fn gate(&self, conversation: &Conversation) -> Result<()> {
        match self.quota.admit(&conversation.account_id).await? {
            Admission::Allowed => Ok(()),
            Admission::Denied(_) => Err(RelayError::QuotaDenied),
        }
    }

    /// Admission path: accept a human message without streaming.
    ///
    /// The message is posted to the upstream thread and recorded as the
    /// conversation's pending message; it joins the history together with
    /// its reply once a streamed turn commits.
    pub async fn submit_message(&self, conversation_id: &str, message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Err(RelayError::Validation("message cannot be empty".to_string()));
        }

        let conversation = self.fetch(conversation_id).await?;
        let refs = require_refs(&conversation)?;
        let _slot = self.claim(conversation_id)?;

        if conversation.pending_message.is_some() {
            return Err(RelayError::Conflict(format!(
                "conversation {} already has a message awaiting its reply",
                conversation_id
            )));
        }

        self.gate(&conversation).await?;

        self.upstream.post_message(&refs.thread_id, message).await?;
        debug!("Message posted upstream for conversation {}", conversation_id);

        self.conversations
            .set_pending(conversation_id, Some(message.to_string()))
            .await?;
        info!("Message accepted for conversation {}", conversation_id);
        Ok(())
    }

    /// Streaming path: run a turn for the conversation's pending message.
    ///
    /// Every rejection happens before the channel exists. Once this returns,
    /// problems are reported in-band by the session.
    pub async fn open_stream(&self, conversation_id: &str) -> Result<StreamHandle> {
        let conversation = self.fetch(conversation_id).await?;
        let refs = require_refs(&conversation)?;
        let human_text = conversation.pending_message.clone().ok_or_else(|| {
            RelayError::InvalidState(format!(
                "conversation {} has no message awaiting a reply",
                conversation_id
            ))
        })?;

        let slot = self.claim(conversation_id)?;
        // Held by the session: kept on commit, refunded on failure
        self.quota.reserve(&conversation.account_id).await?;

        Ok(self.spawn_session(
            TurnRequest {
                conversation_id: conversation.id.clone(),
                account_id: conversation.account_id.clone(),
                refs,
                human_text,
            },
            slot,
        ))
    }

    /// One-shot path: admission followed by streaming in a single call
    pub async fn run_turn(&self, conversation_id: &str, message: &str) -> Result<StreamHandle> {
        self.submit_message(conversation_id, message).await?;
        self.open_stream(conversation_id).await
    }

    fn spawn_session(&self, request: TurnRequest, slot: InFlight) -> StreamHandle {
        let (relay, frames) = StreamRelay::channel(self.settings.channel_capacity);
        let session = TurnSession::new(request, relay, self.settings.turn_timeout);

        let upstream = self.upstream.clone();
        let history = self.history.clone();
        let quota = self.quota.clone();

        let task = tokio::spawn(async move {
            // Held for the lifetime of the session, released on any exit
            let _slot = slot;
            let outcome = session.run(upstream.as_ref(), &history, &quota).await;
            if let TurnOutcome::Failed(reason) = &outcome {
                error!("Turn session ended in failure: {}", reason);
            }
            outcome
        });

        StreamHandle { frames, task }
    }
}

fn require_refs(conversation: &Conversation) -> Result<UpstreamRefs> {
    if conversation.thread_id.is_none() {
        return Err(RelayError::InvalidState(format!(
            "Thread ID is null for chat {}",
            conversation.id
        )));
    }
    conversation.upstream_refs().ok_or_else(|| {
        RelayError::InvalidState(format!("Assistant ID is null for chat {}", conversation.id))
    })
}
