//! History log: load/merge/commit of a conversation's turn sequence

use super::models::Turn;
use super::store::ConversationStore;
use crate::error::{RelayError, Result};
use crate::metrics::METRICS;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    /// Sequence length after the append
    pub length: usize,
}

/// Append-only view over the conversation store
#[derive(Clone)]
pub struct HistoryLog {
    store: Arc<dyn ConversationStore>,
    max_attempts: usize,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn ConversationStore>, max_attempts: usize) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Append a human/ai pair to the conversation.
    ///
    /// The append is conditional on the length that was read, so a concurrent
    /// writer forces a reload instead of being overwritten. Every error other
    /// than a stale read surfaces as [`RelayError::PersistenceFailure`].
    pub async fn commit(
        &self,
        conversation_id: &str,
        human_text: &str,
        ai_text: &str,
    ) -> Result<CommitResult> {
        let pair = [Turn::human(human_text), Turn::ai(ai_text)];

        for attempt in 1..=self.max_attempts {
            let expected = self
                .store
                .get(conversation_id)
                .await
                .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?
                .ok_or_else(|| {
                    RelayError::PersistenceFailure(format!(
                        "conversation {} disappeared before commit",
                        conversation_id
                    ))
                })?
                .turns
                .len();

            match self.store.append_turns(conversation_id, expected, &pair).await {
                Ok(length) => {
                    info!("Committed turn to conversation {} (length {})", conversation_id, length);
                    return Ok(CommitResult { length });
                }
                Err(RelayError::Conflict(reason)) => {
                    METRICS.commit_conflicts.inc();
                    warn!(
                        "Commit attempt {} for {} lost a race: {}",
                        attempt, conversation_id, reason
                    );
                }
                Err(e) => {
                    error!("Failed to commit turn for {}: {}", conversation_id, e);
                    return Err(RelayError::PersistenceFailure(e.to_string()));
                }
            }
        }

        debug!("Giving up on {} after {} attempts", conversation_id, self.max_attempts);
        Err(RelayError::PersistenceFailure(format!(
            "history of {} kept changing after {} attempts",
            conversation_id, self.max_attempts
        )))
    }
}
