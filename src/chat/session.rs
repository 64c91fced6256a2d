//! Turn session: the state machine driving one streamed turn
//!
//! A session owns one in-flight turn. It is the single consumer of the
//! upstream event stream, so every terminal event is observed sequentially
//! and at most one of them can act. The lifecycle is
//!
//! ```text
//! Idle -> AwaitingUpstream -> Streaming -> Finalizing -> Closed
//!   \__________\__________________\____________\------> Failed
//! ```
//!
//! Text handling follows the upstream SDK contract: a text part is announced
//! with `Created(opening)` and the very next `Delta` usually repeats the
//! opening text. That echo is suppressed once; every other delta is appended
//! and forwarded verbatim. Tool activity is forwarded but never committed.

use super::history::HistoryLog;
use super::models::UpstreamRefs;
use super::quota::QuotaGate;
use super::relay::StreamRelay;
use crate::metrics::METRICS;
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamEvent};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingUpstream,
    Streaming,
    Finalizing,
    Closed,
    Failed,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Finalizing | Self::Closed | Self::Failed)
    }
}

/// Everything a session needs to know about the turn it runs
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub account_id: String,
    pub refs: UpstreamRefs,
    pub human_text: String,
}

/// Why a session ended in `Failed`
#[derive(Debug, Clone, thiserror::Error)]
pub enum FailureReason {
    #[error("{0}")]
    Upstream(UpstreamError),

    #[error("upstream stream ended before the run completed")]
    Truncated,

    #[error("turn exceeded {0:?}")]
    Timeout(Duration),

    #[error("client disconnected")]
    Disconnected,

    #[error("reply could not be saved: {0}")]
    Persistence(String),
}

impl FailureReason {
    fn label(&self) -> &'static str {
        match self {
            Self::Upstream(_) | Self::Truncated => "upstream_error",
            Self::Timeout(_) => "timeout",
            Self::Disconnected => "disconnected",
            Self::Persistence(_) => "lost_write",
        }
    }
}

/// Final result of a session
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed { ai_text: String, history_len: usize },
    Failed(FailureReason),
}

/// What the driver must do after feeding one event to the state machine
#[derive(Debug, PartialEq)]
enum Step {
    Forward(String),
    Suppressed,
    Finalize,
    Fail(UpstreamError),
    Ignored,
}

pub struct TurnSession {
    request: TurnRequest,
    state: SessionState,
    buffer: String,
    /// Opening text whose echo may arrive as the next delta
    echo: Option<String>,
    relay: StreamRelay,
    timeout: Duration,
}

impl TurnSession {
    pub fn new(request: TurnRequest, relay: StreamRelay, timeout: Duration) -> Self {
        Self {
            request,
            state: SessionState::Idle,
            buffer: String::new(),
            echo: None,
            relay,
            timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn accumulated(&self) -> &str {
        &self.buffer
    }

    fn open_part(&mut self, text: String) -> Step {
        self.buffer.push_str(&text);
        self.echo = Some(text.clone());
        self.state = SessionState::Streaming;
        Step::Forward(text)
    }

    fn on_event(&mut self, event: UpstreamEvent) -> Step {
        if self.state.is_terminal() {
            return Step::Ignored;
        }

        match event {
            UpstreamEvent::Created(text) => self.open_part(text),
            UpstreamEvent::Delta(text) => {
                if self.state == SessionState::AwaitingUpstream {
                    // No announcement: the first delta opens the buffer itself
                    self.echo = None;
                    self.buffer.push_str(&text);
                    self.state = SessionState::Streaming;
                    return Step::Forward(text);
                }
                if self.echo.take().as_deref() == Some(text.as_str()) {
                    METRICS.duplicate_deltas.inc();
                    return Step::Suppressed;
                }
                self.buffer.push_str(&text);
                Step::Forward(text)
            }
            UpstreamEvent::ToolOutput(text) => {
                // Shown to the client but not part of the committed reply
                if self.state == SessionState::AwaitingUpstream {
                    self.state = SessionState::Streaming;
                }
                Step::Forward(text)
            }
            UpstreamEvent::End => {
                self.state = SessionState::Finalizing;
                Step::Finalize
            }
            UpstreamEvent::Error(e) => Step::Fail(e),
        }
    }

    /// Drive the turn to completion.
    ///
    /// The allowance unit was reserved when the stream was opened. It stays
    /// charged if the turn commits and is refunded on every failure. The
    /// upstream subscription is dropped before any failure is reported,
    /// which aborts it on disconnect or timeout.
    pub async fn run(
        mut self,
        upstream: &dyn UpstreamClient,
        history: &HistoryLog,
        quota: &QuotaGate,
    ) -> TurnOutcome {
        let start = Instant::now();
        self.state = SessionState::AwaitingUpstream;
        info!(
            "Starting turn for conversation {} on thread {}",
            self.request.conversation_id, self.request.refs.thread_id
        );

        let streamed = self.stream_reply(upstream).await;
        match streamed {
            Ok(()) => self.finalize(history, quota, start).await,
            Err(reason) => self.fail(reason, quota, start).await,
        }
    }

    /// Relay upstream output until the run ends. The event stream lives only
    /// inside this call.
    async fn stream_reply(&mut self, upstream: &dyn UpstreamClient) -> Result<(), FailureReason> {
        let timeout = self.timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let opened = tokio::select! {
            opened = upstream.stream_run(&self.request.refs.thread_id, &self.request.refs.assistant_id) => opened,
            _ = &mut deadline => return Err(FailureReason::Timeout(timeout)),
            _ = self.relay.disconnected() => return Err(FailureReason::Disconnected),
        };
        let mut events = opened.map_err(FailureReason::Upstream)?;

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut deadline => return Err(FailureReason::Timeout(timeout)),
                _ = self.relay.disconnected() => return Err(FailureReason::Disconnected),
                next = events.next() => next,
            };

            let Some(event) = next else {
                return Err(FailureReason::Truncated);
            };

            match self.on_event(event) {
                Step::Forward(text) => {
                    let sent = tokio::select! {
                        sent = self.relay.send(&text) => sent,
                        _ = &mut deadline => return Err(FailureReason::Timeout(timeout)),
                    };
                    sent.map_err(|_| FailureReason::Disconnected)?;
                }
                Step::Suppressed => debug!("Suppressed echoed opening delta"),
                Step::Ignored => {}
                Step::Fail(e) => return Err(FailureReason::Upstream(e)),
                Step::Finalize => return Ok(()),
            }
        }
    }

    async fn finalize(
        mut self,
        history: &HistoryLog,
        quota: &QuotaGate,
        start: Instant,
    ) -> TurnOutcome {
        let conversation_id = self.request.conversation_id.clone();
        let committed = history
            .commit(&conversation_id, &self.request.human_text, &self.buffer)
            .await;

        let history_len = match committed {
            Ok(result) => result.length,
            Err(e) => {
                METRICS.lost_writes.inc();
                error!(
                    "Reply for {} was streamed but not saved: {}",
                    conversation_id, e
                );
                return self
                    .fail(FailureReason::Persistence(e.to_string()), quota, start)
                    .await;
            }
        };

        self.relay.close();
        self.state = SessionState::Closed;
        METRICS.record_turn("completed", start.elapsed().as_secs_f64());
        info!(
            "Turn for conversation {} completed in {:?}",
            conversation_id,
            start.elapsed()
        );

        TurnOutcome::Completed {
            ai_text: std::mem::take(&mut self.buffer),
            history_len,
        }
    }

    async fn fail(mut self, reason: FailureReason, quota: &QuotaGate, start: Instant) -> TurnOutcome {
        match &reason {
            FailureReason::Disconnected => {
                self.relay.close();
            }
            other => {
                self.relay.fail(&other.to_string());
            }
        }
        self.state = SessionState::Failed;

        if let Err(e) = quota.refund(&self.request.account_id).await {
            warn!(
                "Allowance for {} not refunded after failed turn: {}",
                self.request.account_id, e
            );
        }

        METRICS.record_turn(reason.label(), start.elapsed().as_secs_f64());
        warn!(
            "Turn for conversation {} failed: {}",
            self.request.conversation_id, reason
        );
        TurnOutcome::Failed(reason)
    }
}
