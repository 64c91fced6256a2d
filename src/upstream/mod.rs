//! Upstream assistant backend
//!
//! The assistant backend is consumed through [`UpstreamClient`]: one call to
//! post the human message onto the conversation thread, one call to open a
//! run whose output arrives as a stream of [`UpstreamEvent`]s.

pub mod circuit_breaker;
pub mod config;
pub mod openai;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use config::UpstreamConfig;
pub use openai::AssistantsClient;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Upstream client error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream integration is disabled")]
    Disabled,

    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Run failed: {0}")]
    RunFailed(String),
}

/// One signal of an upstream run, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// A text part was opened; carries its initial value
    Created(String),
    /// Incremental text
    Delta(String),
    /// Tool activity shown to the client: the tool type, code input, logs
    ToolOutput(String),
    /// The run finished successfully
    End,
    /// The run failed
    Error(UpstreamError),
}

pub type EventStream = Pin<Box<dyn Stream<Item = UpstreamEvent> + Send>>;

/// Assistant backend seam
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Append a user message to an upstream thread
    async fn post_message(&self, thread_id: &str, content: &str) -> Result<(), UpstreamError>;

    /// Start a run on a thread and stream its events
    ///
    /// Dropping the returned stream aborts the run subscription.
    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<EventStream, UpstreamError>;
}
