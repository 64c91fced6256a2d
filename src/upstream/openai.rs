//! OpenAI Assistants API client with retry and circuit breaker

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::config::UpstreamConfig;
use super::{EventStream, UpstreamClient, UpstreamError, UpstreamEvent};
use crate::metrics::METRICS;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, error, warn};

const OP_POST_MESSAGE: &str = "post_message";
const OP_STREAM_RUN: &str = "stream_run";
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Assistants API client
pub struct AssistantsClient {
    http: Client,
    config: UpstreamConfig,
    breaker: CircuitBreaker,
}

impl AssistantsClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        // No overall request timeout: runs stream for minutes. Non-streaming
        // calls set their own timeout per request.
        let http = Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| UpstreamError::RequestFailed(e.to_string()))?;

        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failures,
            reset_timeout: config.breaker_reset_timeout(),
        });

        Ok(Self {
            http,
            config,
            breaker,
        })
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header("OpenAI-Beta", "assistants=v2");
        match &self.config.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }

    fn guard(&self, operation: &'static str) -> Result<(), UpstreamError> {
        if !self.config.enabled {
            METRICS.record_upstream(operation, "disabled");
            return Err(UpstreamError::Disabled);
        }
        if self.breaker.is_open(operation) {
            METRICS.record_upstream(operation, "circuit_open");
            error!("Circuit breaker is open for {}", operation);
            return Err(UpstreamError::CircuitOpen(operation.to_string()));
        }
        Ok(())
    }

    async fn call_post_message(&self, thread_id: &str, content: &str) -> Result<(), UpstreamError> {
        let url = format!("{}/threads/{}/messages", self.config.base_url, thread_id);
        let body = serde_json::json!({
            "role": "user",
            "content": content,
        });

        let response = self
            .authorize(self.http.post(&url).json(&body))
            .timeout(self.config.timeout())
            .send()
            .await
            .map_err(map_send_error)?;

        check_status(response).await.map(|_| ())
    }

    fn calculate_backoff(&self, attempt: usize) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1) as u32);
        self.config.retry_backoff().saturating_mul(multiplier)
    }
}

#[async_trait]
impl UpstreamClient for AssistantsClient {
    async fn post_message(&self, thread_id: &str, content: &str) -> Result<(), UpstreamError> {
        let start = Instant::now();
        self.guard(OP_POST_MESSAGE)?;

        let mut attempt = 0;
        loop {
            attempt += 1;

            match self.call_post_message(thread_id, content).await {
                Ok(()) => {
                    self.breaker.mark_success(OP_POST_MESSAGE);
                    METRICS.record_upstream(OP_POST_MESSAGE, "success");
                    METRICS.upstream_request_duration
                        .with_label_values(&[OP_POST_MESSAGE])
                        .observe(start.elapsed().as_secs_f64());
                    debug!("Message posted to thread {}", thread_id);
                    return Ok(());
                }
                Err(e) => {
                    self.breaker.mark_failure(OP_POST_MESSAGE);
                    METRICS.record_upstream(OP_POST_MESSAGE, "error");

                    if attempt > self.config.retry_attempts {
                        error!("Posting message failed after {} attempts: {}", attempt, e);
                        return Err(e);
                    }

                    let backoff = self.calculate_backoff(attempt);
                    warn!(
                        "Post message attempt {} failed: {}, retrying in {:?}",
                        attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<EventStream, UpstreamError> {
        self.guard(OP_STREAM_RUN)?;

        let url = format!("{}/threads/{}/runs", self.config.base_url, thread_id);
        let body = serde_json::json!({
            "assistant_id": assistant_id,
            "stream": true,
        });

        // Starting a run is not idempotent, so it is never retried
        let response = match self.authorize(self.http.post(&url).json(&body)).send().await {
            Ok(response) => response,
            Err(e) => {
                self.breaker.mark_failure(OP_STREAM_RUN);
                METRICS.record_upstream(OP_STREAM_RUN, "error");
                return Err(map_send_error(e));
            }
        };

        let response = match check_status(response).await {
            Ok(response) => response,
            Err(e) => {
                self.breaker.mark_failure(OP_STREAM_RUN);
                METRICS.record_upstream(OP_STREAM_RUN, "error");
                return Err(e);
            }
        };

        self.breaker.mark_success(OP_STREAM_RUN);
        METRICS.record_upstream(OP_STREAM_RUN, "success");
        debug!("Run stream opened for thread {}", thread_id);

        Ok(decode_event_stream(response))
    }
}

fn map_send_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(e.to_string())
    } else {
        UpstreamError::RequestFailed(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Turn a run's `text/event-stream` body into upstream events
fn decode_event_stream(response: Response) -> EventStream {
    let bytes = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    let lines = FramedRead::new(
        StreamReader::new(bytes),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );

    let stream = async_stream::stream! {
        tokio::pin!(lines);
        let mut decoder = SseDecoder::default();

        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    for event in decoder.push_line(&line) {
                        yield event;
                    }
                }
                Err(e) => {
                    yield UpstreamEvent::Error(UpstreamError::RequestFailed(e.to_string()));
                    return;
                }
            }
        }

        for event in decoder.finish() {
            yield event;
        }
    };

    Box::pin(stream)
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: DeltaBody,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Vec<DeltaPart>,
}

#[derive(Debug, Deserialize)]
struct DeltaPart {
    index: u32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<DeltaText>,
}

#[derive(Debug, Deserialize)]
struct DeltaText {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct StepDelta {
    #[serde(default)]
    id: String,
    #[serde(default)]
    delta: Option<StepDeltaBody>,
}

#[derive(Debug, Deserialize)]
struct StepDeltaBody {
    #[serde(default)]
    step_details: Option<StepDetails>,
}

#[derive(Debug, Deserialize)]
struct StepDetails {
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: u32,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    code_interpreter: Option<CodeInterpreterDelta>,
}

#[derive(Debug, Deserialize)]
struct CodeInterpreterDelta {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    outputs: Option<Vec<CodeOutput>>,
}

#[derive(Debug, Deserialize)]
struct CodeOutput {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    logs: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunSnapshot {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    message: String,
}

/// Server-sent event decoder for Assistants run streams
///
/// Like the official SDKs, the first delta of each text part is reported
/// twice: once as `Created` carrying the opening value and once as `Delta`.
/// Code interpreter activity from run step deltas becomes `ToolOutput`.
#[derive(Debug, Default)]
struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
    opened_parts: HashSet<u32>,
    /// (step id, tool call index) pairs already announced
    opened_tools: HashSet<(String, u32)>,
}

impl SseDecoder {
    fn push_line(&mut self, line: &str) -> Vec<UpstreamEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // Comments and unknown fields are ignored
        Vec::new()
    }

    fn finish(&mut self) -> Vec<UpstreamEvent> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Vec<UpstreamEvent> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data).join("\n");
        let Some(event) = event else {
            return Vec::new();
        };

        match event.as_str() {
            "thread.message.delta" => self.decode_message_delta(&data),
            "thread.run.step.delta" => self.decode_step_delta(&data),
            "thread.run.completed" | "done" => vec![UpstreamEvent::End],
            "thread.run.failed" | "thread.run.cancelled" | "thread.run.expired" => {
                let reason = serde_json::from_str::<RunSnapshot>(&data)
                    .ok()
                    .and_then(|run| {
                        run.last_error
                            .map(|e| e.message)
                            .or(run.status)
                    })
                    .unwrap_or_else(|| event.clone());
                vec![UpstreamEvent::Error(UpstreamError::RunFailed(reason))]
            }
            "error" => vec![UpstreamEvent::Error(UpstreamError::RunFailed(data))],
            other => {
                debug!("Ignoring upstream event {}", other);
                Vec::new()
            }
        }
    }

    fn decode_message_delta(&mut self, data: &str) -> Vec<UpstreamEvent> {
        let delta: MessageDelta = match serde_json::from_str(data) {
            Ok(delta) => delta,
            Err(e) => {
                return vec![UpstreamEvent::Error(UpstreamError::InvalidEvent(
                    e.to_string(),
                ))]
            }
        };

        let mut events = Vec::new();
        for part in delta.delta.content {
            if part.kind != "text" {
                continue;
            }
            let value = part.text.map(|t| t.value).unwrap_or_default();
            if self.opened_parts.insert(part.index) {
                events.push(UpstreamEvent::Created(value.clone()));
            }
            events.push(UpstreamEvent::Delta(value));
        }
        events
    }

    fn decode_step_delta(&mut self, data: &str) -> Vec<UpstreamEvent> {
        let step: StepDelta = match serde_json::from_str(data) {
            Ok(step) => step,
            Err(e) => {
                return vec![UpstreamEvent::Error(UpstreamError::InvalidEvent(
                    e.to_string(),
                ))]
            }
        };
        let Some(details) = step.delta.and_then(|d| d.step_details) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for call in details.tool_calls {
            let kind = call.kind.unwrap_or_default();
            if self.opened_tools.insert((step.id.clone(), call.index)) && !kind.is_empty() {
                events.push(UpstreamEvent::ToolOutput(kind.clone()));
            }
            if kind != "code_interpreter" {
                continue;
            }
            let Some(code) = call.code_interpreter else {
                continue;
            };

            if let Some(input) = code.input.filter(|input| !input.is_empty()) {
                events.push(UpstreamEvent::ToolOutput(input));
            }
            if let Some(outputs) = code.outputs {
                events.push(UpstreamEvent::ToolOutput("\noutput >\n".to_string()));
                for output in outputs {
                    if output.kind == "logs" {
                        if let Some(logs) = output.logs {
                            events.push(UpstreamEvent::ToolOutput(logs));
                        }
                    }
                }
            }
        }
        events
    }
}
