use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::api::models::{
    error_codes, ApiError, ChatQuery, ChatResponse, MessageRequest, MessageResponse,
};
use crate::chat::{sse_response, ChatService};
use crate::error::RelayError;
use crate::metrics::METRICS;
use crate::upstream::UpstreamError;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// Chat API state
#[derive(Clone)]
pub struct ChatState {
    pub service: Arc<ChatService>,
}

/// Map a service error to its status code and payload
pub fn error_response(e: RelayError) -> (StatusCode, Json<ApiError>) {
    let (status, code) = match &e {
        RelayError::NotFound(_) => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
        RelayError::InvalidState(_) => (StatusCode::BAD_REQUEST, error_codes::INVALID_STATE),
        RelayError::QuotaDenied => (StatusCode::BAD_REQUEST, error_codes::QUOTA_EXCEEDED),
        RelayError::Validation(_) => (StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR),
        RelayError::Conflict(_) => (StatusCode::CONFLICT, error_codes::CONFLICT),
        RelayError::UpstreamFailure(upstream) => match upstream {
            UpstreamError::Disabled => {
                (StatusCode::SERVICE_UNAVAILABLE, error_codes::UPSTREAM_DISABLED)
            }
            UpstreamError::CircuitOpen(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, error_codes::UPSTREAM_ERROR)
            }
            UpstreamError::Timeout(_) => (StatusCode::BAD_GATEWAY, error_codes::TIMEOUT),
            _ => (StatusCode::BAD_GATEWAY, error_codes::UPSTREAM_ERROR),
        },
        RelayError::PersistenceFailure(_) | RelayError::Config(_) | RelayError::Internal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR)
        }
    };

    if status.is_server_error() {
        error!("Chat request failed: {}", e);
    } else {
        warn!("Chat request rejected: {}", e);
    }

    // Internal details stay in the logs
    let message = match status {
        StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
        _ => e.to_string(),
    };
    (status, Json(ApiError::new(code, message)))
}

fn observe(endpoint: &str, start: Instant) {
    METRICS.chat_request_duration
        .with_label_values(&[endpoint])
        .observe(start.elapsed().as_secs_f64());
}

/// Submit a message for a conversation
///
/// POST /api/v1/chats/:id
pub async fn post_message(
    State(state): State<ChatState>,
    Path(id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let start = Instant::now();
    info!("Message submission for chat {}", id);

    let result = state.service.submit_message(&id, &request.message).await;
    observe("submit", start);

    result
        .map(|()| Json(MessageResponse::new("Message posted successfully")))
        .map_err(error_response)
}

/// Fetch a conversation, or stream its pending turn with `?stream=true`
///
/// GET /api/v1/chats/:id
pub async fn get_chat(
    State(state): State<ChatState>,
    Path(id): Path<String>,
    Query(query): Query<ChatQuery>,
) -> ApiResult<Response> {
    let start = Instant::now();

    if query.stream {
        info!("Stream request for chat {}", id);
        let handle = state.service.open_stream(&id).await.map_err(error_response);
        observe("stream_open", start);
        return Ok(sse_response(handle?.frames));
    }

    let conversation = crate::time_operation!(
        METRICS.chat_request_duration,
        "fetch",
        state.service.fetch(&id).await
    )
    .map_err(error_response)?;

    Ok(Json(ChatResponse {
        chat: conversation.into(),
    })
    .into_response())
}

/// Submit a message and stream its reply in one request
///
/// POST /api/v1/chats/:id/turns
pub async fn post_turn(
    State(state): State<ChatState>,
    Path(id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> ApiResult<Response> {
    let start = Instant::now();
    info!("One-shot turn for chat {}", id);

    let handle = state
        .service
        .run_turn(&id, &request.message)
        .await
        .map_err(error_response);
    observe("turn", start);

    Ok(sse_response(handle?.frames))
}

/// GET /metrics
pub async fn metrics() -> String {
    METRICS.export_prometheus()
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
