//! Chat API route configuration

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{self, ChatState};

/// Build the chat router
pub fn build_router(state: ChatState, max_body_bytes: usize) -> Router {
    let api_routes = Router::new()
        .route(
            "/api/v1/chats/:id",
            get(handlers::get_chat).post(handlers::post_message),
        )
        .route("/api/v1/chats/:id/turns", post(handlers::post_turn))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state);

    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics));

    public_routes
        .merge(api_routes)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
