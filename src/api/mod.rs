//! HTTP surface of the chat service

pub mod handlers;
pub mod models;
pub mod routes;

pub use handlers::ChatState;
pub use routes::build_router;
