pub mod client_id;
pub mod config;
pub mod error;
pub mod handler;
pub mod rate_limit;
pub mod relay;
pub mod request;
pub mod upstream;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use handler::AdvisorState;

/// Build the HTTP router: the chat endpoint plus a health probe.
pub fn router(state: AdvisorState) -> Router {
    Router::new()
        .route("/api/chat", post(handler::chat_handler))
        .route("/health", get(handler::health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
