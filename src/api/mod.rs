pub mod handlers;
pub mod types;

use axum::routing::{get, post};
use axum::Router;

use crate::ws::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/generate", post(handlers::generate))
        .route("/api/v1/generate/stream", post(handlers::generate_stream))
        .route("/api/v1/embeddings", post(handlers::embeddings))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
}
