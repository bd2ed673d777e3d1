use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{Json, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use serde_json::{json, Value};
use tracing::debug;

use crate::api::types::{EmbeddingRequest, GenerateRequest, GenerateResponse};
use crate::inference::generator::StreamEvent;
use crate::metrics::METRICS;
use crate::ws::AppState;

/// Boundary error: everything the service cannot recover from internally
/// leaves as a JSON `detail` payload, never as a bare protocol failure.
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    METRICS.record_error();
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        detail: err.to_string(),
    }
}

pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    METRICS.record_request();
    METRICS.record_generation();

    if let Some(model) = &request.model {
        debug!(model = model.as_str(), "per-request model ignored, single-model service");
    }

    let history = request.history_turns();
    let response = state
        .infer
        .generate(&request.prompt, history)
        .await
        .map_err(internal)?;
    let tokens = state.infer.count_tokens(&response).await.map_err(internal)?;
    METRICS.add_tokens(tokens as u64);

    Ok(Json(GenerateResponse { response, tokens }))
}

pub async fn generate_stream(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    METRICS.record_request();
    METRICS.record_generation();

    let history = request.history_turns();
    let events = match state.infer.generate_stream(&request.prompt, history).await {
        Ok(events) => events,
        Err(err) => {
            // Generator setup failed (typically: model load); the stream
            // still terminates with a well-formed error line.
            METRICS.record_error();
            let line = ndjson_line(&StreamEvent::Error {
                message: err.to_string(),
            });
            return ndjson_response(Body::from(line));
        }
    };

    let body = stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        match &event {
            StreamEvent::Complete { tokens, .. } => METRICS.add_tokens(*tokens as u64),
            StreamEvent::Error { .. } => METRICS.record_error(),
            StreamEvent::Token { .. } => {}
        }
        Some((
            Ok::<_, Infallible>(Bytes::from(ndjson_line(&event))),
            events,
        ))
    });

    ndjson_response(Body::from_stream(body))
}

pub async fn embeddings(Json(_request): Json<EmbeddingRequest>) -> impl IntoResponse {
    METRICS.record_request();
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({ "detail": "Embeddings endpoint not yet implemented" })),
    )
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "model_loaded": state.models.is_loaded(),
        "device": state.models.device(),
    }))
}

pub async fn metrics() -> Json<Value> {
    Json(METRICS.snapshot())
}

fn ndjson_line(event: &StreamEvent) -> String {
    let mut line = serde_json::to_string(event).unwrap_or_default();
    line.push('\n');
    line
}

fn ndjson_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}
