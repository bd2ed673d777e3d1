use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::SinkExt;
use tracing::{info, warn};

use crate::api::types::GenerateRequest;
use crate::inference::generator::StreamEvent;
use crate::inference::InferenceService;
use crate::metrics::METRICS;
use crate::model::ModelManager;

#[derive(Clone)]
pub struct AppState {
    pub models: Arc<ModelManager>,
    pub infer: Arc<InferenceService>,
}

pub fn ws_router() -> Router<AppState> {
    Router::new().route("/api/v1/generate/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One request frame in, the stream's events out as text frames, then close.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let request = loop {
        match socket.recv().await {
            Some(Ok(WsMessage::Text(raw))) => {
                match serde_json::from_str::<GenerateRequest>(raw.as_str()) {
                    Ok(request) => break request,
                    Err(err) => {
                        let _ = send_event(
                            &mut socket,
                            &StreamEvent::Error {
                                message: format!("invalid request: {err}"),
                            },
                        )
                        .await;
                        let _ = socket.close().await;
                        return;
                    }
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(%err, "websocket receive failed");
                return;
            }
        }
    };

    METRICS.record_request();
    METRICS.record_generation();

    let history = request.history_turns();
    match state.infer.generate_stream(&request.prompt, history).await {
        Ok(mut events) => {
            while let Some(event) = events.recv().await {
                match &event {
                    StreamEvent::Complete { tokens, .. } => METRICS.add_tokens(*tokens as u64),
                    StreamEvent::Error { .. } => METRICS.record_error(),
                    StreamEvent::Token { .. } => {}
                }
                if send_event(&mut socket, &event).await.is_err() {
                    info!("websocket client disconnected during stream");
                    return;
                }
            }
        }
        Err(err) => {
            METRICS.record_error();
            let _ = send_event(
                &mut socket,
                &StreamEvent::Error {
                    message: err.to_string(),
                },
            )
            .await;
        }
    }

    let _ = socket.close().await;
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).unwrap_or_default();
    socket.send(WsMessage::Text(payload.into())).await
}
