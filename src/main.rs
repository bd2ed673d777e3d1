use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod conversation;
mod inference;
mod metrics;
mod model;
mod ws;

use config::Settings;
use inference::InferenceService;
use model::ModelManager;
use ws::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();
    tracing::info!(
        model = settings.model.model_name.as_str(),
        device = settings.model.device.as_str(),
        "starting text generation service"
    );

    let models = Arc::new(ModelManager::new(settings.model.clone()));
    let infer = Arc::new(InferenceService::new(
        models.clone(),
        settings.generation.clone(),
    ));

    // Warm the model ahead of traffic; a failed preload only defers the load
    // (and its error) to the first request.
    tokio::spawn({
        let models = models.clone();
        async move { models.preload().await }
    });

    let state = AppState { models, infer };

    let app = Router::new()
        .merge(api::router())
        .merge(ws::ws_router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    tracing::info!(addr = addr.as_str(), "listening");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
