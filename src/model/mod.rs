use std::sync::Arc;

use anyhow::Result;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::config::ModelSettings;
use crate::inference::qwen::QwenRuntime;
use crate::inference::runtime::ModelRuntime;

/// Holds the loaded model + tokenizer pair. Constructed explicitly in `main`
/// and injected through `AppState`; the load itself is lazy and
/// single-flighted, so concurrent first requests share one load and a failed
/// load is retried by the next request.
pub struct ModelManager {
    settings: ModelSettings,
    runtime: OnceCell<Arc<QwenRuntime>>,
}

impl ModelManager {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            settings,
            runtime: OnceCell::new(),
        }
    }

    pub async fn runtime(&self) -> Result<Arc<dyn ModelRuntime>> {
        let runtime = self
            .runtime
            .get_or_try_init(|| async {
                let settings = self.settings.clone();
                info!(model = settings.model_name.as_str(), "model not loaded yet, loading");
                let runtime =
                    tokio::task::spawn_blocking(move || QwenRuntime::load(&settings)).await??;
                Ok::<_, anyhow::Error>(Arc::new(runtime))
            })
            .await?;
        Ok(runtime.clone())
    }

    /// Warm the model ahead of the first request. Failure is logged only;
    /// the load will be retried (and its error surfaced) per request.
    pub async fn preload(&self) {
        if let Err(err) = self.runtime().await {
            error!(%err, "model preload failed, deferring load to first request");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.runtime.initialized()
    }

    pub fn device(&self) -> Option<String> {
        self.runtime.get().map(|runtime| runtime.device_label())
    }
}
