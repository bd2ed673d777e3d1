pub mod generator;
pub mod qwen;
pub mod runtime;
pub mod stop;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, OnceCell};

use crate::config::GenerationConfig;
use crate::conversation::ConversationTurn;
use crate::model::ModelManager;

use generator::{StreamEvent, StreamingGenerator};

/// Request-scoped facade over the streaming pipeline. The generator (and the
/// model load it implies) is built on first use and reused across calls; the
/// model and tokenizer stay shared and read-only underneath it.
pub struct InferenceService {
    manager: Arc<ModelManager>,
    config: GenerationConfig,
    generator: OnceCell<Arc<StreamingGenerator>>,
}

impl InferenceService {
    pub fn new(manager: Arc<ModelManager>, config: GenerationConfig) -> Self {
        Self {
            manager,
            config,
            generator: OnceCell::new(),
        }
    }

    async fn generator(&self) -> Result<Arc<StreamingGenerator>> {
        let generator = self
            .generator
            .get_or_try_init(|| async {
                let runtime = self.manager.runtime().await?;
                Ok::<_, anyhow::Error>(Arc::new(StreamingGenerator::new(
                    runtime,
                    self.config.clone(),
                )))
            })
            .await?;
        Ok(generator.clone())
    }

    /// Run the full decode to completion and return the continuation text.
    pub async fn generate(
        &self,
        prompt: &str,
        history: Vec<ConversationTurn>,
    ) -> Result<String> {
        let generator = self.generator().await?;
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || generator.generate(&prompt, &history)).await?
    }

    /// Start a generation stream; the receiver yields the stream's events.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        history: Vec<ConversationTurn>,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let generator = self.generator().await?;
        Ok(generator.stream(prompt, &history))
    }

    pub async fn count_tokens(&self, text: &str) -> Result<usize> {
        let runtime = self.manager.runtime().await?;
        Ok(runtime.count_tokens(text))
    }
}
