use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::GenerationConfig;
use crate::conversation::{ConversationTurn, PromptFormatter};

use super::runtime::{ModelRuntime, SamplingParams, TokenSink};
use super::stop::StopTokens;

/// How long to wait for the decode worker after the stream is done. A worker
/// still running past this is logged and abandoned, never joined forcibly.
const DECODE_GRACE: Duration = Duration::from_secs(2);

/// Wire-level unit of a generation stream. Every stream is zero or more
/// `Token` events followed by exactly one `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Token {
        content: String,
        /// Cumulative re-tokenized length of everything emitted so far.
        tokens: usize,
    },
    Complete {
        content: String,
        tokens: usize,
    },
    Error {
        #[serde(rename = "content")]
        message: String,
    },
}

/// Producer-to-consumer handoff unit. `Failed` is pushed by the decode
/// worker as its last word when the loop errors out, so the consumer can
/// distinguish a dead producer from a finished one.
enum RelaySignal {
    Fragment(String),
    Failed(String),
}

struct RelaySink {
    tx: mpsc::Sender<RelaySignal>,
}

impl TokenSink for RelaySink {
    fn push(&mut self, fragment: String) -> bool {
        self.tx.blocking_send(RelaySignal::Fragment(fragment)).is_ok()
    }
}

/// Orchestrates one model + tokenizer pair into an async sequence of
/// [`StreamEvent`]s: spawns the blocking decode worker, reads the token
/// relay, batches fragments into chunks, paces emission, and guarantees a
/// single terminal event per stream.
pub struct StreamingGenerator {
    runtime: Arc<dyn ModelRuntime>,
    formatter: PromptFormatter,
    stop: StopTokens,
    config: GenerationConfig,
}

impl StreamingGenerator {
    pub fn new(runtime: Arc<dyn ModelRuntime>, config: GenerationConfig) -> Self {
        let formatter = PromptFormatter::new(runtime.chat_template());
        let stop = StopTokens::for_runtime(runtime.as_ref());
        Self {
            runtime,
            formatter,
            stop,
            config,
        }
    }

    /// Full blocking decode; returns the generated continuation only. Call
    /// from a blocking context (`spawn_blocking`).
    pub fn generate(
        &self,
        prompt: &str,
        history: &[ConversationTurn],
    ) -> anyhow::Result<String> {
        let formatted = self.formatter.format(prompt, history);
        let input_ids = self
            .runtime
            .tokenize(&formatted, self.config.context_window)?;
        let params = SamplingParams::from(&self.config);
        let output_ids = self.runtime.generate(&input_ids, &params, &self.stop)?;
        self.runtime.decode(&output_ids, true)
    }

    /// Start a generation stream. The returned receiver yields the stream's
    /// events; dropping it early stops the pipeline without error.
    pub fn stream(
        &self,
        prompt: &str,
        history: &[ConversationTurn],
    ) -> mpsc::Receiver<StreamEvent> {
        let formatted = self.formatter.format(prompt, history);
        let capacity = self.config.relay_buffer.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (relay_tx, relay_rx) = mpsc::channel(capacity);

        let runtime = self.runtime.clone();
        let stop = self.stop.clone();
        let params = SamplingParams::from(&self.config);
        let context_window = self.config.context_window;

        let decode = tokio::task::spawn_blocking(move || {
            let mut sink = RelaySink {
                tx: relay_tx.clone(),
            };
            let result = runtime
                .tokenize(&formatted, context_window)
                .and_then(|input_ids| {
                    runtime.generate_stream(&input_ids, &params, &stop, &mut sink)
                });
            if let Err(err) = result {
                error!(%err, "decode worker failed");
                let _ = relay_tx.blocking_send(RelaySignal::Failed(err.to_string()));
            }
        });

        let runtime = self.runtime.clone();
        let chunk_size = self.config.chunk_size;
        let delay = Duration::from_millis(self.config.delay_ms);
        tokio::spawn(async move {
            relay_to_events(relay_rx, event_tx, runtime, chunk_size, delay).await;
            if tokio::time::timeout(DECODE_GRACE, decode).await.is_err() {
                warn!("decode worker still running after stream end, abandoning it");
            }
        });

        event_rx
    }
}

/// Consumer half of the pipeline: drains the relay, emits chunked `Token`
/// events, and terminates the stream with exactly one `Complete` or `Error`.
async fn relay_to_events(
    mut relay: mpsc::Receiver<RelaySignal>,
    events: mpsc::Sender<StreamEvent>,
    runtime: Arc<dyn ModelRuntime>,
    chunk_size: usize,
    delay: Duration,
) {
    let mut buffer: Vec<String> = Vec::new();
    let mut full = String::new();
    let mut token_count = 0usize;
    let mut produced = false;
    let mut failure: Option<String> = None;

    while let Some(signal) = relay.recv().await {
        match signal {
            RelaySignal::Fragment(fragment) => {
                produced = true;
                buffer.push(fragment);
                if buffer.len() >= chunk_size {
                    let chunk = buffer.concat();
                    buffer.clear();
                    full.push_str(&chunk);
                    token_count += runtime.count_tokens(&chunk);
                    let event = StreamEvent::Token {
                        content: chunk,
                        tokens: token_count,
                    };
                    if events.send(event).await.is_err() {
                        info!("client disconnected, stopping generation stream");
                        return;
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            RelaySignal::Failed(message) => {
                failure = Some(message);
                break;
            }
        }
    }

    // A failure before any output is an error to the caller; after partial
    // output the stream still completes with what was produced.
    if let Some(message) = failure {
        if !produced {
            let _ = events.send(StreamEvent::Error { message }).await;
            return;
        }
    }

    if !buffer.is_empty() {
        let chunk = buffer.concat();
        full.push_str(&chunk);
        token_count += runtime.count_tokens(&chunk);
        let event = StreamEvent::Token {
            content: chunk,
            tokens: token_count,
        };
        if events.send(event).await.is_err() {
            info!("client disconnected, stopping generation stream");
            return;
        }
    }

    let _ = events
        .send(StreamEvent::Complete {
            content: full,
            tokens: token_count,
        })
        .await;
}
