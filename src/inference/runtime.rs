use anyhow::Result;

use crate::config::GenerationConfig;

use super::stop::StopTokens;

/// Sampling knobs handed to the decode loop; a per-call snapshot of the
/// service-wide [`GenerationConfig`].
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
}

impl From<&GenerationConfig> for SamplingParams {
    fn from(cfg: &GenerationConfig) -> Self {
        Self {
            max_new_tokens: cfg.max_new_tokens,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            repetition_penalty: cfg.repetition_penalty,
        }
    }
}

/// Receives decoded text fragments from the blocking decode loop.
pub trait TokenSink {
    /// Hand one fragment downstream. Returns `false` when the consumer is
    /// gone and decoding should stop early.
    fn push(&mut self, fragment: String) -> bool;
}

/// Contract the loaded model + tokenizer pair must satisfy. The streaming
/// pipeline only ever talks to this trait; the candle-backed Qwen runtime
/// lives in [`super::qwen`].
pub trait ModelRuntime: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String>;

    fn eos_token_id(&self) -> Option<u32>;

    fn unk_token_id(&self) -> Option<u32>;

    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Raw chat-template source shipped with the model, when present.
    fn chat_template(&self) -> Option<String>;

    fn device_label(&self) -> String;

    /// Prompt ids capped at `limit`, keeping the most recent tokens: when the
    /// encoded prompt overflows, the oldest ids are dropped from the front.
    fn tokenize(&self, text: &str, limit: usize) -> Result<Vec<u32>> {
        let mut ids = self.encode(text)?;
        if ids.len() > limit {
            ids.drain(..ids.len() - limit);
        }
        Ok(ids)
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.encode(text).map(|ids| ids.len()).unwrap_or(0)
    }

    /// Full blocking decode; returns the generated continuation only (prompt
    /// ids excluded).
    fn generate(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        stop: &StopTokens,
    ) -> Result<Vec<u32>>;

    /// Blocking decode loop that pushes each decoded fragment into `sink` as
    /// it becomes available. Stops early on a stop token, the
    /// `max_new_tokens` cap, or `sink.push` returning `false`.
    fn generate_stream(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        stop: &StopTokens,
        sink: &mut dyn TokenSink,
    ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};

    use super::{ModelRuntime, SamplingParams, TokenSink};
    use crate::inference::stop::StopTokens;

    /// Scripted stand-in for the model runtime: plays back a fixed fragment
    /// sequence, optionally failing partway through. Encoding is one id per
    /// character so token counts are deterministic.
    pub struct ScriptedRuntime {
        pub fragments: Vec<String>,
        /// Fail after this many fragments have been pushed (0 = before any).
        pub fail_after: Option<usize>,
        pub eos: Option<u32>,
        pub unk: Option<u32>,
        pub vocab: Vec<(String, u32)>,
        pub template: Option<String>,
        pub pushed: AtomicUsize,
        pub finished: AtomicBool,
        pub seen_input: Mutex<Option<Vec<u32>>>,
    }

    impl ScriptedRuntime {
        pub fn with_fragments(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                fail_after: None,
                eos: Some(2),
                unk: None,
                vocab: Vec::new(),
                template: None,
                pushed: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
                seen_input: Mutex::new(None),
            }
        }

        pub fn failing_after(mut self, n: usize) -> Self {
            self.fail_after = Some(n);
            self
        }
    }

    impl ModelRuntime for ScriptedRuntime {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.chars().map(|c| c as u32).collect())
        }

        fn decode(&self, ids: &[u32], _skip_special: bool) -> Result<String> {
            ids.iter()
                .map(|&id| char::from_u32(id).ok_or_else(|| anyhow!("bad id {id}")))
                .collect()
        }

        fn eos_token_id(&self) -> Option<u32> {
            self.eos
        }

        fn unk_token_id(&self) -> Option<u32> {
            self.unk
        }

        fn token_to_id(&self, token: &str) -> Option<u32> {
            self.vocab
                .iter()
                .find(|(t, _)| t == token)
                .map(|(_, id)| *id)
        }

        fn chat_template(&self) -> Option<String> {
            self.template.clone()
        }

        fn device_label(&self) -> String {
            "test".into()
        }

        fn generate(
            &self,
            _input_ids: &[u32],
            _params: &SamplingParams,
            _stop: &StopTokens,
        ) -> Result<Vec<u32>> {
            if self.fail_after.is_some() {
                return Err(anyhow!("scripted decode failure"));
            }
            self.encode(&self.fragments.concat())
        }

        fn generate_stream(
            &self,
            input_ids: &[u32],
            _params: &SamplingParams,
            _stop: &StopTokens,
            sink: &mut dyn TokenSink,
        ) -> Result<()> {
            *self.seen_input.lock().unwrap() = Some(input_ids.to_vec());
            for (i, fragment) in self.fragments.iter().enumerate() {
                if self.fail_after == Some(i) {
                    self.finished.store(true, Ordering::SeqCst);
                    return Err(anyhow!("scripted decode failure"));
                }
                if !sink.push(fragment.clone()) {
                    break;
                }
                self.pushed.fetch_add(1, Ordering::SeqCst);
            }
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn tokenize_keeps_the_most_recent_tokens() {
            let runtime = ScriptedRuntime::with_fragments(&[]);
            let ids = runtime.tokenize("abcdef", 3).unwrap();
            // Tail survives truncation: 'd', 'e', 'f'.
            assert_eq!(ids, vec!['d' as u32, 'e' as u32, 'f' as u32]);
        }

        #[test]
        fn tokenize_is_untouched_under_the_limit() {
            let runtime = ScriptedRuntime::with_fragments(&[]);
            let ids = runtime.tokenize("abc", 10).unwrap();
            assert_eq!(ids.len(), 3);
        }

        #[test]
        fn count_tokens_matches_encoding() {
            let runtime = ScriptedRuntime::with_fragments(&[]);
            assert_eq!(runtime.count_tokens("Hello, world!"), 13);
            assert_eq!(runtime.count_tokens(""), 0);
        }
    }
}
