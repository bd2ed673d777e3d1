use std::env;
use std::str::FromStr;

use tracing::warn;

/// Service configuration, read once from the environment at startup.
/// `.env` files are honored via `dotenvy` before this is constructed.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub model: ModelSettings,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model_name: String,
    pub device: String,
    pub dtype: String,
    /// Accepted for deployment parity; collapses onto dtype selection.
    pub quantization: String,
    pub hf_token: Option<String>,
}

/// Immutable sampling + streaming knobs, shared read-only across all
/// concurrent requests.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub context_window: usize,
    pub chunk_size: usize,
    pub delay_ms: u64,
    /// Capacity of the producer/consumer handoff channel.
    pub relay_buffer: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.6,
            top_p: 0.9,
            repetition_penalty: 1.1,
            context_window: 32768,
            chunk_size: 10,
            delay_ms: 50,
            relay_buffer: 100,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 5000),
            model: ModelSettings {
                model_name: env_or("MODEL_NAME", "Qwen/Qwen2.5-3B-Instruct"),
                device: env_or("DEVICE", "cuda"),
                dtype: env_or("DTYPE", "bfloat16"),
                quantization: env_or("QUANTIZATION", "none"),
                hf_token: env::var("HUGGINGFACE_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty()),
            },
            generation: GenerationConfig {
                max_new_tokens: env_parse("MAX_NEW_TOKENS", 512),
                temperature: env_parse("TEMPERATURE", 0.6),
                top_p: env_parse("TOP_P", 0.9),
                repetition_penalty: env_parse("REPETITION_PENALTY", 1.1),
                context_window: env_parse("CONTEXT_WINDOW", 32768),
                chunk_size: env_parse("CHUNK_SIZE", 10),
                delay_ms: env_parse("DELAY_MS", 50),
                relay_buffer: env_parse("BUFFER_SIZE", 100),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = raw.as_str(), "unparsable env value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_defaults_match_service_defaults() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.max_new_tokens, 512);
        assert_eq!(cfg.chunk_size, 10);
        assert_eq!(cfg.delay_ms, 50);
        assert_eq!(cfg.context_window, 32768);
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("QWEN_SERVE_TEST_PORT", "not-a-number");
        let port: u16 = env_parse("QWEN_SERVE_TEST_PORT", 5000);
        assert_eq!(port, 5000);
        std::env::remove_var("QWEN_SERVE_TEST_PORT");
    }
}
