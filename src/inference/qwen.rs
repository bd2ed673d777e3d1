use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::qwen2::{Config as Qwen2Config, ModelForCausalLM as Qwen2Model};
use hf_hub::api::sync::ApiBuilder;
use rand::{thread_rng, Rng};
use serde_json::Value;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::ModelSettings;

use super::runtime::{ModelRuntime, SamplingParams, TokenSink};
use super::stop::StopTokens;

/// Candle-backed Qwen2 chat model. The model sits behind a mutex because the
/// KV cache is per-call state; the lock is held for a whole generation so
/// concurrent streams serialize rather than interleave cache entries.
pub struct QwenRuntime {
    model: Mutex<Qwen2Model>,
    tokenizer: Tokenizer,
    chat_template: Option<String>,
    eos_id: Option<u32>,
    unk_id: Option<u32>,
    device: Device,
    device_label: String,
}

impl QwenRuntime {
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let device = select_device(&settings.device);
        let device_label = if device.is_cuda() { "cuda" } else { "cpu" }.to_string();

        if settings.quantization != "none" {
            warn!(
                quantization = settings.quantization.as_str(),
                "quantized loading is not supported by this runtime, using dtype selection"
            );
        }
        let dtype = select_dtype(&settings.dtype);

        info!(
            model = settings.model_name.as_str(),
            device = device_label.as_str(),
            ?dtype,
            "loading model"
        );

        // ---- Fetch model files ----
        let mut builder = ApiBuilder::new();
        if let Some(token) = &settings.hf_token {
            builder = builder.with_token(Some(token.clone()));
        }
        let api = builder.build()?;
        let repo = api.model(settings.model_name.clone());

        let config_path = repo.get("config.json")?;
        let tokenizer_path = repo.get("tokenizer.json")?;
        let tokenizer_config: Option<Value> = repo
            .get("tokenizer_config.json")
            .ok()
            .and_then(|path| fs::read(path).ok())
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());

        let weight_files = resolve_weight_files(&repo)?;
        info!(shards = weight_files.len(), "found weight files");

        // ---- Load tokenizer ----
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| anyhow!("tokenizer error: {e}"))?;

        // ---- Load config + weights ----
        let config_bytes = fs::read(&config_path)?;
        let raw_config: Value = serde_json::from_slice(&config_bytes)?;
        let cfg: Qwen2Config = serde_json::from_slice(&config_bytes)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weight_files, dtype, &device)? };
        let model = Qwen2Model::new(&cfg, vb)?;

        let chat_template = tokenizer_config
            .as_ref()
            .and_then(|v| v["chat_template"].as_str())
            .map(str::to_string);

        let eos_id = eos_from_config(&raw_config).or_else(|| {
            special_token_name(tokenizer_config.as_ref(), "eos_token")
                .and_then(|name| tokenizer.token_to_id(&name))
        });
        let unk_id = special_token_name(tokenizer_config.as_ref(), "unk_token")
            .and_then(|name| tokenizer.token_to_id(&name));

        info!(
            eos = ?eos_id,
            has_template = chat_template.is_some(),
            "model loaded"
        );

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            chat_template,
            eos_id,
            unk_id,
            device,
            device_label,
        })
    }
}

impl ModelRuntime for QwenRuntime {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("tokenizer encode error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special)
            .map_err(|e| anyhow!("tokenizer decode error: {e}"))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_id
    }

    fn unk_token_id(&self) -> Option<u32> {
        self.unk_id
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    fn chat_template(&self) -> Option<String> {
        self.chat_template.clone()
    }

    fn device_label(&self) -> String {
        self.device_label.clone()
    }

    fn generate(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        stop: &StopTokens,
    ) -> Result<Vec<u32>> {
        if input_ids.is_empty() {
            bail!("empty prompt after tokenization");
        }

        let mut model = self.model.lock().map_err(|_| anyhow!("model lock poisoned"))?;
        model.clear_kv_cache();

        let mut tokens = input_ids.to_vec();
        let mut generated: Vec<u32> = Vec::new();
        let mut lp = LogitsProcessor::new(
            sampling_seed(),
            Some(params.temperature),
            Some(params.top_p),
        );
        let mut pos = 0usize;

        for _ in 0..params.max_new_tokens {
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                std::slice::from_ref(tokens.last().unwrap())
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let logits = model
                .forward(&input, pos)?
                .squeeze(0)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            pos += ctx.len();

            let logits = if (params.repetition_penalty - 1.0).abs() > f32::EPSILON {
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repetition_penalty,
                    &tokens,
                )?
            } else {
                logits
            };

            let next = lp.sample(&logits)?;
            tokens.push(next);

            if stop.is_stop(next) {
                break;
            }
            generated.push(next);
        }

        Ok(generated)
    }

    fn generate_stream(
        &self,
        input_ids: &[u32],
        params: &SamplingParams,
        stop: &StopTokens,
        sink: &mut dyn TokenSink,
    ) -> Result<()> {
        if input_ids.is_empty() {
            bail!("empty prompt after tokenization");
        }

        let mut model = self.model.lock().map_err(|_| anyhow!("model lock poisoned"))?;
        model.clear_kv_cache();

        let mut tokens = input_ids.to_vec();
        let mut generated: Vec<u32> = Vec::new();
        let mut emitted_len = 0usize;
        let mut lp = LogitsProcessor::new(
            sampling_seed(),
            Some(params.temperature),
            Some(params.top_p),
        );
        let mut pos = 0usize;

        for _ in 0..params.max_new_tokens {
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                std::slice::from_ref(tokens.last().unwrap())
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let logits = model
                .forward(&input, pos)?
                .squeeze(0)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            pos += ctx.len();

            let logits = if (params.repetition_penalty - 1.0).abs() > f32::EPSILON {
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repetition_penalty,
                    &tokens,
                )?
            } else {
                logits
            };

            let next = lp.sample(&logits)?;
            tokens.push(next);

            if stop.is_stop(next) {
                break;
            }
            generated.push(next);

            let decoded = match self.tokenizer.decode(&generated, true) {
                Ok(s) => s,
                Err(_) => continue,
            };

            // A trailing replacement character means we are mid-way through a
            // multi-byte sequence; hold the fragment back until it resolves.
            if decoded.contains('\u{FFFD}') {
                continue;
            }

            if decoded.len() < emitted_len {
                emitted_len = decoded.len();
            }
            if decoded.len() > emitted_len {
                let delta = decoded[emitted_len..].to_string();
                emitted_len = decoded.len();
                if !sink.push(delta) {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

fn select_device(requested: &str) -> Device {
    match requested {
        "cuda" => match Device::new_cuda(0) {
            Ok(device) => device,
            Err(err) => {
                warn!(%err, "CUDA unavailable, falling back to CPU");
                Device::Cpu
            }
        },
        _ => Device::Cpu,
    }
}

fn select_dtype(requested: &str) -> DType {
    match requested {
        "float16" | "f16" => DType::F16,
        "bfloat16" | "bf16" => DType::BF16,
        "float32" | "f32" => DType::F32,
        other => {
            warn!(dtype = other, "unknown dtype, using float32");
            DType::F32
        }
    }
}

fn resolve_weight_files(repo: &hf_hub::api::sync::ApiRepo) -> Result<Vec<PathBuf>> {
    match repo.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let index: Value = serde_json::from_slice(&fs::read(&index_path)?)?;
            let weight_map = index["weight_map"]
                .as_object()
                .ok_or_else(|| anyhow!("malformed safetensors index"))?;
            let mut names: Vec<&str> = weight_map.values().filter_map(Value::as_str).collect();
            names.sort_unstable();
            names.dedup();
            names
                .into_iter()
                .map(|name| repo.get(name).map_err(anyhow::Error::from))
                .collect()
        }
        Err(_) => Ok(vec![repo.get("model.safetensors")?]),
    }
}

fn eos_from_config(raw: &Value) -> Option<u32> {
    match &raw["eos_token_id"] {
        Value::Number(n) => n.as_u64().map(|v| v as u32),
        Value::Array(ids) => ids.first().and_then(Value::as_u64).map(|v| v as u32),
        _ => None,
    }
}

/// Special tokens in `tokenizer_config.json` are either plain strings or
/// `{"content": ...}` objects depending on the exporter.
fn special_token_name(config: Option<&Value>, key: &str) -> Option<String> {
    let entry = &config?[key];
    match entry {
        Value::String(name) => Some(name.clone()),
        Value::Object(obj) => obj.get("content").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn sampling_seed() -> u64 {
    thread_rng().gen()
}
