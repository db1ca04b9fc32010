//! In-process generation from quantized GGUF weights (candle).
//!
//! Weights resolve from `<models_dir>/<model name>/{model.gguf,tokenizer.json}`
//! or are fetched from the Hugging Face hub on first use. Generation against
//! one set of weights is serialized through a mutex.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;

use super::{
    Architecture, BackendError, ChatMessage, ConfigError, LocalWeights, ModelConfig,
    ResolvedOptions,
};
use crate::pipeline::prompt_templates::{formatter_for, PromptFormatter};

/// Tokens of history considered by the repetition penalty.
const REPEAT_LAST_N: usize = 64;

/// End-of-sequence markers across the supported families.
const EOS_MARKERS: &[&str] = &["</s>", "<|im_end|>", "<|endoftext|>"];

enum Weights {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl Weights {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::Llama(m) => m.forward(input, index_pos),
            Self::Qwen2(m) => m.forward(input, index_pos),
        }
    }
}

struct LoadedModel {
    weights: Weights,
    tokenizer: Tokenizer,
    device: Device,
    eos_tokens: Vec<u32>,
}

/// Locally loaded GGUF model.
pub struct LocalBackend {
    config: ModelConfig,
    formatter: PromptFormatter,
    model: Mutex<Option<LoadedModel>>,
}

impl LocalBackend {
    /// Load weights and tokenizer for `config`.
    pub fn load(config: ModelConfig, models_dir: &Path) -> Result<Self, ConfigError> {
        let load_err = |reason: String| ConfigError::ModelLoad {
            model: config.name.clone(),
            reason,
        };
        let weights = config
            .local_weights
            .clone()
            .ok_or_else(|| load_err("no GGUF weights configured".into()))?;

        let (weights_path, tokenizer_path) =
            resolve_files(&config.name, &weights, models_dir).map_err(load_err)?;

        let device = Device::cuda_if_available(0).map_err(|e| load_err(e.to_string()))?;

        let mut file = File::open(&weights_path)
            .map_err(|e| load_err(format!("{}: {e}", weights_path.display())))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| load_err(format!("GGUF read failed: {e}")))?;
        let model_weights = match weights.architecture {
            Architecture::Llama => {
                quantized_llama::ModelWeights::from_gguf(content, &mut file, &device)
                    .map(Weights::Llama)
            }
            Architecture::Qwen2 => {
                quantized_qwen2::ModelWeights::from_gguf(content, &mut file, &device)
                    .map(Weights::Qwen2)
            }
        }
        .map_err(|e| load_err(format!("weights load failed: {e}")))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| load_err(format!("Tokenizer load failed: {e}")))?;

        let eos_tokens = EOS_MARKERS
            .iter()
            .copied()
            .chain(config.stop_tokens.iter().map(String::as_str))
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();

        tracing::info!(
            model = %config.name,
            weights = %weights_path.display(),
            device = ?device,
            "Local model loaded"
        );

        Ok(Self {
            formatter: formatter_for(&config.name),
            config,
            model: Mutex::new(Some(LoadedModel {
                weights: model_weights,
                tokenizer,
                device,
                eos_tokens,
            })),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn generate(
        &self,
        messages: &[ChatMessage],
        options: &ResolvedOptions,
    ) -> Result<String, BackendError> {
        let prompt = self.formatter.format(messages);

        let mut guard = self
            .model
            .lock()
            .map_err(|_| BackendError::Inference("Model lock poisoned".into()))?;
        let loaded = guard.as_mut().ok_or(BackendError::Closed)?;

        let prompt_tokens = loaded
            .tokenizer
            .encode(prompt.as_str(), false)
            .map_err(|e| BackendError::Inference(format!("Tokenization failed: {e}")))?
            .get_ids()
            .to_vec();

        if prompt_tokens.len() + options.max_tokens as usize > self.config.context_window as usize {
            return Err(BackendError::PromptTooLong {
                prompt_tokens: prompt_tokens.len(),
                max_tokens: options.max_tokens,
                context_window: self.config.context_window,
            });
        }

        let generated = sample_tokens(loaded, &prompt_tokens, options)
            .map_err(|e| BackendError::Inference(e.to_string()))?;

        let text = loaded
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| BackendError::Inference(format!("Detokenization failed: {e}")))?;

        Ok(truncate_at_stop(&text, &options.stop).trim().to_string())
    }

    pub fn shutdown(&self) {
        if let Ok(mut model) = self.model.lock() {
            if model.take().is_some() {
                tracing::info!(model = %self.config.name, "Local model unloaded");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.model.lock().map(|m| m.is_none()).unwrap_or(true)
    }
}

fn sampling_for(options: &ResolvedOptions) -> Sampling {
    if options.temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    let temperature = f64::from(options.temperature);
    let p = f64::from(options.top_p);
    match (options.top_k, p < 1.0) {
        (Some(k), true) => Sampling::TopKThenTopP {
            k: k as usize,
            p,
            temperature,
        },
        (Some(k), false) => Sampling::TopK {
            k: k as usize,
            temperature,
        },
        (None, true) => Sampling::TopP { p, temperature },
        (None, false) => Sampling::All { temperature },
    }
}

/// Autoregressive loop; returns only the newly generated token ids.
fn sample_tokens(
    loaded: &mut LoadedModel,
    prompt_tokens: &[u32],
    options: &ResolvedOptions,
) -> candle_core::Result<Vec<u32>> {
    let seed = if options.temperature > 0.0 {
        rand::random::<u64>()
    } else {
        0
    };
    let mut logits_processor = LogitsProcessor::from_sampling(seed, sampling_for(options));

    let mut all_tokens = prompt_tokens.to_vec();
    let mut generated = Vec::new();

    // Position 0 resets the KV cache.
    let input = Tensor::new(prompt_tokens, &loaded.device)?.unsqueeze(0)?;
    let mut logits = loaded.weights.forward(&input, 0)?;

    for _ in 0..options.max_tokens {
        let mut step_logits = logits.squeeze(0)?;
        if options.repetition_penalty != 1.0 {
            let start = all_tokens.len().saturating_sub(REPEAT_LAST_N);
            step_logits = candle_transformers::utils::apply_repeat_penalty(
                &step_logits,
                options.repetition_penalty,
                &all_tokens[start..],
            )?;
        }

        let next = logits_processor.sample(&step_logits)?;
        if loaded.eos_tokens.contains(&next) {
            break;
        }
        all_tokens.push(next);
        generated.push(next);

        let input = Tensor::new(&[next], &loaded.device)?.unsqueeze(0)?;
        logits = loaded.weights.forward(&input, all_tokens.len() - 1)?;
    }

    Ok(generated)
}

fn resolve_files(
    model_name: &str,
    weights: &LocalWeights,
    models_dir: &Path,
) -> Result<(PathBuf, PathBuf), String> {
    let local_dir = models_dir.join(model_name);
    let weights_path = local_dir.join("model.gguf");
    let tokenizer_path = local_dir.join("tokenizer.json");
    if weights_path.exists() && tokenizer_path.exists() {
        return Ok((weights_path, tokenizer_path));
    }

    tracing::info!(
        model = %model_name,
        repo = %weights.gguf_repo,
        "Weights not cached locally, fetching from Hugging Face hub"
    );
    let api = Api::new().map_err(|e| format!("hub init failed: {e}"))?;
    let weights_path = api
        .model(weights.gguf_repo.clone())
        .get(&weights.gguf_file)
        .map_err(|e| format!("download of {} failed: {e}", weights.gguf_file))?;
    let tokenizer_path = api
        .model(weights.tokenizer_repo.clone())
        .get("tokenizer.json")
        .map_err(|e| format!("tokenizer download failed: {e}"))?;
    Ok((weights_path, tokenizer_path))
}

fn truncate_at_stop<'a>(text: &'a str, stop: &[String]) -> &'a str {
    stop.iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
        .map_or(text, |end| &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(temperature: f32, top_p: f32, top_k: Option<u32>) -> ResolvedOptions {
        ResolvedOptions {
            temperature,
            max_tokens: 16,
            top_p,
            top_k,
            repetition_penalty: 1.0,
            stop: vec![],
        }
    }

    #[test]
    fn zero_temperature_is_greedy() {
        assert!(matches!(sampling_for(&options(0.0, 0.9, Some(40))), Sampling::ArgMax));
    }

    #[test]
    fn sampling_follows_top_k_and_top_p() {
        assert!(matches!(
            sampling_for(&options(0.7, 0.9, Some(40))),
            Sampling::TopKThenTopP { k: 40, .. }
        ));
        assert!(matches!(sampling_for(&options(0.7, 0.9, None)), Sampling::TopP { .. }));
        assert!(matches!(sampling_for(&options(0.7, 1.0, None)), Sampling::All { .. }));
    }

    #[test]
    fn truncates_at_earliest_stop() {
        let stop = vec!["<|im_end|>".to_string(), "\n\n".to_string()];
        assert_eq!(truncate_at_stop("{\"a\":1}\n\nextra<|im_end|>", &stop), "{\"a\":1}");
        assert_eq!(truncate_at_stop("plain", &stop), "plain");
    }

    #[test]
    fn missing_weights_config_is_a_load_error() {
        let config = ModelConfig::new("bare", super::super::BackendKind::InProcess, "x/y");
        let err = LocalBackend::load(config, Path::new("/nonexistent")).err().unwrap();
        assert!(matches!(err, ConfigError::ModelLoad { .. }));
    }
}
