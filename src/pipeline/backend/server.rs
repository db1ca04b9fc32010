use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::remote::build_http_client;
use super::{BackendError, ChatMessage, ConfigError, ModelConfig, ResolvedOptions};
use crate::pipeline::prompt_templates::{formatter_for, PromptFormatter};

/// Sampling parameters understood by OpenAI-compatible completion servers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    pub max_tokens: u32,
    pub repetition_penalty: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl From<&ResolvedOptions> for SamplingParams {
    fn from(options: &ResolvedOptions) -> Self {
        Self {
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            max_tokens: options.max_tokens,
            repetition_penalty: options.repetition_penalty,
            stop: options.stop.clone(),
        }
    }
}

/// Request body for `/completions`.
#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(flatten)]
    sampling: SamplingParams,
}

/// Response body from `/completions`.
#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    text: String,
}

/// Client for a text-completion inference server. Messages are rendered into
/// one prompt with the model family's template before sending.
pub struct ServerBackend {
    config: ModelConfig,
    formatter: PromptFormatter,
    base_url: String,
    timeout_secs: u64,
    client: Mutex<Option<reqwest::blocking::Client>>,
}

impl ServerBackend {
    pub fn new(config: ModelConfig, base_url: &str, timeout_secs: u64) -> Result<Self, ConfigError> {
        let client = build_http_client(timeout_secs)?;
        Ok(Self {
            formatter: formatter_for(&config.name),
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            client: Mutex::new(Some(client)),
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
        let client = self
            .client
            .lock()
            .map_err(|_| BackendError::HttpClient("Client lock poisoned".into()))?
            .clone()
            .ok_or(BackendError::Closed)?;

        let prompt = self.formatter.format(messages);
        let url = format!("{}/completions", self.base_url);
        let body = CompletionRequest {
            model: &self.config.model_path,
            prompt: &prompt,
            sampling: SamplingParams::from(options),
        };

        let response = client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| BackendError::from_reqwest(e, &self.base_url, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .map_err(|e| BackendError::ResponseParsing(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.text.trim().to_string())
            .ok_or_else(|| BackendError::ResponseParsing("Response has no choices".into()))
    }

    pub fn shutdown(&self) {
        if let Ok(mut client) = self.client.lock() {
            if client.take().is_some() {
                tracing::debug!(model = %self.config.name, "Server backend closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.client.lock().map(|c| c.is_none()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::backend::{builtin_models, find_model, GenerationOptions};

    fn llama() -> ServerBackend {
        let config = find_model(builtin_models(), "llama-2-13b-chat").unwrap().clone();
        ServerBackend::new(config, "http://localhost:8000/v1/", 5).unwrap()
    }

    #[test]
    fn uses_family_formatter() {
        let server = llama();
        assert_eq!(server.formatter, PromptFormatter::Llama);
        assert_eq!(server.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn request_flattens_sampling_params() {
        let server = llama();
        let options = GenerationOptions {
            temperature: Some(0.2),
            ..Default::default()
        }
        .resolve(server.config());
        let body = serde_json::to_value(CompletionRequest {
            model: &server.config.model_path,
            prompt: "p",
            sampling: SamplingParams::from(&options),
        })
        .unwrap();

        assert_eq!(body["model"], "meta-llama/Llama-2-13b-chat-hf");
        assert_eq!(body["prompt"], "p");
        assert_eq!(body["max_tokens"], 1200);
        assert_eq!(body["repetition_penalty"], 1.0);
        assert_eq!(body["stop"], serde_json::json!(["</s>"]));
        assert!(body.get("top_k").is_none());
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn closed_server_rejects_generation() {
        let server = llama();
        server.shutdown();
        let options = GenerationOptions::default().resolve(server.config());
        assert!(matches!(
            server.generate(&[ChatMessage::user("x")], &options),
            Err(BackendError::Closed)
        ));
    }
}
