use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{BackendError, ChatMessage, ConfigError, ModelConfig, ResolvedOptions};
use crate::pipeline::schema::{json_schema, SCHEMA_TITLE};

/// Client for an OpenAI-compatible chat-completion API.
pub struct RemoteBackend {
    config: ModelConfig,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
    client: Mutex<Option<reqwest::blocking::Client>>,
}

/// Request body for `/chat/completions`.
#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

/// Response body from `/chat/completions`.
#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub(crate) fn build_http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client, ConfigError> {
    reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}

impl RemoteBackend {
    pub fn new(
        config: ModelConfig,
        base_url: &str,
        api_key: String,
        timeout_secs: u64,
    ) -> Result<Self, ConfigError> {
        let client = build_http_client(timeout_secs)?;
        Ok(Self {
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout_secs,
            client: Mutex::new(Some(client)),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn request_body<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        options: &ResolvedOptions,
    ) -> ChatCompletionRequest<'a> {
        let response_format = self.config.json_mode_supported.then(|| {
            json!({
                "type": "json_schema",
                "json_schema": { "name": SCHEMA_TITLE, "schema": json_schema() }
            })
        });
        ChatCompletionRequest {
            model: &self.config.model_path,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            response_format,
        }
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

        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(messages, options);

        let response = client
            .post(&url)
            .bearer_auth(&self.api_key)
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

        let parsed: ChatCompletionResponse = response
            .json()
            .map_err(|e| BackendError::ResponseParsing(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::ResponseParsing("Response has no message content".into()))
    }

    pub fn shutdown(&self) {
        if let Ok(mut client) = self.client.lock() {
            if client.take().is_some() {
                tracing::debug!(model = %self.config.name, "Remote backend closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.client.lock().map(|c| c.is_none()).unwrap_or(true)
    }
}
