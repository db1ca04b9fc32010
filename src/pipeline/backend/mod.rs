//! Model Backend Abstraction: one `generate(messages, options) -> text`
//! capability over remote APIs, completion servers and in-process weights.

pub mod model_config;
pub mod registry;
pub mod remote;
pub mod server;

#[cfg(feature = "local-inference")]
pub mod local;

pub use model_config::*;
pub use registry::*;
pub use remote::*;
pub use server::*;

#[cfg(feature = "local-inference")]
pub use local::LocalBackend;

use std::path::PathBuf;

use thiserror::Error;

use crate::config;
pub use crate::pipeline::prompt_templates::{ChatMessage, Role};

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

/// Problems detected before any generation happens.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown model: {name}. Available models: {}", .available.join(", "))]
    UnknownModel { name: String, available: Vec<String> },

    #[error("Model {model} uses the {backend} backend, which requires building with `--features {feature}`")]
    BackendUnavailable {
        model: String,
        backend: BackendKind,
        feature: &'static str,
    },

    #[error("Model {model} requires the {var} environment variable")]
    MissingCredential { model: String, var: &'static str },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },
}

/// Failures of a single generation call.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend is not reachable at {0}")]
    Connection(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Backend returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Prompt of {prompt_tokens} tokens plus {max_tokens} new tokens exceeds the {context_window}-token context window")]
    PromptTooLong {
        prompt_tokens: usize,
        max_tokens: u32,
        context_window: u32,
    },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Backend has been shut down")]
    Closed,
}

impl BackendError {
    /// Worth another generation attempt. A closed backend or an oversized prompt never recovers.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed | Self::PromptTooLong { .. })
    }

    pub(crate) fn from_reqwest(e: reqwest::Error, base_url: &str, timeout_secs: u64) -> Self {
        if e.is_connect() {
            Self::Connection(base_url.to_string())
        } else if e.is_timeout() {
            Self::Timeout(timeout_secs)
        } else {
            Self::HttpClient(e.to_string())
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Generation options
// ═══════════════════════════════════════════════════════════

/// Per-call overrides. Unset fields fall back to the model's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl GenerationOptions {
    pub fn resolve(&self, config: &ModelConfig) -> ResolvedOptions {
        ResolvedOptions {
            temperature: self.temperature.unwrap_or(config.temperature),
            max_tokens: self.max_tokens.unwrap_or(config.max_tokens),
            top_p: self.top_p.unwrap_or(config.top_p),
            top_k: config.top_k,
            repetition_penalty: config.repetition_penalty,
            stop: config.stop_tokens.clone(),
        }
    }
}

/// Fully specified sampling parameters for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub top_k: Option<u32>,
    pub repetition_penalty: f32,
    pub stop: Vec<String>,
}

// ═══════════════════════════════════════════════════════════
// Capability
// ═══════════════════════════════════════════════════════════

/// Text generation from role-tagged messages (allows mocking).
pub trait TextGenerator: Send + Sync {
    /// Registry name of the model, recorded as provenance.
    fn model_name(&self) -> &str;

    /// Whether the model honors a separate system role.
    fn honors_system_role(&self) -> bool {
        true
    }

    fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String, BackendError>;
}

/// Environment-derived settings shared by every backend a registry creates.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub api_key: Option<String>,
    pub api_base: String,
    pub server_url: String,
    pub timeout_secs: u64,
    pub models_dir: PathBuf,
}

impl BackendSettings {
    pub fn from_env() -> Self {
        Self {
            api_key: config::env_non_empty(config::API_KEY_ENV),
            api_base: config::env_non_empty(config::API_BASE_ENV)
                .unwrap_or_else(|| config::DEFAULT_API_BASE.to_string()),
            server_url: config::env_non_empty(config::SERVER_URL_ENV)
                .unwrap_or_else(|| config::DEFAULT_SERVER_URL.to_string()),
            timeout_secs: config::DEFAULT_REQUEST_TIMEOUT_SECS,
            models_dir: config::models_dir(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Backend
// ═══════════════════════════════════════════════════════════

/// The closed set of concrete backends.
pub enum Backend {
    Remote(RemoteBackend),
    Server(ServerBackend),
    #[cfg(feature = "local-inference")]
    InProcess(LocalBackend),
}

impl Backend {
    /// Build the backend a model config names. Fails before any generation
    /// when the backend is not compiled in or lacks credentials.
    pub fn create(config: &ModelConfig, settings: &BackendSettings) -> Result<Self, ConfigError> {
        tracing::info!(model = %config.name, backend = %config.backend, "Creating backend");
        match config.backend {
            BackendKind::Remote => {
                let api_key =
                    settings
                        .api_key
                        .clone()
                        .ok_or_else(|| ConfigError::MissingCredential {
                            model: config.name.clone(),
                            var: config::API_KEY_ENV,
                        })?;
                RemoteBackend::new(
                    config.clone(),
                    &settings.api_base,
                    api_key,
                    settings.timeout_secs,
                )
                .map(Self::Remote)
            }
            BackendKind::Server => {
                ServerBackend::new(config.clone(), &settings.server_url, settings.timeout_secs)
                    .map(Self::Server)
            }
            BackendKind::InProcess => Self::create_in_process(config, settings),
        }
    }

    #[cfg(feature = "local-inference")]
    fn create_in_process(config: &ModelConfig, settings: &BackendSettings) -> Result<Self, ConfigError> {
        LocalBackend::load(config.clone(), &settings.models_dir).map(Self::InProcess)
    }

    #[cfg(not(feature = "local-inference"))]
    fn create_in_process(config: &ModelConfig, _settings: &BackendSettings) -> Result<Self, ConfigError> {
        Err(ConfigError::BackendUnavailable {
            model: config.name.clone(),
            backend: config.backend,
            feature: config.backend.required_feature().unwrap_or("local-inference"),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        match self {
            Self::Remote(b) => b.config(),
            Self::Server(b) => b.config(),
            #[cfg(feature = "local-inference")]
            Self::InProcess(b) => b.config(),
        }
    }

    /// Release connections or weights. Idempotent.
    pub fn shutdown(&self) {
        match self {
            Self::Remote(b) => b.shutdown(),
            Self::Server(b) => b.shutdown(),
            #[cfg(feature = "local-inference")]
            Self::InProcess(b) => b.shutdown(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Remote(b) => b.is_closed(),
            Self::Server(b) => b.is_closed(),
            #[cfg(feature = "local-inference")]
            Self::InProcess(b) => b.is_closed(),
        }
    }
}

impl TextGenerator for Backend {
    fn model_name(&self) -> &str {
        &self.config().name
    }

    fn honors_system_role(&self) -> bool {
        self.config().requires_system_prompt
    }

    fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String, BackendError> {
        let resolved = options.resolve(self.config());
        match self {
            Self::Remote(b) => b.generate(messages, &resolved),
            Self::Server(b) => b.generate(messages, &resolved),
            #[cfg(feature = "local-inference")]
            Self::InProcess(b) => b.generate(messages, &resolved),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_settings() -> BackendSettings {
        BackendSettings {
            api_key: Some("sk-test".into()),
            api_base: "http://127.0.0.1:9/v1".into(),
            server_url: "http://127.0.0.1:9/v1".into(),
            timeout_secs: 5,
            models_dir: std::env::temp_dir().join("radextract-test-models"),
        }
    }

    fn model(name: &str) -> &'static ModelConfig {
        find_model(builtin_models(), name).unwrap()
    }

    #[test]
    fn overrides_win_over_model_defaults() {
        let config = model("gpt-4o-mini");
        let options = GenerationOptions {
            temperature: Some(0.7),
            max_tokens: None,
            top_p: Some(0.9),
        };
        let resolved = options.resolve(config);
        assert_eq!(resolved.temperature, 0.7);
        assert_eq!(resolved.max_tokens, config.max_tokens);
        assert_eq!(resolved.top_p, 0.9);
    }

    #[test]
    fn defaults_come_from_model_config() {
        let config = model("qwen2.5-7b-instruct");
        let resolved = GenerationOptions::default().resolve(config);
        assert_eq!(resolved.temperature, 0.0);
        assert_eq!(resolved.max_tokens, 1200);
        assert_eq!(resolved.stop, vec!["<|im_end|>".to_string()]);
    }

    #[test]
    fn remote_without_api_key_fails_at_creation() {
        let settings = BackendSettings {
            api_key: None,
            ..test_settings()
        };
        let err = Backend::create(model("gpt-4o"), &settings).err().unwrap();
        match err {
            ConfigError::MissingCredential { model, var } => {
                assert_eq!(model, "gpt-4o");
                assert_eq!(var, "OPENAI_API_KEY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(not(feature = "local-inference"))]
    #[test]
    fn in_process_without_feature_names_the_feature() {
        let err = Backend::create(model("mistral-7b-instruct"), &test_settings())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConfigError::BackendUnavailable { feature: "local-inference", .. }
        ));
        assert!(err.to_string().contains("--features local-inference"));
    }

    #[test]
    fn remote_backend_reports_model_and_system_role() {
        let backend = Backend::create(model("gpt-4o-mini"), &test_settings()).unwrap();
        assert_eq!(backend.model_name(), "gpt-4o-mini");
        assert!(backend.honors_system_role());
        assert!(!backend.is_closed());
    }

    #[test]
    fn generate_after_shutdown_is_closed() {
        let backend = Backend::create(model("llama-2-13b-chat"), &test_settings()).unwrap();
        backend.shutdown();
        backend.shutdown();
        assert!(backend.is_closed());
        let err = backend
            .generate(&[ChatMessage::user("hi")], &GenerationOptions::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::Closed));
        assert!(!err.is_retryable());
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert!(BackendError::Connection("x".into()).is_retryable());
        assert!(BackendError::Api { status: 500, body: String::new() }.is_retryable());
        assert!(!BackendError::PromptTooLong {
            prompt_tokens: 9000,
            max_tokens: 1200,
            context_window: 8192
        }
        .is_retryable());
    }
}
