//! Static registry of named models and their generation defaults.

use std::fmt;
use std::sync::LazyLock;

use serde::Serialize;

use super::ConfigError;
use crate::pipeline::prompt_templates::formatter_for;

/// Which concrete backend serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// OpenAI-compatible chat-completion API.
    Remote,
    /// GGUF weights loaded into this process.
    InProcess,
    /// OpenAI-compatible text-completion server (e.g. vLLM).
    Server,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::InProcess => "in_process",
            Self::Server => "server",
        }
    }

    /// Cargo feature that must be compiled in for this kind, if any.
    pub fn required_feature(&self) -> Option<&'static str> {
        match self {
            Self::InProcess => Some("local-inference"),
            Self::Remote | Self::Server => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transformer family of a GGUF checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Llama-family layout (Llama, Mistral, Mixtral and their fine-tunes).
    Llama,
    Qwen2,
}

/// Where the in-process backend finds weights when they are not cached locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalWeights {
    pub gguf_repo: String,
    pub gguf_file: String,
    pub tokenizer_repo: String,
    pub architecture: Architecture,
}

/// Registry entry describing one named model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub backend: BackendKind,
    /// Hugging Face id, API model id or server model name.
    pub model_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_weights: Option<LocalWeights>,

    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    /// `None` disables top-k filtering.
    pub top_k: Option<u32>,
    pub repetition_penalty: f32,
    pub stop_tokens: Vec<String>,

    /// Turn templates of the model's prompt family, `{content}` marking the text.
    /// Taken from the family formatter so that listings show what is sent.
    pub system_prompt_template: String,
    pub user_prompt_template: String,
    pub assistant_prompt_template: String,
    /// False when the model has no system role and system text must ride in the first user turn.
    pub requires_system_prompt: bool,
    /// Remote API accepts `response_format` with a JSON schema.
    pub json_mode_supported: bool,
    pub context_window: u32,
}

impl ModelConfig {
    /// A config with the shared generation defaults.
    pub fn new(name: &str, backend: BackendKind, model_path: &str) -> Self {
        let turns = formatter_for(name).templates();
        Self {
            name: name.to_string(),
            backend,
            model_path: model_path.to_string(),
            local_weights: None,
            max_tokens: 1200,
            temperature: 0.0,
            top_p: 1.0,
            top_k: None,
            repetition_penalty: 1.0,
            stop_tokens: Vec::new(),
            system_prompt_template: turns.system.to_string(),
            user_prompt_template: turns.user.to_string(),
            assistant_prompt_template: turns.assistant.to_string(),
            requires_system_prompt: true,
            json_mode_supported: false,
            context_window: 8192,
        }
    }

    fn mistral_family(
        name: &str,
        model_path: &str,
        weights: LocalWeights,
        context_window: u32,
    ) -> Self {
        Self {
            local_weights: Some(weights),
            stop_tokens: vec!["</s>".into()],
            requires_system_prompt: false,
            context_window,
            ..Self::new(name, BackendKind::InProcess, model_path)
        }
    }

    fn qwen_family(name: &str, model_path: &str, weights: LocalWeights) -> Self {
        Self {
            local_weights: Some(weights),
            stop_tokens: vec!["<|im_end|>".into()],
            context_window: 32768,
            ..Self::new(name, BackendKind::InProcess, model_path)
        }
    }

    fn openai(name: &str, context_window: u32) -> Self {
        Self {
            json_mode_supported: true,
            context_window,
            ..Self::new(name, BackendKind::Remote, name)
        }
    }
}

fn gguf(repo: &str, file: &str, tokenizer_repo: &str, architecture: Architecture) -> LocalWeights {
    LocalWeights {
        gguf_repo: repo.into(),
        gguf_file: file.into(),
        tokenizer_repo: tokenizer_repo.into(),
        architecture,
    }
}

static BUILTIN_MODELS: LazyLock<Vec<ModelConfig>> = LazyLock::new(|| {
    vec![
        // General-purpose
        ModelConfig::mistral_family(
            "mistral-7b-instruct",
            "mistralai/Mistral-7B-Instruct-v0.2",
            gguf(
                "TheBloke/Mistral-7B-Instruct-v0.2-GGUF",
                "mistral-7b-instruct-v0.2.Q4_K_M.gguf",
                "mistralai/Mistral-7B-Instruct-v0.2",
                Architecture::Llama,
            ),
            8192,
        ),
        ModelConfig::mistral_family(
            "mixtral-8x7b-instruct",
            "mistralai/Mixtral-8x7B-Instruct-v0.1",
            gguf(
                "TheBloke/Mixtral-8x7B-Instruct-v0.1-GGUF",
                "mixtral-8x7b-instruct-v0.1.Q4_K_M.gguf",
                "mistralai/Mixtral-8x7B-Instruct-v0.1",
                Architecture::Llama,
            ),
            32768,
        ),
        ModelConfig::qwen_family(
            "qwen2.5-7b-instruct",
            "Qwen/Qwen2.5-7B-Instruct",
            gguf(
                "Qwen/Qwen2.5-7B-Instruct-GGUF",
                "qwen2.5-7b-instruct-q4_k_m.gguf",
                "Qwen/Qwen2.5-7B-Instruct",
                Architecture::Qwen2,
            ),
        ),
        ModelConfig::qwen_family(
            "qwen2.5-14b-instruct",
            "Qwen/Qwen2.5-14B-Instruct",
            gguf(
                "Qwen/Qwen2.5-14B-Instruct-GGUF",
                "qwen2.5-14b-instruct-q4_k_m.gguf",
                "Qwen/Qwen2.5-14B-Instruct",
                Architecture::Qwen2,
            ),
        ),
        // Biomedical
        ModelConfig::mistral_family(
            "biomistral-7b",
            "BioMistral/BioMistral-7B",
            gguf(
                "MaziyarPanahi/BioMistral-7B-GGUF",
                "BioMistral-7B.Q4_K_M.gguf",
                "BioMistral/BioMistral-7B",
                Architecture::Llama,
            ),
            8192,
        ),
        ModelConfig::mistral_family(
            "meditron-7b",
            "epfl-llm/meditron-7b",
            gguf(
                "TheBloke/meditron-7B-GGUF",
                "meditron-7b.Q4_K_M.gguf",
                "epfl-llm/meditron-7b",
                Architecture::Llama,
            ),
            8192,
        ),
        // Served by an OpenAI-compatible completion server
        ModelConfig {
            stop_tokens: vec!["</s>".into()],
            context_window: 4096,
            ..ModelConfig::new(
                "llama-2-13b-chat",
                BackendKind::Server,
                "meta-llama/Llama-2-13b-chat-hf",
            )
        },
        // Remote API
        ModelConfig::openai("gpt-4o-mini", 128_000),
        ModelConfig::openai("gpt-4o", 128_000),
    ]
});

/// All built-in model configurations.
pub fn builtin_models() -> &'static [ModelConfig] {
    &BUILTIN_MODELS
}

/// Find a model by exact name within `models`.
pub fn find_model<'a>(models: &'a [ModelConfig], name: &str) -> Result<&'a ModelConfig, ConfigError> {
    models
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| ConfigError::UnknownModel {
            name: name.to_string(),
            available: models.iter().map(|m| m.name.clone()).collect(),
        })
}
