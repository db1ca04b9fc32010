//! Prompt Template Registry: per-family serialization of role-tagged messages.
//!
//! Remote chat APIs take the message list as-is. In-process and server
//! backends need one literal prompt string in the layout the model was
//! instruction-tuned on; `formatter_for` picks that layout by model name.

use std::fmt;

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged chat turn. Serializes to the OpenAI wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Formatters
// ═══════════════════════════════════════════════════════════

/// Prompt layout of a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptFormatter {
    /// `<s>[INST] ... [/INST]` instruction brackets.
    Mistral,
    /// ChatML with `<|im_start|>`/`<|im_end|>` markers.
    Qwen,
    /// Llama-2 chat: `<<SYS>>` block inside the first `[INST]`.
    Llama,
    /// ChatML, used for OpenAI-compatible and unknown models.
    Generic,
}

/// Model name → formatter. Names not listed here use `Generic`.
const MODEL_FORMATTERS: &[(&str, PromptFormatter)] = &[
    ("mistral-7b-instruct", PromptFormatter::Mistral),
    ("mixtral-8x7b-instruct", PromptFormatter::Mistral),
    ("biomistral-7b", PromptFormatter::Mistral),
    ("meditron-7b", PromptFormatter::Mistral),
    ("qwen2.5-7b-instruct", PromptFormatter::Qwen),
    ("qwen2.5-14b-instruct", PromptFormatter::Qwen),
    ("llama-2-13b-chat", PromptFormatter::Llama),
    ("gpt-4o-mini", PromptFormatter::Generic),
    ("gpt-4o", PromptFormatter::Generic),
];

/// Look up the formatter for a model, falling back to `Generic`.
pub fn formatter_for(model_name: &str) -> PromptFormatter {
    MODEL_FORMATTERS
        .iter()
        .find(|(name, _)| *name == model_name)
        .map(|(_, formatter)| *formatter)
        .unwrap_or(PromptFormatter::Generic)
}

/// Per-role turn templates of one prompt layout. `{content}` marks the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTemplates {
    /// Emitted once before the first turn.
    pub prefix: &'static str,
    pub system: &'static str,
    pub user: &'static str,
    pub assistant: &'static str,
    /// Opens a user turn that does not directly follow a system turn.
    pub user_open: &'static str,
    /// Emitted once after the last turn.
    pub suffix: &'static str,
}

const CONTENT: &str = "{content}";

const MISTRAL_TURNS: TurnTemplates = TurnTemplates {
    prefix: "<s>",
    system: "[INST] {content} [/INST]",
    user: "[INST] {content} [/INST]",
    assistant: " {content}",
    user_open: "",
    suffix: "",
};

const CHATML_TURNS: TurnTemplates = TurnTemplates {
    prefix: "",
    system: "<|im_start|>system\n{content}<|im_end|>\n",
    user: "<|im_start|>user\n{content}<|im_end|>\n",
    assistant: "<|im_start|>assistant\n{content}<|im_end|>\n",
    user_open: "",
    suffix: "<|im_start|>assistant\n",
};

// The system block opens the first `[INST]`; later user turns open their own.
const LLAMA_TURNS: TurnTemplates = TurnTemplates {
    prefix: "",
    system: "<s>[INST] <<SYS>>\n{content}\n<</SYS>>\n\n",
    user: "{content} [/INST]",
    assistant: " {content} </s>",
    user_open: "<s>[INST] ",
    suffix: "",
};

impl PromptFormatter {
    /// Serialize messages into one prompt string. Every message is emitted, in order.
    pub fn format(&self, messages: &[ChatMessage]) -> String {
        let turns = self.templates();
        let mut prompt = String::from(turns.prefix);
        let mut after_system = false;
        for msg in messages {
            let template = match msg.role {
                Role::System => turns.system,
                Role::User => {
                    if !after_system {
                        prompt.push_str(turns.user_open);
                    }
                    turns.user
                }
                Role::Assistant => turns.assistant,
            };
            prompt.push_str(&template.replace(CONTENT, &msg.content));
            after_system = msg.role == Role::System;
        }
        prompt.push_str(turns.suffix);
        prompt
    }

    pub fn templates(&self) -> &'static TurnTemplates {
        match self {
            Self::Mistral => &MISTRAL_TURNS,
            Self::Qwen | Self::Generic => &CHATML_TURNS,
            Self::Llama => &LLAMA_TURNS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mistral => "mistral",
            Self::Qwen => "qwen",
            Self::Llama => "llama",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for PromptFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("SYS"),
            ChatMessage::user("U1"),
            ChatMessage::assistant("A1"),
            ChatMessage::user("U2"),
        ]
    }

    #[test]
    fn known_models_map_to_families() {
        assert_eq!(formatter_for("mistral-7b-instruct"), PromptFormatter::Mistral);
        assert_eq!(formatter_for("meditron-7b"), PromptFormatter::Mistral);
        assert_eq!(formatter_for("qwen2.5-14b-instruct"), PromptFormatter::Qwen);
        assert_eq!(formatter_for("llama-2-13b-chat"), PromptFormatter::Llama);
        assert_eq!(formatter_for("gpt-4o"), PromptFormatter::Generic);
    }

    #[test]
    fn unknown_model_falls_back_to_generic() {
        assert_eq!(formatter_for("some-new-model"), PromptFormatter::Generic);
        assert_eq!(formatter_for(""), PromptFormatter::Generic);
    }

    #[test]
    fn mistral_layout() {
        let prompt = PromptFormatter::Mistral.format(&conversation());
        assert_eq!(prompt, "<s>[INST] SYS [/INST][INST] U1 [/INST] A1[INST] U2 [/INST]");
    }

    #[test]
    fn chatml_layout_ends_with_assistant_header() {
        let prompt = PromptFormatter::Qwen.format(&conversation());
        assert_eq!(
            prompt,
            "<|im_start|>system\nSYS<|im_end|>\n\
             <|im_start|>user\nU1<|im_end|>\n\
             <|im_start|>assistant\nA1<|im_end|>\n\
             <|im_start|>user\nU2<|im_end|>\n\
             <|im_start|>assistant\n"
        );
        assert_eq!(prompt, PromptFormatter::Generic.format(&conversation()));
    }

    #[test]
    fn llama_layout_wraps_system_in_first_inst() {
        let prompt = PromptFormatter::Llama.format(&conversation());
        assert_eq!(
            prompt,
            "<s>[INST] <<SYS>>\nSYS\n<</SYS>>\n\nU1 [/INST] A1 </s><s>[INST] U2 [/INST]"
        );
    }

    #[test]
    fn llama_without_system_opens_inst() {
        let prompt = PromptFormatter::Llama.format(&[ChatMessage::user("hi")]);
        assert_eq!(prompt, "<s>[INST] hi [/INST]");
    }

    #[test]
    fn formatting_is_pure_and_keeps_every_message() {
        let messages = conversation();
        for formatter in [
            PromptFormatter::Mistral,
            PromptFormatter::Qwen,
            PromptFormatter::Llama,
            PromptFormatter::Generic,
        ] {
            let first = formatter.format(&messages);
            assert_eq!(first, formatter.format(&messages));
            let mut last = 0;
            for msg in &messages {
                let pos = first[last..].find(&msg.content).map(|p| p + last);
                assert!(pos.is_some(), "{formatter} dropped {:?}", msg.content);
                last = pos.unwrap_or(last);
            }
        }
    }

    #[test]
    fn message_serializes_to_wire_shape() {
        let value = serde_json::to_value(ChatMessage::user("hello")).unwrap();
        assert_eq!(value, serde_json::json!({"role": "user", "content": "hello"}));
    }
}
