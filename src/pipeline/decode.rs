//! Constrained Decoder: generate → parse → repair → validate, under a retry policy.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::models::ReportExtraction;
use crate::pipeline::backend::{BackendError, GenerationOptions, TextGenerator};
use crate::pipeline::prompt_templates::{ChatMessage, Role};
use crate::pipeline::schema::{validate_extraction, SchemaError};

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

/// Why a single attempt failed.
#[derive(Error, Debug)]
pub enum AttemptFailure {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("JSON parsing error after repair: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Schema validation failed: {0}")]
    Schema(#[from] SchemaError),
}

impl AttemptFailure {
    /// Parse and schema failures always merit a fresh generation.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            Self::JsonParsing(_) | Self::Schema(_) => true,
        }
    }
}

/// Extraction of one report failed for good.
#[derive(Error, Debug)]
#[error("Extraction failed after {attempts} attempt(s): {reason}")]
pub struct DecodeError {
    pub attempts: u32,
    /// Raw text of the last generation, if any was produced.
    pub last_raw: Option<String>,
    #[source]
    pub reason: AttemptFailure,
}

// ═══════════════════════════════════════════════════════════
// Retry policy
// ═══════════════════════════════════════════════════════════

/// Bounded attempts with a fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Repair
// ═══════════════════════════════════════════════════════════

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"));

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*\n?(.*?)```").expect("static regex"));

/// One deterministic repair pass over near-miss JSON.
///
/// Strips thinking blocks and markdown fences, narrows to the outermost
/// braces, then rewrites single/curly quotes, Python literals and trailing
/// commas. Text inside double-quoted strings is left alone.
pub fn repair_json(text: &str) -> String {
    let without_think = THINK_BLOCK.replace_all(text, "");
    let unfenced = match CODE_FENCE.captures(&without_think) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()).to_string(),
        None => without_think.into_owned(),
    };

    let trimmed = unfenced.trim();
    let fragment = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };

    let normalized = fragment
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    rewrite_tokens(&normalized)
}

#[derive(Clone, Copy, PartialEq)]
enum Quote {
    None,
    Double,
    Single,
}

/// Character scanner for the quote, literal and trailing-comma rewrites.
fn rewrite_tokens(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut quote = Quote::None;
    let mut i = 0;

    let next_significant = |from: usize| chars[from..].iter().copied().find(|c| !c.is_whitespace());

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Quote::Double => {
                out.push(c);
                if c == '\\' {
                    if let Some(&escaped) = chars.get(i + 1) {
                        out.push(escaped);
                        i += 1;
                    }
                } else if c == '"' {
                    quote = Quote::None;
                }
            }
            Quote::Single => match c {
                '\\' => {
                    if let Some(&escaped) = chars.get(i + 1) {
                        if escaped != '\'' {
                            out.push('\\');
                        }
                        out.push(escaped);
                        i += 1;
                    }
                }
                '"' => out.push_str("\\\""),
                '\'' => {
                    // A quote followed by a structural character closes the string;
                    // anything else is an apostrophe inside it.
                    match next_significant(i + 1) {
                        None | Some(',' | ':' | '}' | ']') => {
                            out.push('"');
                            quote = Quote::None;
                        }
                        Some(_) => out.push('\''),
                    }
                }
                _ => out.push(c),
            },
            Quote::None => match c {
                '"' => {
                    out.push(c);
                    quote = Quote::Double;
                }
                '\'' => {
                    out.push('"');
                    quote = Quote::Single;
                }
                ',' if matches!(next_significant(i + 1), Some('}' | ']')) => {}
                c if c.is_ascii_alphabetic() => {
                    let start = i;
                    while i + 1 < chars.len() && chars[i + 1].is_ascii_alphanumeric() {
                        i += 1;
                    }
                    let word: String = chars[start..=i].iter().collect();
                    out.push_str(match word.as_str() {
                        "True" => "true",
                        "False" => "false",
                        "None" => "null",
                        other => other,
                    });
                }
                _ => out.push(c),
            },
        }
        i += 1;
    }
    out
}

/// Strict parse, then at most one repaired re-parse, then schema validation.
pub fn parse_extraction(raw: &str) -> Result<ReportExtraction, AttemptFailure> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => serde_json::from_str(&repair_json(raw))?,
    };
    Ok(validate_extraction(value)?)
}

// ═══════════════════════════════════════════════════════════
// Decoder
// ═══════════════════════════════════════════════════════════

/// Fold system turns into the first user turn for models without a system role.
pub fn merge_system_into_user(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    if system.is_empty() {
        return messages.to_vec();
    }
    let system = system.join("\n\n");

    let mut merged = Vec::with_capacity(messages.len());
    let mut pending = Some(system);
    for msg in messages.iter().filter(|m| m.role != Role::System) {
        match (msg.role, pending.take()) {
            (Role::User, Some(system)) => {
                merged.push(ChatMessage::user(format!("{system}\n\n{}", msg.content)));
            }
            (_, carried) => {
                pending = carried;
                merged.push(msg.clone());
            }
        }
    }
    if let Some(system) = pending {
        merged.insert(0, ChatMessage::user(system));
    }
    merged
}

/// Drives a generator until it yields a schema-valid extraction.
pub struct ConstrainedDecoder<'a, G: TextGenerator + ?Sized> {
    generator: &'a G,
    policy: RetryPolicy,
}

impl<'a, G: TextGenerator + ?Sized> ConstrainedDecoder<'a, G> {
    pub fn new(generator: &'a G, policy: RetryPolicy) -> Self {
        Self { generator, policy }
    }

    pub fn decode(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<ReportExtraction, DecodeError> {
        let prepared;
        let messages = if self.generator.honors_system_role() {
            messages
        } else {
            prepared = merge_system_into_user(messages);
            &prepared[..]
        };

        let model = self.generator.model_name();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_raw: Option<String> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let failure = match self.generator.generate(messages, options) {
                Ok(raw) => {
                    let result = parse_extraction(&raw);
                    last_raw = Some(raw);
                    match result {
                        Ok(extraction) => {
                            tracing::debug!(model, attempt, "Extraction decoded");
                            return Ok(extraction);
                        }
                        Err(failure) => failure,
                    }
                }
                Err(e) => AttemptFailure::Backend(e),
            };

            if !failure.is_retryable() || attempt >= max_attempts {
                return Err(DecodeError {
                    attempts: attempt,
                    last_raw,
                    reason: failure,
                });
            }

            tracing::warn!(model, attempt, error = %failure, "Decode attempt failed, retrying");
            if !self.policy.delay.is_zero() {
                std::thread::sleep(self.policy.delay);
            }
        }
    }
}
