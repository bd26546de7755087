//! Structured-output correction.
//!
//! Reshapes a free-form final answer into JSON that satisfies a caller
//! schema. The model is asked in a conversation of its own, separate from
//! the agent loop's history, and gets a targeted correction for every
//! invalid attempt until the attempt cap is reached.

use crate::prompts;
use crate::protocol::strip_thinking;
use crate::schema::{self, SchemaViolation};
use serde_json::Value;
use sleuth_core::message::Message;
use sleuth_core::provider::{ProviderRequest, Usage};
use sleuth_providers::FallbackChain;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a correction run.
#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    /// Best candidate: validated JSON text, or the last attempt if none validated
    pub answer: String,
    pub valid: bool,
    /// Model calls made (0 when the raw answer already validated)
    pub attempts: u32,
    pub usage: Usage,
    /// A fallback provider answered at least one formatting call
    pub fallback_used: bool,
}

/// One failed attempt, kept for logging.
#[derive(Debug, Clone)]
struct CorrectionAttempt {
    number: u32,
    candidate: String,
    error: String,
}

pub struct SchemaCorrector<'a> {
    chain: &'a FallbackChain,
    max_corrections: u32,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl<'a> SchemaCorrector<'a> {
    pub fn new(chain: &'a FallbackChain, max_corrections: u32) -> Self {
        Self {
            chain,
            max_corrections: max_corrections.max(1),
            temperature: 0.0,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Turn `raw_answer` into data valid under `schema`.
    pub async fn format(
        &self,
        raw_answer: &str,
        schema: &Value,
        cancel: &CancellationToken,
    ) -> sleuth_core::Result<CorrectionOutcome> {
        if let Some(value) = extract_json(raw_answer)
            && schema::validate(&value, schema).is_ok()
        {
            debug!("Structured output: raw answer already valid");
            return Ok(CorrectionOutcome {
                answer: value.to_string(),
                valid: true,
                attempts: 0,
                usage: Usage::default(),
                fallback_used: false,
            });
        }

        let mut messages = vec![
            Message::system(prompts::formatter_system()),
            Message::user(prompts::format_request(raw_answer, schema)),
        ];
        let mut usage = Usage::default();
        let mut fallback_used = false;
        let mut history: Vec<CorrectionAttempt> = Vec::new();

        for number in 1..=self.max_corrections {
            let response = self
                .chain
                .execute(
                    |spec| ProviderRequest {
                        temperature: self.temperature,
                        max_tokens: self.max_tokens,
                        ..ProviderRequest::new(spec.model_id.clone(), messages.clone())
                    },
                    cancel,
                )
                .await?;
            if let Some(u) = &response.response.usage {
                usage.add(u);
            }
            fallback_used |= response.fallback;

            let candidate = response.response.message.text();
            let (cleaned, error) = match extract_json(&candidate) {
                None => (clean(&candidate), "reply is not valid JSON".to_string()),
                Some(value) => {
                    let echoed = looks_like_schema(&value, schema);
                    match schema::validate(&value, schema) {
                        Ok(()) if !echoed => {
                            info!(attempts = number, "Structured output: valid");
                            return Ok(CorrectionOutcome {
                                answer: value.to_string(),
                                valid: true,
                                attempts: number,
                                usage,
                                fallback_used,
                            });
                        }
                        Ok(()) => (value.to_string(), "reply repeats the schema".to_string()),
                        Err(SchemaViolation { path, message }) => {
                            let prefix = if echoed { "reply repeats the schema; " } else { "" };
                            (value.to_string(), format!("{prefix}at {path}: {message}"))
                        }
                    }
                }
            };

            debug!(attempt = number, error = %error, "Structured output: invalid candidate");
            let echoed = error.starts_with("reply repeats the schema");
            messages.push(Message::assistant(candidate));
            messages.push(Message::user(prompts::correction(&error, echoed)));
            history.push(CorrectionAttempt {
                number,
                candidate: cleaned,
                error,
            });
        }

        let last = history.last().map(|a| a.candidate.clone()).unwrap_or_default();
        for attempt in &history {
            warn!(attempt = attempt.number, error = %attempt.error, "Structured output: attempt rejected");
        }
        Ok(CorrectionOutcome {
            answer: last,
            valid: false,
            attempts: self.max_corrections,
            usage,
            fallback_used,
        })
    }
}

/// Strip thinking blocks and markdown fences.
fn clean(text: &str) -> String {
    let text = strip_thinking(text);
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (```json) and the closing fence
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim().to_string()
}

/// Parse JSON out of a reply: the whole cleaned text, or the outermost
/// object/array inside it.
pub fn extract_json(text: &str) -> Option<Value> {
    let cleaned = clean(text);
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned)
        && (value.is_object() || value.is_array())
    {
        return Some(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (cleaned.find(open), cleaned.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str::<Value>(&cleaned[start..=end])
        {
            return Some(value);
        }
    }

    serde_json::from_str(&cleaned).ok()
}

/// Whether the model echoed a schema definition instead of producing data.
fn looks_like_schema(candidate: &Value, schema: &Value) -> bool {
    if candidate == schema {
        return true;
    }
    let Some(map) = candidate.as_object() else {
        return false;
    };
    let declares = |key: &str| {
        schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|p| p.contains_key(key))
    };
    if map.contains_key("$schema") && !declares("$schema") {
        return true;
    }
    map.get("type").is_some_and(Value::is_string)
        && map.get("properties").is_some_and(Value::is_object)
        && !declares("properties")
}
