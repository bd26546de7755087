//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and get text back,
//! as a stream of deltas followed by final usage statistics. The agent loop
//! only depends on this streaming contract; it buffers the whole completion
//! before parsing because the tool-call protocol is not incremental.
//!
//! [`ProviderSpec`]s form the ordered fallback chain handed to the
//! resilience layer.

use crate::error::ProviderError;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.3
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: None,
            stop: Vec::new(),
        }
    }
}

/// A complete (buffered) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated assistant message
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    /// Provider-specific metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Retry policy for one provider in the fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (so `max_retries + 1` attempts total)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied per retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// One entry of the fallback chain: which provider, which model, how to retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub provider_id: String,
    pub model_id: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ProviderSpec {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// The core Provider trait.
///
/// Every LLM backend implements this trait. The resilience layer calls
/// `stream()` and buffers the deltas without knowing which backend is used.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "ollama").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>, ProviderError>
    {
        let response = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.message.text()),
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

/// Drain a chunk stream into one buffered assistant response.
///
/// A stream that ends without a `done` chunk is accepted as long as it
/// produced text; an error chunk aborts the whole completion.
pub async fn collect_stream(
    model: &str,
    mut rx: mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
) -> std::result::Result<ProviderResponse, ProviderError> {
    let mut text = String::new();
    let mut usage = None;
    let mut finished = false;

    while let Some(chunk) = rx.recv().await {
        let chunk = chunk?;
        if let Some(delta) = chunk.content {
            text.push_str(&delta);
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
        if chunk.done {
            finished = true;
            break;
        }
    }

    if !finished && text.is_empty() {
        return Err(ProviderError::StreamInterrupted(
            "stream closed before any content was received".into(),
        ));
    }

    Ok(ProviderResponse {
        message: Message::assistant(text),
        usage,
        model: model.to_string(),
        metadata: serde_json::Map::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_request_defaults() {
        let req = ProviderRequest::new("gpt-4o", vec![]);
        assert!((req.temperature - 0.3).abs() < f32::EPSILON);
        assert!(req.max_tokens.is_none());
    }

    #[test]
    fn retry_config_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.initial_delay_ms, 1_000);
        assert_eq!(retry.max_delay_ms, 30_000);
        assert_eq!(RetryConfig::no_retry().max_retries, 0);
    }

    #[test]
    fn provider_spec_from_toml_uses_default_retry() {
        let spec: ProviderSpec =
            serde_json::from_str(r#"{"provider_id":"openrouter","model_id":"m"}"#).unwrap();
        assert_eq!(spec.retry, RetryConfig::default());
    }

    #[tokio::test]
    async fn collect_stream_concatenates_deltas() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(StreamChunk {
            content: Some("Hello, ".into()),
            ..Default::default()
        }))
        .await
        .unwrap();
        tx.send(Ok(StreamChunk {
            content: Some("world".into()),
            done: true,
            usage: Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            }),
        }))
        .await
        .unwrap();

        let response = collect_stream("m", rx).await.unwrap();
        assert_eq!(response.message.text(), "Hello, world");
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[tokio::test]
    async fn collect_stream_propagates_errors() {
        let (tx, rx) = mpsc::channel(2);
        tx.send(Ok(StreamChunk {
            content: Some("partial".into()),
            ..Default::default()
        }))
        .await
        .unwrap();
        tx.send(Err(ProviderError::StreamInterrupted("reset".into())))
            .await
            .unwrap();

        let err = collect_stream("m", rx).await.unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
    }

    #[tokio::test]
    async fn empty_closed_stream_is_interrupted() {
        let (tx, rx) = mpsc::channel::<std::result::Result<StreamChunk, ProviderError>>(1);
        drop(tx);
        let err = collect_stream("m", rx).await.unwrap_err();
        assert!(err.is_transient());
    }
}
