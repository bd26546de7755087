//! Shared test helpers: scripted providers, mock tools, and a mock bridge.

use async_trait::async_trait;
use serde_json::{Value, json};
use sleuth_core::bridge::BridgeRegistry;
use sleuth_core::error::{ProviderError, StorageError, ToolError};
use sleuth_core::history::HistoryStore;
use sleuth_core::message::{Message, SessionId};
use sleuth_core::provider::{
    Provider, ProviderRequest, ProviderResponse, ProviderSpec, RetryConfig, Usage,
};
use sleuth_core::tool::{Tool, ToolResult};
use sleuth_providers::FallbackChain;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue and
/// records the request. Panics if more calls are made than responses
/// provided.
pub struct SequentialMockProvider {
    responses: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn from_results(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_texts(texts: &[&str]) -> Self {
        Self::from_results(texts.iter().map(|t| Ok(make_text_response(t))).collect())
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        let call = requests.len();
        drop(requests);

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("SequentialMockProvider: no more responses (call #{call})"))
    }
}

/// A plain text response with fixed usage (10 prompt + 5 completion).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
        metadata: serde_json::Map::new(),
    }
}

/// A single-entry chain with retries disabled.
pub fn chain_of(provider: Arc<SequentialMockProvider>) -> FallbackChain {
    FallbackChain::new(10)
        .with_jitter(0.0)
        .add(ProviderSpec::new("mock", "mock-model").with_retry(RetryConfig::no_retry()), provider)
}

/// `echo`: returns its `text` argument, optionally repeated.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to echo"},
                "repeat": {"type": "integer", "description": "Times to repeat"}
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        let text = arguments["text"].as_str().unwrap_or_default();
        let repeat = arguments["repeat"].as_u64().unwrap_or(1) as usize;
        Ok(ToolResult::ok(format!("echo: {}", text.repeat(repeat))))
    }
}

/// `fail`: always errors with its `reason`.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"reason": {"type": "string"}},
            "required": ["reason"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "fail".into(),
            reason: arguments["reason"].as_str().unwrap_or("unknown").into(),
        })
    }
}

/// `stop`: cancels the given token, as a user pressing Ctrl-C mid-run would.
pub struct CancellingTool(pub CancellationToken);

#[async_trait]
impl Tool for CancellingTool {
    fn name(&self) -> &str {
        "stop"
    }

    fn description(&self) -> &str {
        "Cancel the run"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"reason": {"type": "string"}},
            "required": ["reason"]
        })
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        self.0.cancel();
        Ok(ToolResult::ok("stopping"))
    }
}

/// Bridge exposing a fixed set of names and recording every call.
#[derive(Default)]
pub struct MockBridge {
    names: BTreeSet<String>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockBridge {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BridgeRegistry for MockBridge {
    fn list_tool_names(&self) -> BTreeSet<String> {
        self.names.clone()
    }

    async fn execute(&self, name: &str, params: Value) -> Result<ToolResult, ToolError> {
        self.calls.lock().unwrap().push((name.to_string(), params.clone()));
        Ok(ToolResult::ok(format!("bridged {name}: {params}")))
    }
}

/// A store whose every operation fails.
pub struct BrokenStore;

#[async_trait]
impl HistoryStore for BrokenStore {
    fn name(&self) -> &str {
        "broken"
    }

    async fn load_history(&self, _session: &SessionId) -> Result<Vec<Message>, StorageError> {
        Err(StorageError::Io("disk on fire".into()))
    }

    async fn save_message(&self, _session: &SessionId, _message: &Message) -> Result<(), StorageError> {
        Err(StorageError::Io("disk on fire".into()))
    }

    async fn clear_history(&self, _session: &SessionId) -> Result<(), StorageError> {
        Err(StorageError::Io("disk on fire".into()))
    }
}
