//! The agent loop controller.
//!
//! One `answer()` call drives the conversation through rounds of:
//!
//! 1. **Send** the full message list through the fallback chain
//! 2. **Parse** the reply for exactly one tool call or a completion signal
//! 3. **Act**: run the native tool, bridged tool, or delegation and append
//!    the assistant reply plus a `<tool_result>`; with no call, append the
//!    reply plus a reminder
//! 4. **Finish** on completion, or return a best-effort answer when the
//!    iteration budget runs out
//!
//! Every round appends an `assistant, user` pair, so roles alternate for the
//! whole conversation. A context overflow gets one compaction and one retry
//! of the same round.

use crate::compaction::{self, CompactionPolicy};
use crate::corrector::SchemaCorrector;
use crate::delegate::{DELEGATE_TOOL, Delegator, delegate_signature};
use crate::prompts::{self, Profile};
use crate::protocol::{
    COMPLETION_TAG, Completion, ParsedResponse, REUSE_TAG, ToolSignature, parse_response,
    strip_markup, strip_thinking,
};
use crate::scheduler::{DelegationScheduler, SchedulerConfig};
use crate::state::{IterationState, LoopPhase};
use crate::token::{estimate_messages_tokens, estimate_tokens};
use chrono::Utc;
use serde_json::Value;
use sleuth_config::AppConfig;
use sleuth_core::bridge::BridgeRegistry;
use sleuth_core::error::{Error, Result, ToolError};
use sleuth_core::event::{DomainEvent, EventBus};
use sleuth_core::history::HistoryStore;
use sleuth_core::message::{Conversation, Message, MessageKind, Role, SessionId};
use sleuth_core::provider::{ProviderRequest, Usage};
use sleuth_core::tool::{ToolCall, ToolRegistry};
use sleuth_providers::{ChainResponse, FallbackChain};
use sleuth_storage::NoopStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs for one agent instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    /// Iteration budget per `answer()` call
    pub max_iterations: u32,
    /// History cap, system message included
    pub max_history_messages: usize,
    pub max_tool_output_chars: usize,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Formatting attempts when a schema is requested
    pub max_corrections: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_history_messages: 100,
            max_tool_output_chars: 100_000,
            temperature: 0.3,
            max_tokens: Some(8192),
            max_corrections: 3,
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            max_history_messages: config.agent.max_history_messages,
            max_tool_output_chars: config.agent.max_tool_output_chars,
            temperature: config.temperature,
            max_tokens: Some(config.max_tokens),
            max_corrections: config.schema.max_corrections,
        }
    }
}

/// One question for the agent.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub session_id: SessionId,
    pub question: String,
    /// Image URLs (usually `data:` URLs) sent after the question text
    pub images: Vec<String>,
    /// Optional JSON schema the final answer must satisfy
    pub schema: Option<Value>,
}

impl AnswerRequest {
    pub fn new(session_id: SessionId, question: impl Into<String>) -> Self {
        Self {
            session_id,
            question: question.into(),
            images: Vec::new(),
            schema: None,
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// What `answer()` returns.
#[derive(Debug, Clone)]
pub struct AgentAnswer {
    pub session_id: SessionId,
    pub answer: String,
    /// False when the budget ran out before a completion signal
    pub completed: bool,
    pub iterations: u32,
    /// A provider other than the first in the chain answered some round
    pub fallback_used: bool,
    pub compactions: u32,
    pub usage: Usage,
    /// `Some` only when a schema was requested
    pub schema_valid: Option<bool>,
    /// The main loop's messages, correction turns excluded
    pub conversation: Conversation,
}

pub struct AgentLoop {
    chain: Arc<FallbackChain>,
    tools: ToolRegistry,
    bridge: Option<Arc<dyn BridgeRegistry>>,
    store: Arc<dyn HistoryStore>,
    event_bus: Arc<EventBus>,
    profile: Profile,
    settings: LoopSettings,
    compaction: CompactionPolicy,
    delegator: Option<Arc<Delegator>>,
}

impl AgentLoop {
    pub fn new(chain: Arc<FallbackChain>, tools: ToolRegistry) -> Self {
        Self {
            chain,
            tools,
            bridge: None,
            store: Arc::new(NoopStore),
            event_bus: Arc::new(EventBus::default()),
            profile: Profile::default(),
            settings: LoopSettings::default(),
            compaction: CompactionPolicy::default(),
            delegator: None,
        }
    }

    /// Build from configuration. Delegation is enabled when configured,
    /// unless the profile is itself the sub-agent one.
    pub fn from_config(
        config: &AppConfig,
        chain: Arc<FallbackChain>,
        tools: ToolRegistry,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        let profile: Profile = config
            .agent
            .profile
            .parse()
            .map_err(|message| Error::Config { message })?;

        let agent = Self::new(chain, tools)
            .with_event_bus(event_bus.clone())
            .with_profile(profile)
            .with_settings(LoopSettings::from_config(config))
            .with_compaction(CompactionPolicy {
                keep_last_segment: config.compaction.keep_last_segment,
                min_segments_to_keep: config.compaction.min_segments_to_keep,
            });

        if !config.delegation.enabled || profile == Profile::Subagent {
            return Ok(agent);
        }

        let delegation = &config.delegation;
        let scheduler = DelegationScheduler::new(SchedulerConfig {
            max_concurrent: delegation.max_concurrent,
            max_per_session: delegation.max_per_session,
            queue_enabled: delegation.queue_enabled,
            queue_capacity: delegation.queue_capacity,
        })
        .with_event_bus(event_bus);

        Ok(agent.with_delegation(
            Arc::new(scheduler),
            Duration::from_secs(delegation.timeout_secs),
            delegation.max_iterations,
        ))
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn BridgeRegistry>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_compaction(mut self, policy: CompactionPolicy) -> Self {
        self.compaction = policy;
        self
    }

    /// Enable the `delegate` tool.
    ///
    /// The sub-agent copies this agent's chain, tools, bridge, and settings
    /// as they are now, so call this after configuring those. It runs with
    /// the sub-agent profile, no history, and no delegation of its own.
    pub fn with_delegation(
        mut self,
        scheduler: Arc<DelegationScheduler>,
        timeout: Duration,
        max_iterations: u32,
    ) -> Self {
        let subagent = AgentLoop {
            chain: self.chain.clone(),
            tools: self.tools.without(DELEGATE_TOOL),
            bridge: self.bridge.clone(),
            store: Arc::new(NoopStore),
            event_bus: self.event_bus.clone(),
            profile: Profile::Subagent,
            settings: LoopSettings {
                max_iterations,
                ..self.settings
            },
            compaction: self.compaction,
            delegator: None,
        };
        self.delegator = Some(Arc::new(Delegator::new(scheduler, subagent, timeout)));
        self
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn delegator(&self) -> Option<&Arc<Delegator>> {
        self.delegator.as_ref()
    }

    /// Signatures of every native tool the model may call.
    pub fn signatures(&self) -> Vec<ToolSignature> {
        let mut signatures: Vec<ToolSignature> = self
            .tools
            .iter()
            .map(|tool| ToolSignature::from_tool(tool.as_ref()))
            .collect();
        if self.delegator.is_some() {
            signatures.push(delegate_signature());
        }
        signatures
    }

    /// Bridged names, minus anything a native tool or protocol tag shadows.
    fn bridged_names(&self) -> BTreeSet<String> {
        let Some(bridge) = &self.bridge else {
            return BTreeSet::new();
        };
        bridge
            .list_tool_names()
            .into_iter()
            .filter(|name| {
                !self.tools.contains(name)
                    && name != DELEGATE_TOOL
                    && name != COMPLETION_TAG
                    && name != REUSE_TAG
            })
            .collect()
    }

    /// Answer one question.
    pub async fn answer(&self, request: AnswerRequest, cancel: &CancellationToken) -> Result<AgentAnswer> {
        let session_id = request.session_id.clone();
        let mut state = IterationState::new(self.settings.max_iterations);

        match self.run(request, &mut state, cancel).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                if !state.phase().is_terminal() {
                    state.advance(LoopPhase::Failed);
                }
                warn!(session_id = %session_id, iteration = state.count, error = %e, "Agent loop failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: AnswerRequest,
        state: &mut IterationState,
        cancel: &CancellationToken,
    ) -> Result<AgentAnswer> {
        let AnswerRequest {
            session_id,
            question,
            images,
            schema,
        } = request;

        info!(
            session_id = %session_id,
            profile = %self.profile,
            budget = state.budget,
            "Answering question"
        );

        let history = match self.store.load_history(&session_id).await {
            Ok(messages) => normalize_history(messages),
            Err(e) => {
                warn!(session_id = %session_id, store = self.store.name(), error = %e, "Failed to load history, starting empty");
                Vec::new()
            }
        };

        let signatures = self.signatures();
        let bridged = self.bridged_names();
        let user_message = Message::user_with_images(question, images);

        let mut conversation = Conversation::new(session_id.clone());
        conversation.push(Message::system(prompts::system_prompt(
            self.profile,
            &signatures,
            &bridged,
        )));
        // The previous session answer can be reused by the shorthand
        if let Some(previous) = history.iter().rev().find(|m| m.role == Role::Assistant) {
            state.remember_plain_reply(strip_thinking(&previous.text()).trim());
        }
        for message in history {
            conversation.push(message);
        }
        conversation.push(user_message.clone());

        let mut usage = Usage::default();
        let mut fallback_used = false;
        let mut compactions = 0u32;

        while state.begin_round() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if state.is_last_chance()
                && let Some(last) = conversation.messages.last_mut()
            {
                last.append_text(prompts::last_chance());
            }
            self.truncate_history(&mut conversation.messages);

            let reply = self
                .call_model(&mut conversation, &mut compactions, cancel)
                .await?;
            let text = reply.response.message.text();

            let round_usage = reply.response.usage.unwrap_or_else(|| {
                let prompt_tokens = estimate_messages_tokens(&conversation.messages) as u32;
                let completion_tokens = estimate_tokens(&text) as u32;
                Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                }
            });
            usage.add(&round_usage);

            if reply.fallback {
                fallback_used = true;
                self.event_bus.publish(DomainEvent::FallbackUsed {
                    provider: reply.provider_id.clone(),
                    model: reply.model_id.clone(),
                    attempts: reply.attempts,
                    timestamp: Utc::now(),
                });
            }
            self.event_bus.publish(DomainEvent::ResponseGenerated {
                session_id: session_id.to_string(),
                iteration: state.count,
                provider: reply.provider_id.clone(),
                model: reply.model_id.clone(),
                tokens_used: round_usage.total_tokens,
                timestamp: Utc::now(),
            });

            state.advance(LoopPhase::ParsingResponse);
            match parse_response(&text, &signatures, &bridged) {
                ParsedResponse::Completion(Completion::Result(answer)) => {
                    conversation.push(Message::assistant(text).with_kind(MessageKind::Completion));
                    state.complete(answer);
                    break;
                }
                ParsedResponse::Completion(Completion::ReuseLast) => {
                    let Some(previous) = state.last_plain_reply().map(str::to_string) else {
                        debug!(session_id = %session_id, "Reuse requested with no earlier reply");
                        conversation.push(Message::assistant(text));
                        conversation.push(Message::reminder(prompts::reminder(schema.as_ref())));
                        continue;
                    };
                    conversation.push(Message::assistant(text).with_kind(MessageKind::Completion));
                    state.complete(previous);
                    break;
                }
                ParsedResponse::NoCall => {
                    debug!(session_id = %session_id, iteration = state.count, "No tool call in reply");
                    state.remember_plain_reply(strip_thinking(&text).trim());
                    conversation.push(Message::assistant(text));
                    conversation.push(Message::reminder(prompts::reminder(schema.as_ref())));
                }
                ParsedResponse::Native(call) => {
                    let output = match &self.delegator {
                        Some(delegator) if call.name == DELEGATE_TOOL => {
                            state.advance(LoopPhase::Delegating);
                            self.run_delegation(delegator, &session_id, &call, cancel).await?
                        }
                        _ => {
                            state.advance(LoopPhase::ExecutingTool);
                            self.run_tool(&call, false).await
                        }
                    };
                    conversation.push(Message::assistant(text));
                    conversation.push(Message::tool_result(self.cap_output(output)));
                }
                ParsedResponse::Bridged(call) => {
                    state.advance(LoopPhase::ExecutingTool);
                    let output = self.run_tool(&call, true).await;
                    conversation.push(Message::assistant(text));
                    conversation.push(Message::tool_result(self.cap_output(output)));
                }
            }
        }

        let completed = state.completed;
        let mut answer = match state.final_answer.take() {
            Some(answer) if completed => answer,
            _ => {
                warn!(session_id = %session_id, budget = state.budget, "Iteration budget exhausted without completion");
                self.event_bus.publish(DomainEvent::IterationBudgetExhausted {
                    session_id: session_id.to_string(),
                    budget: state.budget,
                    timestamp: Utc::now(),
                });
                best_effort_answer(&conversation.messages)
                    .unwrap_or_else(|| prompts::incomplete_notice(state.budget))
            }
        };

        let mut schema_valid = None;
        if let Some(schema) = &schema {
            if completed {
                state.advance(LoopPhase::Correcting);
                let outcome = SchemaCorrector::new(&self.chain, self.settings.max_corrections)
                    .with_max_tokens(self.settings.max_tokens)
                    .format(&answer, schema, cancel)
                    .await?;
                usage.add(&outcome.usage);
                fallback_used |= outcome.fallback_used;
                schema_valid = Some(outcome.valid);
                answer = outcome.answer;
            } else {
                schema_valid = Some(false);
            }
        }
        state.advance(LoopPhase::Completed);

        self.persist(&session_id, &user_message, &answer).await;

        info!(
            session_id = %session_id,
            iterations = state.count,
            completed,
            fallback_used,
            compactions,
            tokens = usage.total_tokens,
            "Answer ready"
        );

        Ok(AgentAnswer {
            session_id,
            answer,
            completed,
            iterations: state.count,
            fallback_used,
            compactions,
            usage,
            schema_valid,
            conversation,
        })
    }

    /// One model call, with a single compaction and retry on overflow.
    async fn call_model(
        &self,
        conversation: &mut Conversation,
        compactions: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<ChainResponse> {
        let reason = match self.complete(&conversation.messages, cancel).await {
            Err(Error::ContextOverflow(reason)) => reason,
            other => return other,
        };

        warn!(session_id = %conversation.id, reason = %reason, "Context overflow, compacting history");
        let (compacted, stats) = compaction::compact(&conversation.messages, &self.compaction);
        if stats.is_noop() {
            return Err(Error::ContextOverflow(format!(
                "{reason} (compaction removed nothing)"
            )));
        }

        *compactions += 1;
        self.event_bus.publish(DomainEvent::HistoryCompacted {
            session_id: conversation.id.to_string(),
            original_count: stats.original_count,
            compacted_count: stats.compacted_count,
            tokens_saved: stats.tokens_saved,
            timestamp: Utc::now(),
        });
        conversation.messages = compacted;

        self.complete(&conversation.messages, cancel).await
    }

    async fn complete(&self, messages: &[Message], cancel: &CancellationToken) -> Result<ChainResponse> {
        self.chain
            .execute(
                |spec| ProviderRequest {
                    temperature: self.settings.temperature,
                    max_tokens: self.settings.max_tokens,
                    ..ProviderRequest::new(spec.model_id.clone(), messages.to_vec())
                },
                cancel,
            )
            .await
    }

    /// Run a native or bridged tool. Failures become result text.
    async fn run_tool(&self, call: &ToolCall, bridged: bool) -> String {
        let started = Instant::now();
        let outcome = if bridged {
            match &self.bridge {
                Some(bridge) => bridge.execute(&call.name, call.arguments.clone()).await,
                None => Err(ToolError::NotFound(call.name.clone())),
            }
        } else {
            self.tools.execute(call).await
        };

        let (success, output) = match outcome {
            Ok(result) => (result.success, result.output),
            Err(e) => (false, format!("Error: {e}")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        debug!(tool = %call.name, bridged, success, duration_ms, "Tool executed");
        self.event_bus.publish(DomainEvent::ToolExecuted {
            tool_name: call.name.clone(),
            bridged,
            success,
            duration_ms,
            timestamp: Utc::now(),
        });
        output
    }

    /// Run `delegate`. Only cancellation escapes; other failures become text.
    async fn run_delegation(
        &self,
        delegator: &Delegator,
        session_id: &SessionId,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let task = call
            .arguments
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim();
        if task.is_empty() {
            return Ok("Error: delegate needs a non-empty task".into());
        }

        match delegator.delegate(session_id, task, cancel).await {
            Ok(findings) => Ok(findings),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Delegation failed");
                Ok(format!("Delegation failed: {e}"))
            }
        }
    }

    fn cap_output(&self, output: String) -> String {
        let max = self.settings.max_tool_output_chars;
        let Some((cut, _)) = output.char_indices().nth(max) else {
            return output;
        };
        let total = output.chars().count();
        format!(
            "{}\n\n[output truncated: showing {max} of {total} characters]",
            &output[..cut]
        )
    }

    /// Drop the oldest messages after the system message until the cap fits.
    /// Never leaves an assistant message first.
    fn truncate_history(&self, messages: &mut Vec<Message>) {
        let max = self.settings.max_history_messages.max(2);
        if messages.len() <= max {
            return;
        }
        let start = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
        let mut end = start + (messages.len() - max);
        while end + 1 < messages.len() && messages[end].role == Role::Assistant {
            end += 1;
        }
        debug!(dropped = end - start, max, "Truncating history");
        messages.drain(start..end);
    }

    async fn persist(&self, session_id: &SessionId, user: &Message, answer: &str) {
        let reply = Message::assistant(answer).with_kind(MessageKind::Completion);
        for message in [user, &reply] {
            if let Err(e) = self.store.save_message(session_id, message).await {
                warn!(session_id = %session_id, store = self.store.name(), error = %e, "Failed to save history");
                return;
            }
        }
    }
}

/// Make loaded history alternate, starting with a user message and ending
/// with an assistant one.
fn normalize_history(messages: Vec<Message>) -> Vec<Message> {
    let mut normalized: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        let keep = match normalized.last() {
            _ if message.role == Role::System => false,
            None => message.role == Role::User,
            Some(previous) => previous.role != message.role,
        };
        if keep {
            normalized.push(message);
        }
    }
    if normalized.last().is_some_and(|m| m.role == Role::User) {
        normalized.pop();
    }
    normalized
}

/// Last assistant text with tags and thinking removed.
fn best_effort_answer(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| strip_markup(&m.text()))
        .find(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use serde_json::json;
    use sleuth_core::error::ProviderError;
    use sleuth_core::provider::{ProviderSpec, RetryConfig};
    use sleuth_core::tool::Tool;
    use sleuth_storage::InMemoryStore;

    const DONE: &str = "<attempt_completion><result>done</result></attempt_completion>";

    fn registry(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        registry
    }

    fn agent(provider: &Arc<SequentialMockProvider>) -> AgentLoop {
        AgentLoop::new(
            Arc::new(chain_of(provider.clone())),
            registry(vec![Arc::new(EchoTool), Arc::new(FailingTool)]),
        )
    }

    fn ask(question: &str) -> AnswerRequest {
        AnswerRequest::new(SessionId::from("s1"), question)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<Arc<DomainEvent>>) -> Vec<Arc<DomainEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn completes_on_first_round() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<thinking>easy</thinking><attempt_completion><result>42</result></attempt_completion>",
        ]));
        let answer = agent(&provider).answer(ask("meaning?"), &CancellationToken::new()).await.unwrap();

        assert!(answer.completed);
        assert_eq!(answer.answer, "42");
        assert_eq!(answer.iterations, 1);
        assert_eq!(answer.usage.total_tokens, 15);
        assert!(!answer.fallback_used);
        assert_eq!(answer.schema_valid, None);

        let messages = &answer.conversation.messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[2].kind, MessageKind::Completion);
        // Thinking stays in the stored message
        assert!(messages[2].text().contains("<thinking>easy</thinking>"));
    }

    #[tokio::test]
    async fn reply_without_call_gets_reminder_and_costs_one_iteration() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "Let me think about that.",
            "<attempt_completion><result>42</result></attempt_completion>",
        ]));
        let answer = agent(&provider).answer(ask("meaning?"), &CancellationToken::new()).await.unwrap();

        assert_eq!(answer.iterations, 2);
        let messages = &answer.conversation.messages;
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[3].kind, MessageKind::Reminder);
        assert!(messages.iter().all(|m| !m.is_tool_result()));
        assert_eq!(provider.requests()[1].messages.len(), 4);
    }

    #[tokio::test]
    async fn malformed_call_is_treated_as_no_call() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<echo><text>hi</text><repeat>2</echo>",
            DONE,
        ]));
        let answer = agent(&provider).answer(ask("echo"), &CancellationToken::new()).await.unwrap();

        let messages = &answer.conversation.messages;
        assert_eq!(messages[3].kind, MessageKind::Reminder);
        assert!(messages.iter().all(|m| !m.is_tool_result()));
    }

    #[tokio::test]
    async fn tool_call_appends_reply_and_result() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<echo><text>hi</text><repeat>2</repeat></echo>",
            DONE,
        ]));
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let answer = agent(&provider)
            .with_event_bus(bus)
            .answer(ask("echo"), &CancellationToken::new())
            .await
            .unwrap();

        let messages = &answer.conversation.messages;
        assert_eq!(messages.len(), 5);
        assert!(messages[3].is_tool_result());
        assert!(messages[3].text().contains("echo: hihi"));
        assert!(answer.conversation.is_alternating());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e.as_ref(),
            DomainEvent::ToolExecuted { tool_name, bridged: false, success: true, .. } if tool_name == "echo"
        )));
        let responses = events
            .iter()
            .filter(|e| matches!(e.as_ref(), DomainEvent::ResponseGenerated { .. }))
            .count();
        assert_eq!(responses, 2);
    }

    #[tokio::test]
    async fn tool_failure_still_appends_a_pair() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<fail><reason>boom</reason></fail>",
            DONE,
        ]));
        let answer = agent(&provider).answer(ask("try"), &CancellationToken::new()).await.unwrap();

        let messages = &answer.conversation.messages;
        assert_eq!(messages[2].role, Role::Assistant);
        assert!(messages[3].is_tool_result());
        assert!(messages[3].text().contains("Error:"));
        assert!(messages[3].text().contains("boom"));
        assert!(answer.completed);
        assert!(answer.conversation.is_alternating());
    }

    #[tokio::test]
    async fn bridged_call_goes_through_the_bridge() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<jira><params>{\"id\": 7}</params></jira>",
            DONE,
        ]));
        let bridge = Arc::new(MockBridge::new(&["jira", "echo"]));
        let answer = agent(&provider)
            .with_bridge(bridge.clone())
            .answer(ask("ticket?"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bridge.calls(), vec![("jira".to_string(), json!({"id": 7}))]);
        assert!(answer.conversation.messages[3].text().contains("bridged jira"));

        // Native echo shadows the bridged one
        let system = provider.requests()[0].messages[0].text();
        assert!(system.contains("<jira>\n<params>"));
        assert!(!system.contains("<echo>\n<params>"));
    }

    #[tokio::test]
    async fn last_round_carries_the_last_chance_warning() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<echo><text>a</text></echo>",
            "<echo><text>b</text></echo>",
        ]));
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let answer = agent(&provider)
            .with_event_bus(bus)
            .with_settings(LoopSettings {
                max_iterations: 2,
                ..LoopSettings::default()
            })
            .answer(ask("loop"), &CancellationToken::new())
            .await
            .unwrap();

        let requests = provider.requests();
        let warning = "This is your final iteration";
        assert!(!requests[0].messages.last().unwrap().text().contains(warning));
        let last = requests[1].messages.last().unwrap();
        assert!(last.is_tool_result());
        assert!(last.text().contains(warning));
        assert!(is_alternating_roles(&requests[1].messages));

        assert!(!answer.completed);
        assert_eq!(answer.iterations, 2);
        assert!(!answer.answer.contains('<'));
        assert!(answer.answer.contains('b'));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e.as_ref(), DomainEvent::IterationBudgetExhausted { budget: 2, .. })));
    }

    fn is_alternating_roles(messages: &[Message]) -> bool {
        sleuth_core::message::is_alternating(messages)
    }

    #[tokio::test]
    async fn exhaustion_without_text_returns_notice() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&["<thinking>hmm</thinking>"]));
        let answer = agent(&provider)
            .with_settings(LoopSettings {
                max_iterations: 1,
                ..LoopSettings::default()
            })
            .answer(ask("?"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!answer.completed);
        assert!(answer.answer.contains("could not finish within 1 iterations"));
    }

    #[tokio::test]
    async fn reuse_returns_previous_plain_reply() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<thinking>check</thinking>The answer is 7.",
            "<attempt_complete/>",
        ]));
        let answer = agent(&provider).answer(ask("?"), &CancellationToken::new()).await.unwrap();
        assert!(answer.completed);
        assert_eq!(answer.answer, "The answer is 7.");
        assert_eq!(answer.iterations, 2);
    }

    #[tokio::test]
    async fn reuse_falls_back_to_the_answer_from_history() {
        let store = Arc::new(InMemoryStore::new());
        let session = SessionId::from("s1");
        for message in [Message::user("first?"), Message::assistant("It is 42.")] {
            store.save_message(&session, &message).await.unwrap();
        }
        let provider = Arc::new(SequentialMockProvider::from_texts(&["<attempt_complete/>"]));
        let answer = agent(&provider)
            .with_store(store)
            .answer(AnswerRequest::new(session, "same again?"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(answer.completed);
        assert_eq!(answer.answer, "It is 42.");
        assert_eq!(answer.iterations, 1);
    }

    #[tokio::test]
    async fn reuse_without_previous_reply_reminds() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&["<attempt_complete/>", DONE]));
        let answer = agent(&provider).answer(ask("?"), &CancellationToken::new()).await.unwrap();
        assert_eq!(answer.conversation.messages[3].kind, MessageKind::Reminder);
        assert_eq!(answer.answer, "done");
    }

    #[tokio::test]
    async fn tool_output_is_capped() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<echo><text>hello world</text></echo>",
            DONE,
        ]));
        let answer = agent(&provider)
            .with_settings(LoopSettings {
                max_tool_output_chars: 5,
                ..LoopSettings::default()
            })
            .answer(ask("?"), &CancellationToken::new())
            .await
            .unwrap();
        let result = answer.conversation.messages[3].text();
        assert!(result.contains("echo:"));
        assert!(!result.contains("world"));
        assert!(result.contains("[output truncated: showing 5 of 17 characters]"));
    }

    #[tokio::test]
    async fn history_cap_keeps_system_and_never_starts_with_assistant() {
        let texts: Vec<String> = (0..4).map(|i| format!("<echo><text>{i}</text></echo>")).collect();
        let mut script: Vec<&str> = texts.iter().map(String::as_str).collect();
        script.push(DONE);
        let provider = Arc::new(SequentialMockProvider::from_texts(&script));
        agent(&provider)
            .with_settings(LoopSettings {
                max_history_messages: 4,
                ..LoopSettings::default()
            })
            .answer(ask("?"), &CancellationToken::new())
            .await
            .unwrap();

        for request in provider.requests() {
            assert!(request.messages.len() <= 4);
            assert_eq!(request.messages[0].role, Role::System);
            assert_eq!(request.messages[1].role, Role::User);
            assert_eq!(request.messages.last().unwrap().role, Role::User);
        }
    }

    #[tokio::test]
    async fn overflow_compacts_once_and_retries() {
        let store = Arc::new(InMemoryStore::new());
        let session = SessionId::from("s1");
        for message in [
            Message::user("where is main?"),
            Message::assistant("<echo><text>x</text></echo>"),
            Message::tool_result("echo: x"),
            Message::assistant("<attempt_completion><result>src/main.rs</result></attempt_completion>")
                .with_kind(MessageKind::Completion),
        ] {
            store.save_message(&session, &message).await.unwrap();
        }

        let provider = Arc::new(SequentialMockProvider::from_results(vec![
            Err(ProviderError::ContextOverflow("maximum context length exceeded".into())),
            Ok(make_text_response(DONE)),
        ]));
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let answer = agent(&provider)
            .with_store(store)
            .with_event_bus(bus)
            .answer(ask("and the tests?"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(answer.compactions, 1);
        assert_eq!(answer.iterations, 1);
        let requests = provider.requests();
        assert_eq!(requests[0].messages.len(), 6);
        assert_eq!(requests[1].messages.len(), 4);
        assert!(is_alternating_roles(&requests[1].messages));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e.as_ref(),
            DomainEvent::HistoryCompacted { original_count: 6, compacted_count: 4, .. }
        )));
    }

    #[tokio::test]
    async fn overflow_with_nothing_to_compact_is_fatal() {
        let provider = Arc::new(SequentialMockProvider::from_results(vec![Err(
            ProviderError::ContextOverflow("too long".into()),
        )]));
        let err = agent(&provider)
            .answer(ask("?"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_context_overflow());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn fatal_provider_error_aborts() {
        let provider = Arc::new(SequentialMockProvider::from_results(vec![Err(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let err = agent(&provider)
            .answer(ask("?"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_call() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent(&provider).answer(ask("?"), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_is_checked_every_round() {
        let cancel = CancellationToken::new();
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<stop><reason>enough</reason></stop>",
        ]));
        let agent = AgentLoop::new(
            Arc::new(chain_of(provider.clone())),
            registry(vec![Arc::new(CancellingTool(cancel.clone()))]),
        );
        let err = agent.answer(ask("?"), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn fallback_provider_is_reported() {
        let primary = Arc::new(SequentialMockProvider::from_results(vec![Err(
            ProviderError::Network("connection reset".into()),
        )]));
        let backup = Arc::new(SequentialMockProvider::from_texts(&[DONE]));
        let chain = FallbackChain::new(10)
            .with_jitter(0.0)
            .add(
                ProviderSpec::new("primary", "big").with_retry(RetryConfig::no_retry()),
                primary,
            )
            .add(
                ProviderSpec::new("backup", "small").with_retry(RetryConfig::no_retry()),
                backup.clone(),
            );
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let answer = AgentLoop::new(Arc::new(chain), ToolRegistry::new())
            .with_event_bus(bus)
            .answer(ask("?"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(answer.fallback_used);
        assert_eq!(backup.requests()[0].model, "small");
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e.as_ref(),
            DomainEvent::FallbackUsed { provider, .. } if provider == "backup"
        )));
    }

    #[tokio::test]
    async fn history_is_loaded_and_saved() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<attempt_completion><result>first</result></attempt_completion>",
            "<attempt_completion><result>second</result></attempt_completion>",
        ]));
        let agent = agent(&provider).with_store(store.clone());
        let cancel = CancellationToken::new();

        agent.answer(ask("one"), &cancel).await.unwrap();
        agent.answer(ask("two"), &cancel).await.unwrap();

        let second = &provider.requests()[1].messages;
        assert_eq!(second.len(), 4);
        assert_eq!(second[1].text(), "one");
        assert_eq!(second[2].text(), "first");

        let saved = store.load_history(&SessionId::from("s1")).await.unwrap();
        assert_eq!(saved.len(), 4);
        assert_eq!(saved[3].text(), "second");
        assert_eq!(saved[3].kind, MessageKind::Completion);
    }

    #[tokio::test]
    async fn loaded_history_is_normalized() {
        let store = Arc::new(InMemoryStore::new());
        let session = SessionId::from("s1");
        for message in [
            Message::assistant("orphan"),
            Message::user("a"),
            Message::user("b"),
            Message::assistant("c"),
            Message::user("dangling"),
        ] {
            store.save_message(&session, &message).await.unwrap();
        }
        let provider = Arc::new(SequentialMockProvider::from_texts(&[DONE]));
        let answer = agent(&provider)
            .with_store(store)
            .answer(ask("next"), &CancellationToken::new())
            .await
            .unwrap();

        let texts: Vec<String> = answer.conversation.messages[1..3].iter().map(Message::text).collect();
        assert_eq!(texts, ["a", "c"]);
        assert!(answer.conversation.is_alternating());
    }

    #[tokio::test]
    async fn storage_failures_are_not_fatal() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[DONE]));
        let answer = agent(&provider)
            .with_store(Arc::new(BrokenStore))
            .answer(ask("?"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer.answer, "done");
        assert_eq!(answer.conversation.messages.len(), 3);
    }

    #[tokio::test]
    async fn schema_answer_is_corrected_in_isolation() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<attempt_completion><result>The name is Ada</result></attempt_completion>",
            "{\"name\": \"Ada\"}",
        ]));
        let schema = json!({"type": "object", "properties": {"name": {"type": "string"}}});
        let answer = agent(&provider)
            .answer(ask("who?").with_schema(schema), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(answer.schema_valid, Some(true));
        assert_eq!(serde_json::from_str::<Value>(&answer.answer).unwrap(), json!({"name": "Ada"}));
        assert_eq!(answer.conversation.messages.len(), 3);
        assert_eq!(answer.usage.total_tokens, 30);
        // Formatter turn starts fresh
        assert_eq!(provider.requests()[1].messages.len(), 2);
    }

    #[tokio::test]
    async fn fallback_during_formatting_is_reported() {
        let primary = Arc::new(SequentialMockProvider::from_results(vec![
            Ok(make_text_response(
                "<attempt_completion><result>The name is Ada</result></attempt_completion>",
            )),
            Err(ProviderError::Network("connection reset".into())),
        ]));
        let backup = Arc::new(SequentialMockProvider::from_texts(&["{\"name\": \"Ada\"}"]));
        let chain = FallbackChain::new(10)
            .with_jitter(0.0)
            .add(
                ProviderSpec::new("primary", "big").with_retry(RetryConfig::no_retry()),
                primary.clone(),
            )
            .add(
                ProviderSpec::new("backup", "small").with_retry(RetryConfig::no_retry()),
                backup.clone(),
            );
        let schema = json!({"type": "object", "properties": {"name": {"type": "string"}}});
        let answer = AgentLoop::new(Arc::new(chain), ToolRegistry::new())
            .answer(ask("who?").with_schema(schema), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(primary.call_count(), 2);
        assert_eq!(backup.call_count(), 1);
        assert_eq!(answer.schema_valid, Some(true));
        assert!(answer.fallback_used);
    }

    #[tokio::test]
    async fn reminder_carries_schema_when_requested() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "thinking out loud",
            "<attempt_completion><result>{\"name\": \"Ada\"}</result></attempt_completion>",
        ]));
        let schema = json!({"type": "object", "properties": {"name": {"type": "string"}}});
        let answer = agent(&provider)
            .answer(ask("who?").with_schema(schema), &CancellationToken::new())
            .await
            .unwrap();

        assert!(answer.conversation.messages[3].text().contains("\"name\""));
        assert_eq!(answer.schema_valid, Some(true));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn incomplete_answer_is_marked_invalid_for_schema() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&["still looking"]));
        let answer = agent(&provider)
            .with_settings(LoopSettings {
                max_iterations: 1,
                ..LoopSettings::default()
            })
            .answer(ask("?").with_schema(json!({"type": "object"})), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!answer.completed);
        assert_eq!(answer.schema_valid, Some(false));
        assert_eq!(provider.call_count(), 1);
    }

    fn delegating_agent(provider: &Arc<SequentialMockProvider>, scheduler: Arc<DelegationScheduler>) -> AgentLoop {
        agent(provider).with_delegation(scheduler, Duration::from_secs(60), 5)
    }

    #[tokio::test]
    async fn delegation_runs_an_isolated_subagent() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<delegate><task>find the entry point</task></delegate>",
            "<attempt_completion><result>main is in src/main.rs</result></attempt_completion>",
            DONE,
        ]));
        let scheduler = Arc::new(DelegationScheduler::new(SchedulerConfig::default()));
        let answer = delegating_agent(&provider, scheduler.clone())
            .answer(ask("explain"), &CancellationToken::new())
            .await
            .unwrap();

        let result = answer.conversation.messages[3].text();
        assert!(result.contains("main is in src/main.rs"));

        let requests = provider.requests();
        assert!(requests[0].messages[0].text().contains("## delegate"));
        let sub = &requests[1].messages;
        assert_eq!(sub.len(), 2);
        assert!(sub[0].text().contains("cannot delegate further"));
        assert!(!sub[0].text().contains("## delegate"));
        assert!(sub[1].text().contains("find the entry point"));

        let stats = scheduler.stats();
        assert_eq!(stats.completed, 1);
        assert!(stats.is_settled());
    }

    #[tokio::test]
    async fn delegation_failure_becomes_tool_result() {
        let provider = Arc::new(SequentialMockProvider::from_texts(&[
            "<delegate><task>look around</task></delegate>",
            DONE,
        ]));
        let scheduler = Arc::new(DelegationScheduler::new(SchedulerConfig {
            max_concurrent: 0,
            queue_enabled: false,
            ..SchedulerConfig::default()
        }));
        let answer = delegating_agent(&provider, scheduler.clone())
            .answer(ask("explain"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(answer.conversation.messages[3].text().contains("Delegation failed"));
        assert_eq!(scheduler.stats().failed, 1);
        assert!(answer.completed);
    }

    #[test]
    fn profile_from_config_is_validated() {
        let mut config = AppConfig::default();
        config.agent.profile = "wizard".into();
        let chain = Arc::new(FallbackChain::new(1));
        let result = AgentLoop::from_config(&config, chain, ToolRegistry::new(), Arc::new(EventBus::default()));
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn config_enables_delegation_except_for_subagents() {
        let chain = Arc::new(FallbackChain::new(1));
        let bus = Arc::new(EventBus::default());

        let mut config = AppConfig::default();
        config.delegation.enabled = true;
        let agent = AgentLoop::from_config(&config, chain.clone(), ToolRegistry::new(), bus.clone()).unwrap();
        assert!(agent.delegator().is_some());
        assert!(agent.signatures().iter().any(|s| s.name == DELEGATE_TOOL));

        config.agent.profile = "subagent".into();
        let agent = AgentLoop::from_config(&config, chain, ToolRegistry::new(), bus).unwrap();
        assert!(agent.delegator().is_none());
    }
}
