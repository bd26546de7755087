//! Provider resilience: per-provider retry with exponential backoff and an
//! ordered fallback chain across providers.
//!
//! Each chain entry is retried for transient failures (network, rate limit,
//! timeout, 5xx) up to its own `max_retries`; once those run out the chain
//! advances to the next entry with a fresh retry budget. Non-transient
//! failures abort the whole chain immediately. A total-attempts ceiling
//! bounds worst-case latency regardless of how many entries are configured.

use sleuth_core::error::{Error, ProviderError};
use sleuth_core::provider::{
    Provider, ProviderRequest, ProviderResponse, ProviderSpec, RetryConfig, collect_stream,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential backoff: `initial × factor^(retry-1)`, capped at `max`, with
/// symmetric jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: 0.1,
        }
    }

    pub fn from_retry(retry: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(retry.initial_delay_ms),
            Duration::from_millis(retry.max_delay_ms),
            retry.backoff_factor,
        )
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * self.factor.powi(retry.saturating_sub(1) as i32);
        let clamped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let range = clamped * self.jitter;
            let offset = rand::random::<f64>() * range * 2.0 - range;
            (clamped + offset).clamp(0.0, self.max.as_millis() as f64)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_retry(&RetryConfig::default())
    }
}

/// A successful response tagged with where it came from.
#[derive(Debug, Clone)]
pub struct ChainResponse {
    pub response: ProviderResponse,
    pub provider_id: String,
    pub model_id: String,
    /// True when any entry other than the first produced the response
    pub fallback: bool,
    /// Attempts made across the whole chain, the successful one included
    pub attempts: u32,
}

struct ChainEntry {
    spec: ProviderSpec,
    provider: Arc<dyn Provider>,
}

/// An ordered list of providers tried in sequence, each with its own retry policy.
pub struct FallbackChain {
    entries: Vec<ChainEntry>,
    max_total_attempts: u32,
    request_timeout: Duration,
    jitter: f64,
}

impl FallbackChain {
    /// Create an empty chain with a total-attempts ceiling.
    pub fn new(max_total_attempts: u32) -> Self {
        Self {
            entries: Vec::new(),
            max_total_attempts: max_total_attempts.max(1),
            request_timeout: Duration::from_secs(300),
            jitter: 0.1,
        }
    }

    /// Append a provider to the chain.
    pub fn add(mut self, spec: ProviderSpec, provider: Arc<dyn Provider>) -> Self {
        self.entries.push(ChainEntry { spec, provider });
        self
    }

    /// Per-attempt timeout; an attempt that exceeds it counts as a transient failure.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn specs(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.entries.iter().map(|e| &e.spec)
    }

    /// Run one completion through the chain.
    ///
    /// `build` turns the current entry's spec into a request, so each
    /// provider is asked for its own model.
    pub async fn execute<F>(&self, build: F, cancel: &CancellationToken) -> sleuth_core::Result<ChainResponse>
    where
        F: Fn(&ProviderSpec) -> ProviderRequest,
    {
        if self.entries.is_empty() {
            return Err(ProviderError::NotConfigured("No providers in fallback chain".into()).into());
        }

        let mut attempts = 0u32;
        let mut failures = Vec::new();
        let mut last_error = None;

        'chain: for (index, entry) in self.entries.iter().enumerate() {
            let spec = &entry.spec;
            let backoff = ExponentialBackoff::from_retry(&spec.retry).with_jitter(self.jitter);

            for retry in 0..=spec.retry.max_retries {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if attempts >= self.max_total_attempts {
                    warn!(
                        max_total_attempts = self.max_total_attempts,
                        "Fallback: total attempt ceiling reached"
                    );
                    break 'chain;
                }
                attempts += 1;

                debug!(
                    provider = %spec.provider_id,
                    model = %spec.model_id,
                    attempt = attempts,
                    retry,
                    "Fallback: trying provider"
                );

                match self.attempt(entry, build(spec), cancel).await {
                    Ok(response) => {
                        if index > 0 {
                            info!(
                                provider = %spec.provider_id,
                                model = %spec.model_id,
                                attempts,
                                "Fallback: answered by fallback provider"
                            );
                        }
                        return Ok(ChainResponse {
                            response,
                            provider_id: spec.provider_id.clone(),
                            model_id: spec.model_id.clone(),
                            fallback: index > 0,
                            attempts,
                        });
                    }
                    Err(ProviderError::Cancelled) => return Err(Error::Cancelled),
                    Err(ProviderError::ContextOverflow(message)) => {
                        return Err(Error::ContextOverflow(message));
                    }
                    Err(e) if !e.is_transient() => {
                        warn!(
                            provider = %spec.provider_id,
                            error = %e,
                            "Fallback: non-transient failure, aborting chain"
                        );
                        return Err(Error::Provider(e));
                    }
                    Err(e) => {
                        warn!(
                            provider = %spec.provider_id,
                            model = %spec.model_id,
                            attempt = attempts,
                            error = %e,
                            "Fallback: transient failure"
                        );
                        failures.push(format!("{}/{}: {e}", spec.provider_id, spec.model_id));
                        last_error = Some(e);

                        if retry < spec.retry.max_retries {
                            let delay = backoff.delay_for(retry + 1);
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(Error::Cancelled),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }

            if index + 1 < self.entries.len() {
                info!(
                    provider = %spec.provider_id,
                    next = %self.entries[index + 1].spec.provider_id,
                    "Fallback: retries exhausted, trying next provider"
                );
            }
        }

        Err(Error::ChainExhausted {
            attempts,
            failures,
            last: last_error
                .unwrap_or_else(|| ProviderError::NotConfigured("No attempt was made".into())),
        })
    }

    async fn attempt(
        &self,
        entry: &ChainEntry,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let call = async {
            let rx = entry.provider.stream(request).await?;
            collect_stream(&entry.spec.model_id, rx).await
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = tokio::time::timeout(self.request_timeout, call) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "Provider '{}' timed out after {}s",
                    entry.spec.provider_id,
                    self.request_timeout.as_secs()
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sleuth_core::message::Message;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted outcomes, then repeats the last one.
    struct ScriptedProvider {
        name: String,
        script: Mutex<VecDeque<std::result::Result<String, ProviderError>>>,
        last: Mutex<Option<std::result::Result<String, ProviderError>>>,
        call_count: Mutex<usize>,
    }

    impl ScriptedProvider {
        fn new(name: &str, script: Vec<std::result::Result<String, ProviderError>>) -> Self {
            Self {
                name: name.into(),
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                call_count: Mutex::new(0),
            }
        }

        fn failing(name: &str, error: ProviderError) -> Self {
            Self::new(name, vec![Err(error)])
        }

        fn succeeding(name: &str) -> Self {
            Self::new(name, vec![Ok(format!("answer from {name}"))])
        }

        fn calls(&self) -> usize {
            *self.call_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(
            &self,
            request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            *self.call_count.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();
            let outcome = match next {
                Some(outcome) => {
                    *self.last.lock().unwrap() = Some(outcome.clone());
                    outcome
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Err(ProviderError::NotConfigured("empty script".into()))),
            };
            outcome.map(|text| ProviderResponse {
                message: Message::assistant(text),
                usage: None,
                model: request.model,
                metadata: serde_json::Map::new(),
            })
        }
    }

    /// A provider that never answers.
    struct HangingProvider;

    #[async_trait]
    impl Provider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ProviderError::Timeout("unreachable".into()))
        }
    }

    fn spec(provider: &str, max_retries: u32) -> ProviderSpec {
        ProviderSpec::new(provider, format!("{provider}-model")).with_retry(RetryConfig {
            max_retries,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        })
    }

    fn build(spec: &ProviderSpec) -> ProviderRequest {
        ProviderRequest::new(&spec.model_id, vec![Message::user("hello")])
    }

    fn network() -> ProviderError {
        ProviderError::Network("connection reset".into())
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(1_000), Duration::from_millis(5_000), 2.0)
                .with_jitter(0.0);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(5_000));
        assert_eq!(backoff.delay_for(20), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(1_000), Duration::from_secs(30), 2.0)
                .with_jitter(0.1);
        for _ in 0..100 {
            let delay = backoff.delay_for(1).as_millis();
            assert!((900..=1_100).contains(&delay), "delay {delay} out of range");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_provider_succeeds_without_fallback() {
        let a = Arc::new(ScriptedProvider::succeeding("a"));
        let b = Arc::new(ScriptedProvider::succeeding("b"));
        let chain = FallbackChain::new(10).add(spec("a", 3), a.clone()).add(spec("b", 3), b.clone());

        let result = chain.execute(build, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.provider_id, "a");
        assert!(!result.fallback);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.response.model, "a-model");
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_with_backoff() {
        let a = Arc::new(ScriptedProvider::new(
            "a",
            vec![Err(network()), Err(network()), Ok("third time".into())],
        ));
        let chain = FallbackChain::new(10).with_jitter(0.0).add(spec("a", 3), a.clone());

        let started = tokio::time::Instant::now();
        let result = chain.execute(build, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.response.message.text(), "third time");
        assert_eq!(result.attempts, 3);
        assert!(!result.fallback);
        assert_eq!(a.calls(), 3);
        // 1000ms + 2000ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_providers_fall_back_in_order() {
        let a = Arc::new(ScriptedProvider::failing("a", network()));
        let b = Arc::new(ScriptedProvider::failing(
            "b",
            ProviderError::ApiError {
                status_code: 503,
                message: "overloaded".into(),
            },
        ));
        let c = Arc::new(ScriptedProvider::succeeding("c"));
        let chain = FallbackChain::new(10)
            .add(spec("a", 1), a.clone())
            .add(spec("b", 1), b.clone())
            .add(spec("c", 1), c.clone());

        let result = chain.execute(build, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.provider_id, "c");
        assert_eq!(result.model_id, "c-model");
        assert!(result.fallback);
        assert_eq!(result.attempts, 5);
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 2);
        assert_eq!(c.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_aborts_without_advancing() {
        let a = Arc::new(ScriptedProvider::failing(
            "a",
            ProviderError::AuthenticationFailed("bad key".into()),
        ));
        let b = Arc::new(ScriptedProvider::succeeding("b"));
        let chain = FallbackChain::new(10).add(spec("a", 3), a.clone()).add(spec("b", 3), b.clone());

        let err = chain.execute(build, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::AuthenticationFailed(_))));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn context_overflow_is_surfaced_for_compaction() {
        let a = Arc::new(ScriptedProvider::failing(
            "a",
            ProviderError::ContextOverflow("maximum context length is 8192 tokens".into()),
        ));
        let b = Arc::new(ScriptedProvider::succeeding("b"));
        let chain = FallbackChain::new(10).add(spec("a", 3), a.clone()).add(spec("b", 3), b.clone());

        let err = chain.execute(build, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_context_overflow());
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn total_attempt_ceiling_bounds_the_chain() {
        let a = Arc::new(ScriptedProvider::failing("a", network()));
        let b = Arc::new(ScriptedProvider::failing("b", network()));
        let chain = FallbackChain::new(4).add(spec("a", 2), a.clone()).add(spec("b", 5), b.clone());

        let err = chain.execute(build, &CancellationToken::new()).await.unwrap_err();
        match err {
            Error::ChainExhausted {
                attempts,
                failures,
                last,
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(failures.len(), 4);
                assert!(last.is_transient());
            }
            other => panic!("Expected ChainExhausted, got: {other:?}"),
        }
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_transient_and_falls_back() {
        let b = Arc::new(ScriptedProvider::succeeding("b"));
        let chain = FallbackChain::new(10)
            .with_request_timeout(Duration::from_millis(50))
            .add(spec("hanging", 0), Arc::new(HangingProvider))
            .add(spec("b", 0), b.clone());

        let result = chain.execute(build, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.provider_id, "b");
        assert!(result.fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let a = Arc::new(ScriptedProvider::failing("a", network()));
        let chain = FallbackChain::new(10).with_jitter(0.0).add(spec("a", 3), a.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = chain.execute(build, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_call() {
        let a = Arc::new(ScriptedProvider::succeeding("a"));
        let chain = FallbackChain::new(10).add(spec("a", 3), a.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = chain.execute(build, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn empty_chain_returns_not_configured() {
        let chain = FallbackChain::new(10);
        assert!(chain.is_empty());
        let err = chain.execute(build, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::NotConfigured(_))));
    }
}
