//! Provider router: builds providers from config and assembles the
//! fallback chain.
//!
//! Each distinct provider id in the chain gets one shared transport; chain
//! entries pointing at the same provider with different models reuse it.

use crate::openai_compat::OpenAiCompatProvider;
use crate::resilience::FallbackChain;
use sleuth_config::AppConfig;
use sleuth_core::provider::Provider;
use std::collections::HashMap;
use std::sync::Arc;

/// Named providers, created once per process.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// List all registered provider names.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    /// Assemble the configured chain out of registered providers.
    ///
    /// Chain entries naming a provider that is not registered are skipped.
    pub fn chain(&self, config: &AppConfig) -> FallbackChain {
        config
            .provider_chain()
            .into_iter()
            .fold(FallbackChain::new(config.chain.max_total_attempts), |chain, spec| {
                match self.get(&spec.provider_id) {
                    Some(provider) => chain.add(spec, provider),
                    None => {
                        tracing::warn!(provider = %spec.provider_id, "Skipping unknown provider in chain");
                        chain
                    }
                }
            })
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build one transport per provider named in the chain.
pub fn build_from_config(config: &AppConfig) -> ProviderRouter {
    let mut router = ProviderRouter::new();

    for spec in config.provider_chain() {
        let name = spec.provider_id;
        if router.get(&name).is_some() {
            continue;
        }

        let provider_config = config.providers.get(&name);
        let api_key = provider_config
            .and_then(|p| p.api_key.clone())
            .or_else(|| config.api_key.clone())
            .unwrap_or_default();
        let base_url = provider_config
            .and_then(|p| p.api_url.clone())
            .unwrap_or_else(|| default_base_url(&name));

        let provider: Arc<dyn Provider> = Arc::new(OpenAiCompatProvider::new(&name, &base_url, &api_key));
        router.register(name, provider);
    }

    router
}

/// Build the fallback chain straight from configuration.
pub fn build_chain_from_config(config: &AppConfig) -> FallbackChain {
    build_from_config(config).chain(config)
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "anthropic" => "https://api.anthropic.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}
