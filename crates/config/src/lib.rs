//! Configuration loading, validation, and management for Sleuth.
//!
//! Loads configuration from `~/.sleuth/config.toml` with environment
//! variable overrides. Everything is validated once at startup; the agent
//! never re-reads ambient state mid-request.

use serde::{Deserialize, Serialize};
use sleuth_core::{ProviderSpec, RetryConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.sleuth/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// First provider of the fallback chain
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Model used with the first provider
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Retry policy applied to every chain entry without its own
    #[serde(default)]
    pub retry: RetryConfig,

    /// Chain-wide limits
    #[serde(default)]
    pub chain: ChainConfig,

    /// Providers tried, in order, after the default one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback: Vec<FallbackEntry>,

    /// Provider-specific endpoints and keys
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Sub-agent delegation settings
    #[serde(default)]
    pub delegation: DelegationConfig,

    /// Context compaction policy
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Structured-output correction settings
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Session history storage
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("retry", &self.retry)
            .field("chain", &self.chain)
            .field("fallback", &self.fallback)
            .field("providers", &self.providers)
            .field("agent", &self.agent)
            .field("delegation", &self.delegation)
            .field("compaction", &self.compaction)
            .field("schema", &self.schema)
            .field("storage", &self.storage)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

/// One extra entry of the fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub provider: String,
    pub model: String,

    /// Overrides the top-level retry policy for this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Ceiling on attempts across the whole chain
    #[serde(default = "default_max_total_attempts")]
    pub max_total_attempts: u32,
}

fn default_max_total_attempts() -> u32 {
    10
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_total_attempts: default_max_total_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Iteration budget per `answer()` call
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// History cap, system message included
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,

    /// Prompt profile: code-explorer, engineer, code-review, architect
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Tool output longer than this is truncated
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,

    /// Register the `create` and `edit` tools
    #[serde(default)]
    pub allow_edit: bool,

    /// Register the `bash` tool
    #[serde(default)]
    pub enable_bash: bool,

    /// Commands `bash` may run (first word of the command line)
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Root directory the file tools are confined to (defaults to cwd)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

fn default_max_iterations() -> u32 {
    30
}
fn default_max_history_messages() -> usize {
    100
}
fn default_profile() -> String {
    "code-explorer".into()
}
fn default_max_tool_output_chars() -> usize {
    100_000
}
fn default_allowed_commands() -> Vec<String> {
    ["git", "ls", "cat", "grep", "find", "wc", "head", "tail", "cargo"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_history_messages: default_max_history_messages(),
            profile: default_profile(),
            max_tool_output_chars: default_max_tool_output_chars(),
            allow_edit: false,
            enable_bash: false,
            allowed_commands: default_allowed_commands(),
            workspace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Global ceiling on running sub-agents
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Ceiling per parent session
    #[serde(default = "default_max_per_session")]
    pub max_per_session: usize,

    /// Queue saturated submissions instead of rejecting them
    #[serde(default = "default_true")]
    pub queue_enabled: bool,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Deadline per task, queue wait included
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Iteration budget of each sub-agent
    #[serde(default = "default_subagent_iterations")]
    pub max_iterations: u32,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_max_per_session() -> usize {
    3
}
fn default_queue_capacity() -> usize {
    10
}
/// Upper bound for `delegation.timeout_secs` (one day).
pub const MAX_DELEGATION_TIMEOUT_SECS: u64 = 86_400;

fn default_timeout_secs() -> u64 {
    300
}
fn default_subagent_iterations() -> u32 {
    30
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: default_max_concurrent(),
            max_per_session: default_max_per_session(),
            queue_enabled: true,
            queue_capacity: default_queue_capacity(),
            timeout_secs: default_timeout_secs(),
            max_iterations: default_subagent_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Never compact the most recent segment
    #[serde(default = "default_true")]
    pub keep_last_segment: bool,

    /// Number of trailing segments left untouched
    #[serde(default = "default_min_segments_to_keep")]
    pub min_segments_to_keep: usize,
}

fn default_min_segments_to_keep() -> usize {
    1
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            keep_last_segment: true,
            min_segments_to_keep: default_min_segments_to_keep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Correction rounds after the first formatting attempt
    #[serde(default = "default_max_corrections")]
    pub max_corrections: u32,
}

fn default_max_corrections() -> u32 {
    3
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            max_corrections: default_max_corrections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "file", "memory", or "none"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Directory for the file backend (defaults to ~/.sleuth/sessions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_storage_backend() -> String {
    "file".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.sleuth/config.toml).
    ///
    /// Environment overrides, in priority order for the key:
    /// - `SLEUTH_API_KEY`
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    ///
    /// plus `SLEUTH_PROVIDER`, `SLEUTH_MODEL`, and `SLEUTH_MAX_ITERATIONS`.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from a file, then apply environment overrides and validate.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if self.api_key.is_none() {
            self.api_key = lookup("SLEUTH_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }

        if let Some(provider) = lookup("SLEUTH_PROVIDER") {
            self.default_provider = provider;
        }

        if let Some(model) = lookup("SLEUTH_MODEL") {
            self.default_model = model;
        }

        if let Some(raw) = lookup("SLEUTH_MAX_ITERATIONS") {
            self.agent.max_iterations = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "SLEUTH_MAX_ITERATIONS must be a positive integer, got {raw:?}"
                ))
            })?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".sleuth")
    }

    /// Directory of the file history backend.
    pub fn sessions_dir(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("sessions"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.agent.max_history_messages < 2 {
            return Err(ConfigError::ValidationError(
                "agent.max_history_messages must be at least 2".into(),
            ));
        }

        for retry in std::iter::once(&self.retry).chain(self.fallback.iter().filter_map(|f| f.retry.as_ref())) {
            if retry.backoff_factor < 1.0 {
                return Err(ConfigError::ValidationError(
                    "retry.backoff_factor must be >= 1.0".into(),
                ));
            }
            if retry.max_delay_ms < retry.initial_delay_ms {
                return Err(ConfigError::ValidationError(
                    "retry.max_delay_ms must be >= retry.initial_delay_ms".into(),
                ));
            }
        }

        if self.chain.max_total_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "chain.max_total_attempts must be at least 1".into(),
            ));
        }

        if self.delegation.max_concurrent == 0 || self.delegation.max_per_session == 0 {
            return Err(ConfigError::ValidationError(
                "delegation ceilings must be at least 1".into(),
            ));
        }

        if !(1..=MAX_DELEGATION_TIMEOUT_SECS).contains(&self.delegation.timeout_secs) {
            return Err(ConfigError::ValidationError(format!(
                "delegation.timeout_secs must be between 1 and {MAX_DELEGATION_TIMEOUT_SECS}"
            )));
        }

        if self.schema.max_corrections == 0 {
            return Err(ConfigError::ValidationError(
                "schema.max_corrections must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// The ordered fallback chain: the default provider first, then every
    /// `[[fallback]]` entry.
    pub fn provider_chain(&self) -> Vec<ProviderSpec> {
        let mut chain = vec![
            ProviderSpec::new(&self.default_provider, &self.default_model).with_retry(self.retry.clone()),
        ];
        chain.extend(self.fallback.iter().map(|entry| {
            ProviderSpec::new(&entry.provider, &entry.model)
                .with_retry(entry.retry.clone().unwrap_or_else(|| self.retry.clone()))
        }));
        chain
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            retry: RetryConfig::default(),
            chain: ChainConfig::default(),
            fallback: vec![],
            providers: HashMap::new(),
            agent: AgentConfig::default(),
            delegation: DelegationConfig::default(),
            compaction: CompactionConfig::default(),
            schema: SchemaConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for sleuth_core::Error {
    fn from(e: ConfigError) -> Self {
        sleuth_core::Error::Config {
            message: e.to_string(),
        }
    }
}
