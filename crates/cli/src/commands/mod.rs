//! Subcommands and the startup wiring they share.

pub mod ask;
pub mod chat;
pub mod config_cmd;

use anyhow::{Context, bail};
use base64::Engine;
use clap::Args;
use sleuth_agent::AgentLoop;
use sleuth_config::AppConfig;
use sleuth_core::event::{DomainEvent, EventBus};
use sleuth_providers::build_chain_from_config;
use sleuth_tools::{ToolOptions, default_registry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Flags that override the configuration for one run.
#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// First provider of the fallback chain
    #[arg(long)]
    pub provider: Option<String>,

    /// Model for the first provider
    #[arg(long)]
    pub model: Option<String>,

    /// Iteration budget per question
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Prompt profile: code-explorer, engineer, code-review, architect
    #[arg(long)]
    pub profile: Option<String>,

    /// Directory the tools operate in (default: current directory)
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Session id, to continue an earlier conversation
    #[arg(long)]
    pub session: Option<String>,

    /// Disable sub-agent delegation
    #[arg(long)]
    pub no_delegation: bool,

    /// Register the create and edit tools
    #[arg(long)]
    pub allow_edit: bool,

    /// Register the bash tool
    #[arg(long)]
    pub enable_bash: bool,
}

/// Load the config file, apply environment and flag overrides, validate.
pub fn load_config(path: Option<&Path>, args: &AgentArgs) -> anyhow::Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    }
    .context("Failed to load config")?;

    apply_overrides(&mut config, args);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn apply_overrides(config: &mut AppConfig, args: &AgentArgs) {
    if let Some(provider) = &args.provider {
        config.default_provider = provider.clone();
    }
    if let Some(model) = &args.model {
        config.default_model = model.clone();
    }
    if let Some(max) = args.max_iterations {
        config.agent.max_iterations = max;
    }
    if let Some(profile) = &args.profile {
        config.agent.profile = profile.clone();
    }
    if let Some(workspace) = &args.workspace {
        config.agent.workspace = Some(workspace.clone());
    }
    if args.no_delegation {
        config.delegation.enabled = false;
    }
    config.agent.allow_edit |= args.allow_edit;
    config.agent.enable_bash |= args.enable_bash;
}

/// Tools, fallback chain, and agent, built once from `config`.
pub fn build_agent(config: &AppConfig, event_bus: Arc<EventBus>) -> anyhow::Result<AgentLoop> {
    if !config.has_api_key() {
        warn!(
            "No API key configured; set SLEUTH_API_KEY, OPENROUTER_API_KEY, or OPENAI_API_KEY, \
             or add api_key to {}",
            AppConfig::config_dir().join("config.toml").display()
        );
    }

    let workspace = match &config.agent.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let tools = default_registry(&ToolOptions {
        workspace,
        allow_edit: config.agent.allow_edit,
        enable_bash: config.agent.enable_bash,
        allowed_commands: config.agent.allowed_commands.clone(),
    })
    .context("Failed to set up tools")?;

    let chain = build_chain_from_config(config);
    if chain.is_empty() {
        bail!("The fallback chain has no usable provider");
    }
    debug!(
        providers = chain.len(),
        tools = tools.len(),
        profile = %config.agent.profile,
        "Agent assembled"
    );

    Ok(AgentLoop::from_config(config, Arc::new(chain), tools, event_bus)?)
}

/// A token cancelled on Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Interrupted, cancelling...");
            trigger.cancel();
        }
    });
    token
}

/// Log every domain event at debug level.
pub fn log_events(event_bus: &EventBus) {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn log_event(event: &DomainEvent) {
    match event {
        DomainEvent::ResponseGenerated { iteration, provider, model, tokens_used, .. } => {
            debug!(iteration, provider = %provider, model = %model, tokens_used, "Model responded");
        }
        DomainEvent::ToolExecuted { tool_name, bridged, success, duration_ms, .. } => {
            debug!(tool = %tool_name, bridged, success, duration_ms, "Tool finished");
        }
        DomainEvent::FallbackUsed { provider, model, attempts, .. } => {
            debug!(provider = %provider, model = %model, attempts, "Fallback provider answered");
        }
        DomainEvent::HistoryCompacted { original_count, compacted_count, tokens_saved, .. } => {
            debug!(original_count, compacted_count, tokens_saved, "History compacted");
        }
        DomainEvent::DelegationFinished { task_id, outcome, duration_ms, .. } => {
            debug!(task_id = %task_id, outcome = %outcome, duration_ms, "Delegation finished");
        }
        DomainEvent::IterationBudgetExhausted { budget, .. } => {
            debug!(budget, "Iteration budget exhausted");
        }
    }
}

/// Turn an `--image` argument into a URL the provider accepts.
///
/// URLs pass through; files become base64 `data:` URLs.
pub fn image_url(arg: &str) -> anyhow::Result<String> {
    if arg.starts_with("http://") || arg.starts_with("https://") || arg.starts_with("data:") {
        return Ok(arg.to_string());
    }

    let path = Path::new(arg);
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => bail!("Unsupported image type: {arg} (expected png, jpg, gif, or webp)"),
    };
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read image {arg}"))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}
