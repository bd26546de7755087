//! Sleuth CLI: the main entry point.
//!
//! Commands:
//! - `ask`: Answer one question about the codebase
//! - `chat`: Interactive session with persistent history
//! - `config`: Show, locate, or initialise the configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::AgentArgs;

#[derive(Parser)]
#[command(
    name = "sleuth",
    about = "Sleuth — an AI agent that answers questions about your codebase",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.sleuth/config.toml)
    #[arg(short, long, global = true, env = "SLEUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question
    Ask {
        /// The question
        question: String,

        /// JSON schema file the answer must conform to
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Image to attach (file path or URL); repeatable
        #[arg(long = "image")]
        images: Vec<String>,

        /// Print the answer with its metadata as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        agent: AgentArgs,
    },

    /// Interactive chat; `/clear` forgets the session, `/exit` quits
    Chat {
        #[command(flatten)]
        agent: AgentArgs,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (keys redacted)
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries only answers
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Ask {
            question,
            schema,
            images,
            json,
            agent,
        } => {
            commands::ask::run(
                config_path,
                &agent,
                commands::ask::AskOptions {
                    question,
                    schema,
                    images,
                    json,
                },
                cli.verbose,
            )
            .await?
        }
        Commands::Chat { agent } => commands::chat::run(config_path, &agent, cli.verbose).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path)?,
            ConfigAction::Init { force } => commands::config_cmd::init(config_path, force)?,
            ConfigAction::Path => commands::config_cmd::path(config_path),
        },
    }

    Ok(())
}
