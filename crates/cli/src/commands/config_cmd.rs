//! `sleuth config`: configuration management commands.

use anyhow::{Context, bail};
use sleuth_config::AppConfig;
use std::path::{Path, PathBuf};

const REDACTED: &str = "[REDACTED]";

fn config_file(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

/// Print the effective configuration as TOML, keys redacted.
pub fn show(path: Option<&Path>) -> anyhow::Result<()> {
    let config = AppConfig::load_with_env(&config_file(path)).context("Failed to load config")?;
    println!("{}", render_redacted(&config)?);
    Ok(())
}

fn render_redacted(config: &AppConfig) -> anyhow::Result<String> {
    let mut shown = config.clone();
    if shown.api_key.is_some() {
        shown.api_key = Some(REDACTED.into());
    }
    for provider in shown.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some(REDACTED.into());
        }
    }
    Ok(toml::to_string_pretty(&shown)?)
}

/// Write the default configuration file.
pub fn init(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let file = config_file(path);
    write_default(&file, force)?;
    println!("Wrote default configuration to {}", file.display());
    Ok(())
}

fn write_default(file: &Path, force: bool) -> anyhow::Result<()> {
    if file.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", file.display());
    }
    if let Some(dir) = file.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(file, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", file.display()))
}

pub fn path(path: Option<&Path>) {
    println!("{}", config_file(path).display());
}
