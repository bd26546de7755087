//! Built-in tool implementations for Sleuth.
//!
//! Tools give the agent its view of a codebase: search it, list it,
//! read ranges out of it, and (when enabled) change it or run commands
//! in it. Every path argument is confined to the configured workspace.

pub mod bash;
pub mod create;
pub mod edit;
pub mod extract;
pub mod list_files;
pub mod search;
pub mod workspace;

use sleuth_core::error::ToolError;
use sleuth_core::tool::ToolRegistry;
use std::path::PathBuf;
use std::sync::Arc;

pub use workspace::Workspace;

/// Which built-in tools to expose and where they operate.
#[derive(Debug, Clone)]
pub struct ToolOptions {
    pub workspace: PathBuf,
    /// Register `create` and `edit`.
    pub allow_edit: bool,
    /// Register `bash`.
    pub enable_bash: bool,
    /// Commands `bash` may run. Empty allows everything.
    pub allowed_commands: Vec<String>,
}

impl ToolOptions {
    /// Read-only toolset rooted at `workspace`.
    pub fn read_only(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            allow_edit: false,
            enable_bash: false,
            allowed_commands: Vec::new(),
        }
    }
}

/// Create a tool registry with the built-in tools `options` enables.
///
/// `search`, `extract`, and `list_files` are always present.
pub fn default_registry(options: &ToolOptions) -> Result<ToolRegistry, ToolError> {
    let workspace = Workspace::new(&options.workspace)?;
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(search::SearchTool::new(workspace.clone())));
    registry.register(Arc::new(extract::ExtractTool::new(workspace.clone())));
    registry.register(Arc::new(list_files::ListFilesTool::new(workspace.clone())));

    if options.allow_edit {
        registry.register(Arc::new(create::CreateTool::new(workspace.clone())));
        registry.register(Arc::new(edit::EditTool::new(workspace.clone())));
    }
    if options.enable_bash {
        registry.register(Arc::new(bash::BashTool::new(
            workspace,
            options.allowed_commands.clone(),
        )));
    }

    Ok(registry)
}
