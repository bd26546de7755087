//! Bash tool: execute allowlisted commands in the workspace.
//!
//! Supports command allowlisting, workspace scoping, and timeout.

use crate::workspace::Workspace;
use async_trait::async_trait;
use sleuth_core::error::ToolError;
use sleuth_core::tool::{Tool, ToolResult};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Shell syntax an allowlist cannot vet: substitution and redirection.
const UNCHECKED_SYNTAX: &[&str] = &["$(", "`", ">", "<"];

/// Execute shell commands with safety constraints.
pub struct BashTool {
    workspace: Workspace,
    /// If non-empty, only these commands are allowed.
    allowed_commands: Vec<String>,
}

impl BashTool {
    pub fn new(workspace: Workspace, allowed_commands: Vec<String>) -> Self {
        Self {
            workspace,
            allowed_commands,
        }
    }

    /// Why `command` may not run, if it may not.
    ///
    /// Every command of a pipeline or chain must be allowlisted.
    /// Substitutions and redirects are refused outright.
    fn disallowed_command(&self, command: &str) -> Option<String> {
        if self.allowed_commands.is_empty() {
            return None; // No allowlist = all commands allowed
        }

        if let Some(token) = UNCHECKED_SYNTAX.iter().find(|t| command.contains(**t)) {
            return Some(format!("'{token}' is not allowed when commands are allowlisted"));
        }

        for segment in command.split(['|', ';', '&', '\n']) {
            let words = match shell_words::split(segment) {
                Ok(words) => words,
                Err(e) => return Some(format!("Cannot parse '{}': {e}", segment.trim())),
            };
            if let Some(base) = words.first()
                && !self.allowed_commands.iter().any(|a| a == base)
            {
                return Some(format!("Command '{base}' not in allowlist"));
            }
        }
        None
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace root and return stdout/stderr. Only allowlisted commands may run."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Kill the command after this many seconds (default: 120)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;
        let timeout_secs = arguments["timeout_secs"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, 600);

        if let Some(reason) = self.disallowed_command(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "bash".into(),
                reason,
            });
        }

        debug!(command = %command, "Executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(self.workspace.root()).kill_on_drop(true);

        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
            Ok(result) => result.map_err(|e| ToolError::ExecutionFailed {
                tool_name: "bash".into(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool_name: "bash".into(),
                    timeout_secs,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let success = output.status.success();

        let result_text = if success {
            if stderr.is_empty() {
                stdout
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            format!("[exit code: {code}]\n{stdout}\n{stderr}")
        };

        Ok(ToolResult {
            success,
            output: result_text.trim().to_string(),
            data: None,
        })
    }
}
