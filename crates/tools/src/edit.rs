//! Edit tool: exact string replacement in an existing file.

use crate::workspace::Workspace;
use async_trait::async_trait;
use sleuth_core::error::ToolError;
use sleuth_core::tool::{Tool, ToolResult};

pub struct EditTool {
    workspace: Workspace,
}

impl EditTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. old_string must match exactly once unless replace_all is true."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to edit, relative to the workspace"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default: false)"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let old = arguments["old_string"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'old_string' argument".into()))?;
        let new = arguments["new_string"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'new_string' argument".into()))?;
        let replace_all = arguments["replace_all"].as_bool().unwrap_or(false);

        let resolved = self.workspace.resolve("edit", path)?;
        let shown = self.workspace.display(&resolved);

        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return Ok(ToolResult::failed(format!("Failed to read {shown}: {e}"))),
        };

        let occurrences = content.matches(old).count();
        if occurrences == 0 {
            return Ok(ToolResult::failed(format!("old_string not found in {shown}")));
        }
        if occurrences > 1 && !replace_all {
            return Ok(ToolResult::failed(format!(
                "old_string matches {occurrences} times in {shown}; add context or set replace_all"
            )));
        }

        let updated = if replace_all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        };

        match tokio::fs::write(&resolved, updated).await {
            Ok(()) => Ok(ToolResult::ok(format!(
                "Edited {shown} ({occurrences} replacement{})",
                if occurrences == 1 { "" } else { "s" }
            ))),
            Err(e) => Ok(ToolResult::failed(format!("Failed to write {shown}: {e}"))),
        }
    }
}
