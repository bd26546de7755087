//! Create tool: write a new file inside the workspace.

use crate::workspace::Workspace;
use async_trait::async_trait;
use sleuth_core::error::ToolError;
use sleuth_core::tool::{Tool, ToolResult};

pub struct CreateTool {
    workspace: Workspace,
}

impl CreateTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for CreateTool {
    fn name(&self) -> &str {
        "create"
    }

    fn description(&self) -> &str {
        "Create a file with the given content. Parent directories are created. Fails if the file exists unless overwrite is true."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to create, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Full content of the new file"
                },
                "overwrite": {
                    "type": "boolean",
                    "description": "Replace an existing file (default: false)"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let content = arguments["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;
        let overwrite = arguments["overwrite"].as_bool().unwrap_or(false);

        let resolved = self.workspace.resolve("create", path)?;
        let shown = self.workspace.display(&resolved);

        if resolved.exists() && !overwrite {
            return Ok(ToolResult::failed(format!(
                "'{shown}' already exists; use edit, or set overwrite to true"
            )));
        }

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: "create".into(),
                    reason: format!("Failed to create directory: {e}"),
                })?;
        }

        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(ToolResult::ok(format!(
                "Created {shown} ({} bytes)",
                content.len()
            ))),
            Err(e) => Ok(ToolResult::failed(format!("Failed to write file: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let tool = CreateTool::new(Workspace::new(dir.path()).unwrap());
        let result = tool
            .execute(serde_json::json!({"path": "docs/notes.md", "content": "# Notes\n"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("docs/notes.md")).unwrap(),
            "# Notes\n"
        );
    }

    #[tokio::test]
    async fn refuses_to_clobber_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "original").unwrap();
        let tool = CreateTool::new(Workspace::new(dir.path()).unwrap());

        let result = tool
            .execute(serde_json::json!({"path": "keep.txt", "content": "new"}))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(std::fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "original");

        let forced = tool
            .execute(serde_json::json!({"path": "keep.txt", "content": "new", "overwrite": true}))
            .await
            .unwrap();
        assert!(forced.success);
    }
}
