//! List files tool: directory listing inside the workspace.

use crate::workspace::{Workspace, walk};
use async_trait::async_trait;
use sleuth_core::error::ToolError;
use sleuth_core::tool::{Tool, ToolResult};

const MAX_ENTRIES: usize = 1_000;

pub struct ListFilesTool {
    workspace: Workspace,
}

impl ListFilesTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories in the workspace. Directories end with '/'. Hidden and build directories are skipped."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, relative to the workspace (default: '.')"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Descend into subdirectories (default: false)"
                }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let dir = self
            .workspace
            .resolve("list_files", arguments["path"].as_str().unwrap_or("."))?;
        let recursive = arguments["recursive"].as_bool().unwrap_or(false);

        if !dir.is_dir() {
            return Ok(ToolResult::failed(format!(
                "'{}' is not a directory",
                self.workspace.display(&dir)
            )));
        }

        let walk_dir = dir.clone();
        let (entries, truncated) =
            tokio::task::spawn_blocking(move || walk(&walk_dir, recursive, MAX_ENTRIES))
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: "list_files".into(),
                    reason: e.to_string(),
                })?;

        if entries.is_empty() {
            return Ok(ToolResult::ok("(empty directory)"));
        }

        let mut lines: Vec<String> = entries
            .iter()
            .map(|e| {
                let shown = self.workspace.display(&e.path);
                if e.is_dir { format!("{shown}/") } else { shown }
            })
            .collect();
        if truncated {
            lines.push(format!("[listing truncated at {MAX_ENTRIES} entries]"));
        }
        Ok(ToolResult::ok(lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_top_level_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/bin")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        std::fs::write(dir.path().join("src/bin/cli.rs"), "").unwrap();
        let tool = ListFilesTool::new(Workspace::new(dir.path()).unwrap());

        let flat = tool.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(flat.output, "Cargo.toml\nsrc/");

        let deep = tool
            .execute(serde_json::json!({"path": "src", "recursive": true}))
            .await
            .unwrap();
        assert_eq!(deep.output, "src/bin/\nsrc/bin/cli.rs");
    }

    #[tokio::test]
    async fn file_path_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        let tool = ListFilesTool::new(Workspace::new(dir.path()).unwrap());
        let result = tool.execute(serde_json::json!({"path": "a.txt"})).await.unwrap();
        assert!(!result.success);
    }
}
