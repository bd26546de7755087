//! Search tool: regex search over the files of the workspace.

use crate::workspace::{Workspace, walk};
use async_trait::async_trait;
use regex_lite::{Regex, RegexBuilder};
use sleuth_core::error::ToolError;
use sleuth_core::tool::{Tool, ToolResult};
use std::path::Path;
use tracing::debug;

const DEFAULT_MAX_RESULTS: usize = 50;
const MAX_FILES: usize = 20_000;
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
const MAX_LINE_CHARS: usize = 300;

pub struct SearchTool {
    workspace: Workspace,
}

impl SearchTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

/// Matches of one search, in file then line order.
#[derive(Debug)]
struct SearchHit {
    file: String,
    line: usize,
    text: String,
}

fn search_path(
    workspace: &Workspace,
    start: &Path,
    regex: &Regex,
    max_results: usize,
) -> (Vec<SearchHit>, bool) {
    let files: Vec<_> = if start.is_file() {
        vec![start.to_path_buf()]
    } else {
        walk(start, true, MAX_FILES)
            .0
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.path)
            .collect()
    };

    let mut hits = Vec::new();
    for file in files {
        let too_big = std::fs::metadata(&file)
            .map(|m| m.len() > MAX_FILE_BYTES)
            .unwrap_or(true);
        if too_big {
            continue;
        }
        let Ok(bytes) = std::fs::read(&file) else {
            continue;
        };
        // Binary files
        if bytes.iter().take(8192).any(|b| *b == 0) {
            continue;
        }
        let content = String::from_utf8_lossy(&bytes);
        for (index, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                if hits.len() >= max_results {
                    return (hits, true);
                }
                hits.push(SearchHit {
                    file: workspace.display(&file),
                    line: index + 1,
                    text: line.trim().chars().take(MAX_LINE_CHARS).collect(),
                });
            }
        }
    }
    (hits, false)
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search file contents in the workspace with a regular expression. Returns matching lines as path:line: text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search, relative to the workspace (default: whole workspace)"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Match case exactly (default: false)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of matching lines (default: 50)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let query = arguments["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;
        let case_sensitive = arguments["case_sensitive"].as_bool().unwrap_or(false);
        let max_results = arguments["max_results"]
            .as_u64()
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);
        let start = self
            .workspace
            .resolve("search", arguments["path"].as_str().unwrap_or("."))?;

        let regex = RegexBuilder::new(query)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| ToolError::InvalidArguments(format!("Invalid regex '{query}': {e}")))?;

        debug!(query = %query, path = %start.display(), "Searching workspace");

        let workspace = self.workspace.clone();
        let (hits, truncated) = tokio::task::spawn_blocking(move || {
            search_path(&workspace, &start, &regex, max_results)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: "search".into(),
            reason: e.to_string(),
        })?;

        if hits.is_empty() {
            return Ok(ToolResult::ok(format!("No matches for '{query}'")));
        }

        let mut output = hits
            .iter()
            .map(|h| format!("{}:{}: {}", h.file, h.line, h.text))
            .collect::<Vec<_>>()
            .join("\n");
        if truncated {
            output.push_str(&format!(
                "\n[results truncated at {max_results} matches; narrow the query or path]"
            ));
        }

        let files: std::collections::BTreeSet<_> = hits.iter().map(|h| h.file.clone()).collect();
        Ok(ToolResult::ok(output).with_data(serde_json::json!({
            "matches": hits.len(),
            "files": files.len(),
            "truncated": truncated,
        })))
    }
}
