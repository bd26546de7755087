//! Extract tool: read whole files or line ranges with line numbers.
//!
//! Targets are whitespace-separated `path`, `path:LINE`, or
//! `path:START-END` specs. A single line is widened by a few lines of
//! context on either side.

use crate::workspace::Workspace;
use async_trait::async_trait;
use sleuth_core::error::ToolError;
use sleuth_core::tool::{Tool, ToolResult};

const CONTEXT_LINES: usize = 10;
const MAX_TARGETS: usize = 20;

pub struct ExtractTool {
    workspace: Workspace,
}

impl ExtractTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, PartialEq)]
struct Target {
    path: String,
    range: Option<(usize, usize)>,
}

fn parse_target(spec: &str) -> Result<Target, ToolError> {
    let invalid = || ToolError::InvalidArguments(format!("Invalid target '{spec}'"));

    let Some((path, lines)) = spec.rsplit_once(':') else {
        return Ok(Target {
            path: spec.to_string(),
            range: None,
        });
    };
    // Windows drive letters ("C:\...") have no digits after the colon
    if lines.is_empty() || !lines.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return Ok(Target {
            path: spec.to_string(),
            range: None,
        });
    }

    let range = match lines.split_once('-') {
        Some((start, end)) => {
            let start: usize = start.parse().map_err(|_| invalid())?;
            let end: usize = end.parse().map_err(|_| invalid())?;
            if start == 0 || end < start {
                return Err(invalid());
            }
            (start, end)
        }
        None => {
            let line: usize = lines.parse().map_err(|_| invalid())?;
            if line == 0 {
                return Err(invalid());
            }
            (line.saturating_sub(CONTEXT_LINES).max(1), line + CONTEXT_LINES)
        }
    };

    Ok(Target {
        path: path.to_string(),
        range: Some(range),
    })
}

fn render(content: &str, range: Option<(usize, usize)>) -> String {
    let total = content.lines().count();
    let (start, end) = range.unwrap_or((1, total.max(1)));
    let end = end.min(total);
    if start > total {
        return format!("[file has only {total} lines]");
    }
    content
        .lines()
        .enumerate()
        .skip(start - 1)
        .take(end + 1 - start)
        .map(|(i, line)| format!("{:>5} | {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for ExtractTool {
    fn name(&self) -> &str {
        "extract"
    }

    fn description(&self) -> &str {
        "Read files from the workspace with line numbers. Targets are space-separated: 'src/lib.rs', 'src/lib.rs:42' (with surrounding context), or 'src/lib.rs:10-60'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "targets": {
                    "type": "string",
                    "description": "One or more file targets separated by whitespace"
                }
            },
            "required": ["targets"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let raw = arguments["targets"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'targets' argument".into()))?;
        let targets = raw
            .split_whitespace()
            .take(MAX_TARGETS)
            .map(parse_target)
            .collect::<Result<Vec<_>, _>>()?;
        if targets.is_empty() {
            return Err(ToolError::InvalidArguments("No targets given".into()));
        }

        let mut sections = Vec::new();
        let mut failures = 0;
        for target in &targets {
            let resolved = self.workspace.resolve("extract", &target.path)?;
            let header = match target.range {
                Some((start, end)) => format!("=== {}:{start}-{end} ===", self.workspace.display(&resolved)),
                None => format!("=== {} ===", self.workspace.display(&resolved)),
            };
            match tokio::fs::read_to_string(&resolved).await {
                Ok(content) => sections.push(format!("{header}\n{}", render(&content, target.range))),
                Err(e) => {
                    failures += 1;
                    sections.push(format!("{header}\nFailed to read file: {e}"));
                }
            }
        }

        let output = sections.join("\n\n");
        if failures == targets.len() {
            Ok(ToolResult::failed(output))
        } else {
            Ok(ToolResult::ok(output))
        }
    }
}
