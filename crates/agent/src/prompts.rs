//! Prompt profiles and the fixed texts the loop injects.
//!
//! The system prompt is a profile preamble followed by a tool catalogue
//! rendered from the permitted tools, so the model only ever sees the tags
//! it may use.

use crate::protocol::{COMPLETION_TAG, REUSE_TAG, ToolSignature};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// System prompt preamble selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Read-only codebase exploration.
    #[default]
    CodeExplorer,
    /// Exploration plus edits and commands.
    Engineer,
    CodeReview,
    Architect,
    /// Delegated sub-task; no nesting.
    Subagent,
}

impl Profile {
    pub fn name(self) -> &'static str {
        match self {
            Profile::CodeExplorer => "code-explorer",
            Profile::Engineer => "engineer",
            Profile::CodeReview => "code-review",
            Profile::Architect => "architect",
            Profile::Subagent => "subagent",
        }
    }

    fn preamble(self) -> &'static str {
        match self {
            Profile::CodeExplorer => {
                "You are Sleuth, an expert code explorer. You answer questions about a codebase \
                 by searching it and reading the relevant code. Ground every claim in code you \
                 have actually read, and cite files with line numbers."
            }
            Profile::Engineer => {
                "You are Sleuth, a senior software engineer working inside a codebase. Investigate \
                 before changing anything, make the smallest change that solves the task, and \
                 verify your work where tools allow it."
            }
            Profile::CodeReview => {
                "You are Sleuth, a meticulous code reviewer. Look for bugs, unsafe assumptions, \
                 missing error handling, and unclear code. Report findings with file and line \
                 references, most severe first."
            }
            Profile::Architect => {
                "You are Sleuth, a software architect. Explain how the system is structured: its \
                 components, their responsibilities, how data flows between them, and the \
                 trade-offs visible in the code."
            }
            Profile::Subagent => {
                "You are a focused research assistant handling one delegated sub-task. Investigate \
                 only what the task asks and report concrete findings with file references. You \
                 cannot delegate further."
            }
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "code-explorer" | "explorer" => Ok(Profile::CodeExplorer),
            "engineer" => Ok(Profile::Engineer),
            "code-review" | "review" => Ok(Profile::CodeReview),
            "architect" => Ok(Profile::Architect),
            "subagent" => Ok(Profile::Subagent),
            other => Err(format!("unknown profile '{other}'")),
        }
    }
}

/// Full system prompt: preamble, protocol rules, and tool catalogue.
pub fn system_prompt(profile: Profile, tools: &[ToolSignature], bridged: &BTreeSet<String>) -> String {
    let mut prompt = String::from(profile.preamble());
    prompt.push_str(
        "\n\n# Tool use\n\n\
         Each reply must contain exactly one tool call, written as XML-style tags. \
         You may think first inside <thinking></thinking>. The tool result arrives in the \
         next message inside <tool_result></tool_result>.\n\n\
         <tool_name>\n<parameter_name>value</parameter_name>\n</tool_name>\n\n\
         Close every tag you open. Unclosed tags are ignored.\n",
    );

    prompt.push_str("\n# Tools\n");
    for tool in tools {
        prompt.push_str(&render_tool(tool));
    }
    for name in bridged {
        if tools.iter().any(|t| &t.name == name) {
            continue;
        }
        prompt.push_str(&format!(
            "\n## {name}\nExternal tool. Pass arguments as a JSON object:\n<{name}>\n<params>{{\"key\": \"value\"}}</params>\n</{name}>\n"
        ));
    }

    prompt.push_str(&format!(
        "\n## {COMPLETION_TAG}\nUse when you have the final answer. The result is returned to the user as is.\n\
         <{COMPLETION_TAG}>\n<result>\nyour complete answer\n</result>\n</{COMPLETION_TAG}>\n\n\
         If your previous message already contained the full answer, reply with <{REUSE_TAG}/> instead.\n"
    ));
    prompt
}

fn render_tool(tool: &ToolSignature) -> String {
    let mut out = format!("\n## {}\n{}\nParameters:\n", tool.name, tool.description);
    let properties = tool.schema.get("properties").and_then(Value::as_object);
    match properties {
        Some(props) if !props.is_empty() => {
            for (name, spec) in props {
                let kind = spec.get("type").and_then(Value::as_str).unwrap_or("string");
                let required = if tool.is_required(name) { "required" } else { "optional" };
                let description = spec.get("description").and_then(Value::as_str).unwrap_or("");
                out.push_str(&format!("- {name} ({kind}, {required}): {description}\n"));
            }
        }
        _ => out.push_str("(none)\n"),
    }

    out.push_str("Usage:\n");
    out.push_str(&format!("<{}>\n", tool.name));
    for (name, _) in tool.parameters() {
        if tool.is_required(name) {
            out.push_str(&format!("<{name}>...</{name}>\n"));
        }
    }
    out.push_str(&format!("</{}>\n", tool.name));
    out
}

/// Re-prompt after a reply with no recognisable tool call.
///
/// With a schema the model is also told what shape the final answer must take.
pub fn reminder(schema: Option<&Value>) -> String {
    let mut text = String::from(
        "Your last reply did not contain a valid tool call. Reply with exactly one tool call \
         using the XML tag format from the instructions, with every tag closed. If you have the \
         final answer, use <attempt_completion><result>...</result></attempt_completion>.",
    );
    if let Some(schema) = schema {
        text.push_str(&format!(
            "\n\nThe final answer must be JSON data matching this schema (data, not the schema itself):\n{}",
            pretty(schema)
        ));
    }
    text
}

/// Appended to the last user message when one round remains.
pub fn last_chance() -> &'static str {
    "\n\nThis is your final iteration. Do not call any more tools. Give your best answer now \
     with <attempt_completion><result>...</result></attempt_completion>, stating what is \
     still uncertain."
}

/// Returned when the budget runs out with nothing usable to show.
pub fn incomplete_notice(budget: u32) -> String {
    format!(
        "I could not finish within {budget} iterations and have no answer to report. \
         Try a narrower question or a larger iteration budget."
    )
}

/// System prompt for the isolated formatting conversation.
pub fn formatter_system() -> &'static str {
    "You convert answers into JSON data. Reply with only the JSON value: no prose, no \
     markdown fences, no comments. Produce data that conforms to the schema you are given; \
     never reply with the schema itself."
}

pub fn format_request(raw_answer: &str, schema: &Value) -> String {
    format!(
        "Restate the following answer as JSON data conforming to the schema.\n\n\
         Schema:\n{}\n\nAnswer:\n{raw_answer}",
        pretty(schema)
    )
}

/// Targeted follow-up after an invalid formatting attempt.
pub fn correction(error: &str, echoed_schema: bool) -> String {
    if echoed_schema {
        format!(
            "You returned the schema definition instead of data. Return a JSON value that \
             conforms to the schema, filled in with the actual answer. ({error})"
        )
    } else {
        format!("That JSON is invalid: {error}. Fix this and reply with only the corrected JSON.")
    }
}

/// Task message handed to a sub-agent.
pub fn delegation_task(task: &str) -> String {
    format!(
        "Delegated task:\n{task}\n\nWhen finished, report your findings with \
         <attempt_completion><result>...</result></attempt_completion>."
    )
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
