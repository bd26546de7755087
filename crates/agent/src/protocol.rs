//! Tag-based tool-call protocol.
//!
//! The model never returns structured tool calls; it writes tags into its
//! reply and this module recognises them:
//!
//! ```text
//! <thinking>optional scratchpad, ignored for parsing</thinking>
//! <search>
//! <query>fn main</query>
//! <max_results>20</max_results>
//! </search>
//! ```
//!
//! - A **native** call uses the tool's name as the outer tag and one child
//!   tag per schema parameter. Values are coerced by the declared type.
//! - A **bridged** call carries `<params>{json}</params>` or generic child tags.
//! - `<attempt_completion><result>…</result></attempt_completion>` ends the loop.
//! - `<attempt_complete/>` ends the loop reusing the last plain assistant reply.
//!
//! Candidates are examined in text order and the first syntactically
//! complete one wins. An unclosed tool tag, or an unclosed tag for any
//! parameter that is present, disqualifies that candidate.

use serde_json::{Map, Value};
use sleuth_core::tool::{Tool, ToolCall};
use std::collections::BTreeSet;

/// Explicit completion with a result body.
pub const COMPLETION_TAG: &str = "attempt_completion";
/// Shorthand completion that reuses the previous answer.
pub const REUSE_TAG: &str = "attempt_complete";

const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

/// What the parser needs to know about one native tool.
#[derive(Debug, Clone)]
pub struct ToolSignature {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Declared parameter type, used to coerce tag text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Json,
}

impl ParamKind {
    fn from_schema(schema: &Value) -> Self {
        match schema.get("type").and_then(Value::as_str) {
            Some("integer") => ParamKind::Integer,
            Some("number") => ParamKind::Number,
            Some("boolean") => ParamKind::Boolean,
            Some("array") | Some("object") => ParamKind::Json,
            _ => ParamKind::String,
        }
    }
}

impl ToolSignature {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }

    pub fn from_tool(tool: &dyn Tool) -> Self {
        Self::new(tool.name(), tool.description(), tool.parameters_schema())
    }

    /// Declared parameters with their kinds.
    pub fn parameters(&self) -> Vec<(&str, ParamKind)> {
        self.schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, spec)| (name.as_str(), ParamKind::from_schema(spec)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_required(&self, param: &str) -> bool {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .is_some_and(|r| r.iter().any(|v| v.as_str() == Some(param)))
    }
}

/// How the model signalled completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Result(String),
    ReuseLast,
}

/// The single outcome of parsing one assistant reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Native(ToolCall),
    Bridged(ToolCall),
    Completion(Completion),
    NoCall,
}

/// Parse one complete assistant reply.
///
/// Native tool names shadow bridged ones. Pure: the same inputs always give
/// the same outcome.
pub fn parse_response(
    text: &str,
    tools: &[ToolSignature],
    bridged: &BTreeSet<String>,
) -> ParsedResponse {
    let text = strip_thinking(text);
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('<') {
        let start = cursor + offset;
        cursor = start + 1;

        let Some(open) = read_open_tag(&text[start..]) else {
            continue;
        };
        let body = &text[start + open.len..];

        let outcome = match open.name {
            REUSE_TAG => parse_reuse(body, open.self_closing),
            _ if open.self_closing => None,
            COMPLETION_TAG => parse_completion(body),
            name => match tools.iter().find(|t| t.name == name) {
                Some(signature) => parse_native(signature, body),
                None if bridged.contains(name) => parse_bridged(name, body),
                None => None,
            },
        };

        if let Some(outcome) = outcome {
            return outcome;
        }
    }

    ParsedResponse::NoCall
}

/// Remove every closed `<thinking>` block. An unclosed block is left as is.
pub fn strip_thinking(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find(THINKING_OPEN) {
        let Some(close) = rest[open..].find(THINKING_CLOSE) else {
            break;
        };
        out.push_str(&rest[..open]);
        rest = &rest[open + close + THINKING_CLOSE.len()..];
    }
    out.push_str(rest);
    out
}

/// Reply text with thinking blocks and tag markers removed, for best-effort answers.
pub fn strip_markup(text: &str) -> String {
    let text = strip_thinking(text);
    let mut out = String::with_capacity(text.len());
    let mut rest = text.as_str();
    while let Some(pos) = rest.find('<') {
        out.push_str(&rest[..pos]);
        let candidate = &rest[pos..];
        match markup_tag_len(candidate) {
            Some(len) => rest = &candidate[len..],
            None => {
                out.push('<');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Length of a tag marker (`<name>`, `<name/>`, `</name>`) at the start of `s`.
fn markup_tag_len(s: &str) -> Option<usize> {
    let Some(rest) = s.strip_prefix("</") else {
        return read_open_tag(s).map(|tag| tag.len);
    };
    let first = rest.chars().next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let name_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(rest.len());
    let tail = rest[name_len..].trim_start_matches([' ', '\t']);
    tail.starts_with('>').then(|| s.len() - tail.len() + 1)
}

struct OpenTag<'a> {
    name: &'a str,
    /// Bytes from `<` through the closing `>`
    len: usize,
    self_closing: bool,
}

/// Read `<name>`, `<name >`, or `<name/>` at the start of `s`.
fn read_open_tag(s: &str) -> Option<OpenTag<'_>> {
    let rest = s.strip_prefix('<')?;
    let first = rest.chars().next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let name_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(rest.len());
    let name = &rest[..name_len];
    let tail = &rest[name_len..];
    let trimmed = tail.trim_start_matches([' ', '\t']);
    let consumed = 1 + name_len + (tail.len() - trimmed.len());

    if trimmed.starts_with("/>") {
        Some(OpenTag {
            name,
            len: consumed + 2,
            self_closing: true,
        })
    } else if trimmed.starts_with('>') {
        Some(OpenTag {
            name,
            len: consumed + 1,
            self_closing: false,
        })
    } else {
        None
    }
}

/// Body of `<name>…</name>` given the text after the open tag.
fn closed_body<'a>(after_open: &'a str, name: &str) -> Option<&'a str> {
    let close = format!("</{name}>");
    after_open.find(&close).map(|end| &after_open[..end])
}

fn parse_reuse(after_open: &str, self_closing: bool) -> Option<ParsedResponse> {
    let closed = self_closing || closed_body(after_open, REUSE_TAG).is_some_and(|b| b.trim().is_empty());
    closed.then_some(ParsedResponse::Completion(Completion::ReuseLast))
}

fn parse_completion(after_open: &str) -> Option<ParsedResponse> {
    let body = closed_body(after_open, COMPLETION_TAG)?;
    let result = match body.find("<result>") {
        Some(start) => closed_body(&body[start + "<result>".len()..], "result")?,
        None => body,
    };
    let result = result.trim();
    if result.is_empty() {
        return None;
    }
    Some(ParsedResponse::Completion(Completion::Result(result.to_string())))
}

fn parse_native(signature: &ToolSignature, after_open: &str) -> Option<ParsedResponse> {
    let body = closed_body(after_open, &signature.name)?;
    let mut arguments = Map::new();

    for (param, kind) in signature.parameters() {
        let open = format!("<{param}>");
        let Some(start) = body.find(&open) else {
            continue;
        };
        let value = closed_body(&body[start + open.len()..], param)?;
        arguments.insert(param.to_string(), coerce(value, kind));
    }

    Some(ParsedResponse::Native(ToolCall::new(
        signature.name.clone(),
        Value::Object(arguments),
    )))
}

fn parse_bridged(name: &str, after_open: &str) -> Option<ParsedResponse> {
    let body = closed_body(after_open, name)?;

    let arguments = match body.find("<params>") {
        Some(start) => {
            let raw = closed_body(&body[start + "<params>".len()..], "params")?;
            match serde_json::from_str::<Value>(raw.trim()).ok()? {
                Value::Object(map) => map,
                _ => return None,
            }
        }
        None => child_tags(body)?,
    };

    Some(ParsedResponse::Bridged(ToolCall::new(name, Value::Object(arguments))))
}

/// Every `<key>value</key>` child as a string value; `None` if any is unclosed.
fn child_tags(body: &str) -> Option<Map<String, Value>> {
    let mut map = Map::new();
    let mut cursor = 0;
    while let Some(offset) = body[cursor..].find('<') {
        let start = cursor + offset;
        cursor = start + 1;
        let Some(open) = read_open_tag(&body[start..]) else {
            continue;
        };
        let after = start + open.len;
        if open.self_closing {
            map.insert(open.name.to_string(), Value::String(String::new()));
            cursor = after;
            continue;
        }
        let value = closed_body(&body[after..], open.name)?;
        map.insert(open.name.to_string(), coerce(value, ParamKind::String));
        cursor = after + value.len() + open.name.len() + 3;
    }
    Some(map)
}

fn coerce(raw: &str, kind: ParamKind) -> Value {
    let trimmed = raw.trim();
    match kind {
        ParamKind::String => Value::String(strip_edge_newlines(raw).to_string()),
        ParamKind::Integer => trimmed
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(trimmed.to_string())),
        ParamKind::Number => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(trimmed.to_string())),
        ParamKind::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(trimmed.to_string()),
        },
        ParamKind::Json => {
            serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
        }
    }
}

/// Drop one leading and one trailing line break, keeping inner whitespace exact.
fn strip_edge_newlines(raw: &str) -> &str {
    let s = raw
        .strip_prefix("\r\n")
        .or_else(|| raw.strip_prefix('\n'))
        .unwrap_or(raw);
    s.strip_suffix("\r\n")
        .or_else(|| s.strip_suffix('\n'))
        .unwrap_or(s)
}
