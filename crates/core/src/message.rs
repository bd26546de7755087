//! Message and Conversation domain types.
//!
//! These are the core value objects that flow through the entire system:
//! caller asks a question → the loop appends assistant/user pairs → the
//! provider sees the ordered list on every round.
//!
//! Roles alternate `user`/`assistant` after the leading system message. Tool
//! results, re-prompt reminders, and the last-chance warning are all carried
//! in `user`-role messages; [`MessageKind`] records which is which.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session (one persisted conversation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (profile, tool catalogue)
    System,
    /// The caller, or a tool result / reminder injected on its behalf
    User,
    /// The model
    Assistant,
}

/// What a message represents inside the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A genuine turn: caller question or model reply.
    #[default]
    Normal,
    /// `<tool_result>` block answering the preceding assistant tool call.
    ToolResult,
    /// Re-prompt sent after a reply that contained no recognisable call.
    Reminder,
    /// Assistant message that carried the completion signal.
    Completion,
}

impl MessageKind {
    fn is_normal(&self) -> bool {
        *self == MessageKind::Normal
    }
}

/// One part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// An image, as an `https://` URL or a `data:` URL.
    Image { url: String },
}

/// Message body: plain text, or an ordered list of text/image parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// All text of this content, parts joined by newlines.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(self, MessageContent::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Text or multi-part content
    pub content: MessageContent,

    /// Loop-level classification
    #[serde(default, skip_serializing_if = "MessageKind::is_normal")]
    pub kind: MessageKind,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (provider info, tool name, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn new(role: Role, content: MessageContent, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            kind,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(content.into()), MessageKind::Normal)
    }

    /// Create a user message carrying images after the text.
    pub fn user_with_images(text: impl Into<String>, image_urls: Vec<String>) -> Self {
        if image_urls.is_empty() {
            return Self::user(text);
        }
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(image_urls.into_iter().map(|url| ContentPart::Image { url }));
        Self::new(Role::User, MessageContent::Parts(parts), MessageKind::Normal)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(content.into()), MessageKind::Normal)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, MessageContent::Text(content.into()), MessageKind::Normal)
    }

    /// Create a tool result message (user role, wrapped in `<tool_result>`).
    pub fn tool_result(output: impl AsRef<str>) -> Self {
        Self::new(
            Role::User,
            MessageContent::Text(format!("<tool_result>\n{}\n</tool_result>", output.as_ref())),
            MessageKind::ToolResult,
        )
    }

    /// Create a re-prompt reminder (user role).
    pub fn reminder(content: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(content.into()), MessageKind::Reminder)
    }

    /// Replace the kind of this message.
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// The text of this message (image parts are skipped).
    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Append text to the message, keeping any image parts intact.
    pub fn append_text(&mut self, extra: &str) {
        match &mut self.content {
            MessageContent::Text(t) => {
                t.push_str(extra);
            }
            MessageContent::Parts(parts) => {
                if let Some(ContentPart::Text { text }) = parts
                    .iter_mut()
                    .rev()
                    .find(|p| matches!(p, ContentPart::Text { .. }))
                {
                    text.push_str(extra);
                } else {
                    parts.push(ContentPart::Text {
                        text: extra.to_string(),
                    });
                }
            }
        }
    }

    /// Whether this is a tool result, by kind or by the wire wrapper of
    /// messages persisted before kinds existed.
    pub fn is_tool_result(&self) -> bool {
        self.kind == MessageKind::ToolResult
            || (self.role == Role::User && self.text().trim_start().starts_with("<tool_result>"))
    }

    /// A genuine new turn from the caller: user role, not a tool result or reminder.
    pub fn is_turn_start(&self) -> bool {
        self.role == Role::User && self.kind == MessageKind::Normal && !self.is_tool_result()
    }
}

/// A conversation is an ordered sequence of messages with shared context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Session this conversation belongs to
    pub id: SessionId,

    /// Ordered messages
    pub messages: Vec<Message>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a message to the conversation.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Get the total token count estimate (rough: 4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.text().len() / 4).sum()
    }

    /// Whether no two consecutive messages (after the leading system
    /// message) share a role.
    pub fn is_alternating(&self) -> bool {
        is_alternating(&self.messages)
    }
}

/// Whether no two consecutive messages, excluding a leading system message,
/// share a role.
pub fn is_alternating(messages: &[Message]) -> bool {
    let body = match messages.first() {
        Some(m) if m.role == Role::System => &messages[1..],
        _ => messages,
    };
    body.windows(2).all(|w| w[0].role != w[1].role)
}
