//! # Sleuth Core
//!
//! Domain types, traits, and error definitions for the Sleuth code-analysis
//! agent. This crate has **no transport or storage dependencies**: it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator of the agent loop is defined as a trait here:
//! - [`Provider`]: streaming model completions
//! - [`Tool`]: native tools, resolved by name through a [`ToolRegistry`]
//! - [`BridgeRegistry`]: tools imported from an external tool server
//! - [`HistoryStore`]: durable per-session message history
//!
//! Implementations live in their respective crates, so tests can swap in
//! scripted providers and in-memory stores.

pub mod bridge;
pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use bridge::BridgeRegistry;
pub use error::{Error, ProviderError, Result, StorageError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use history::HistoryStore;
pub use message::{ContentPart, Conversation, Message, MessageContent, MessageKind, Role, SessionId};
pub use provider::{
    Provider, ProviderRequest, ProviderResponse, ProviderSpec, RetryConfig, StreamChunk, Usage,
};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
