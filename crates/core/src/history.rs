//! History store trait: durable per-session message history.
//!
//! The agent loop touches storage only at request boundaries: it loads the
//! prior history when a request starts and saves the new user message plus
//! the final answer when it ends. Every failure here is logged by the caller
//! and treated as empty history, never as a fatal error.

use crate::error::StorageError;
use crate::message::{Message, SessionId};
use async_trait::async_trait;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The name of this backend (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Ordered messages previously saved for the session.
    async fn load_history(&self, session: &SessionId) -> std::result::Result<Vec<Message>, StorageError>;

    /// Append one message to the session's history.
    async fn save_message(
        &self,
        session: &SessionId,
        message: &Message,
    ) -> std::result::Result<(), StorageError>;

    /// Forget everything saved for the session.
    async fn clear_history(&self, session: &SessionId) -> std::result::Result<(), StorageError>;
}
