//! No-op history store: disables session history entirely.

use async_trait::async_trait;
use sleuth_core::error::StorageError;
use sleuth_core::history::HistoryStore;
use sleuth_core::message::{Message, SessionId};

/// A history store that saves nothing and always loads empty history.
pub struct NoopStore;

#[async_trait]
impl HistoryStore for NoopStore {
    fn name(&self) -> &str {
        "none"
    }

    async fn load_history(&self, _session: &SessionId) -> Result<Vec<Message>, StorageError> {
        Ok(Vec::new())
    }

    async fn save_message(&self, _session: &SessionId, _message: &Message) -> Result<(), StorageError> {
        Ok(())
    }

    async fn clear_history(&self, _session: &SessionId) -> Result<(), StorageError> {
        Ok(())
    }
}
