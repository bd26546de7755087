//! In-memory history store for tests and single-process sessions.

use async_trait::async_trait;
use sleuth_core::error::StorageError;
use sleuth_core::history::HistoryStore;
use sleuth_core::message::{Message, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Histories keyed by session, held behind an async `RwLock`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    sessions: Arc<RwLock<HashMap<SessionId, Vec<Message>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with at least one saved message.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load_history(&self, session: &SessionId) -> Result<Vec<Message>, StorageError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_message(&self, session: &SessionId, message: &Message) -> Result<(), StorageError> {
        self.sessions
            .write()
            .await
            .entry(session.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn clear_history(&self, session: &SessionId) -> Result<(), StorageError> {
        self.sessions.write().await.remove(session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_load_in_order() {
        let store = InMemoryStore::new();
        let session = SessionId::from("s1");
        store.save_message(&session, &Message::user("q")).await.unwrap();
        store.save_message(&session, &Message::assistant("a")).await.unwrap();

        let history = store.load_history(&session).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "q");
        assert_eq!(history[1].text(), "a");
    }

    #[tokio::test]
    async fn sessions_are_isolated_and_clearable() {
        let store = InMemoryStore::new();
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        store.save_message(&a, &Message::user("for a")).await.unwrap();
        store.save_message(&b, &Message::user("for b")).await.unwrap();
        assert_eq!(store.session_count().await, 2);

        store.clear_history(&a).await.unwrap();
        assert!(store.load_history(&a).await.unwrap().is_empty());
        assert_eq!(store.load_history(&b).await.unwrap().len(), 1);
    }
}
