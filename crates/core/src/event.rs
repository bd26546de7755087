//! Domain event system: decoupled observation of the agent loop.
//!
//! The loop, the fallback chain, and the delegation scheduler publish events
//! as they work. The CLI subscribes for verbose progress output; tests
//! subscribe to assert on what happened without scraping logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// The model produced a response for one round
    ResponseGenerated {
        session_id: String,
        iteration: u32,
        provider: String,
        model: String,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A native or bridged tool was executed
    ToolExecuted {
        tool_name: String,
        bridged: bool,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A provider other than the first in the chain answered
    FallbackUsed {
        provider: String,
        model: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// History was compacted after a context overflow
    HistoryCompacted {
        session_id: String,
        original_count: usize,
        compacted_count: usize,
        tokens_saved: usize,
        timestamp: DateTime<Utc>,
    },

    /// A delegated sub-agent task reached a terminal state
    DelegationFinished {
        task_id: String,
        parent_session_id: String,
        outcome: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The loop ran out of iterations without a completion signal
    IterationBudgetExhausted {
        session_id: String,
        budget: u32,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
