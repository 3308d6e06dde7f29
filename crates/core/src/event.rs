//! Domain event system — decoupled communication between bounded contexts.
//!
//! Events are published when something interesting happens in the pipeline.
//! Other components can subscribe to react without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// The router classified a query
    QueryRouted {
        strategy: String,
        partitions: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// The conflict resolver settled a pair of contradictory hits
    ConflictResolved {
        partition_a: String,
        partition_b: String,
        winner: String,
        kind: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        ok: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The fallback chain moved past a failed provider
    ProviderFellBack {
        from: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A final answer was produced
    AnswerGenerated {
        session_id: String,
        model: String,
        tokens_used: u32,
        iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Components
/// subscribe to receive all events and filter for what they care about.
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
