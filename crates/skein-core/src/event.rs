//! Events emitted by the sync pipeline for any attached observer.
//!
//! Observers (the CLI, a WebSocket façade, dashboards) subscribe through
//! [`EventBus`]; the pipeline publishes and never waits on consumers. A
//! lagging subscriber loses the oldest events rather than stalling syncs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel.
const EVENT_BUFFER: usize = 256;

/// What happened to a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Created,
    Updated,
    Deleted,
}

/// What happened to a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepAction {
    Added,
    Removed,
}

/// An observable state change in the cache pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    TaskUpdate {
        task_id: String,
        action: TaskAction,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        priority: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    DepUpdate {
        from: String,
        to: String,
        #[serde(rename = "type")]
        kind: String,
        action: DepAction,
    },
    SyncComplete {
        tasks_processed: usize,
        deps_processed: usize,
        duration_ns: u64,
    },
    BlockedCache {
        blocked_count: i64,
        ready_count: i64,
    },
    Stats {
        total: i64,
        by_status: HashMap<String, i64>,
        blocked: i64,
        ready: i64,
        in_progress: i64,
    },
}

/// Broadcast fan-out for [`Event`]s.
///
/// Cloning the bus clones the sender; all clones feed the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error only means there are no subscribers.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
