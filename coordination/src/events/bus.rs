//! Event bus for audit events
//!
//! Tokio broadcast channel for live subscribers plus a bounded in-memory
//! history for late readers (dashboards polling the read API).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{AuditEvent, AuditEventType};
use super::AuditSink;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Events retained for history queries
const DEFAULT_HISTORY_CAPACITY: usize = 4096;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast bus with bounded history
pub struct EventBus {
    sender: broadcast::Sender<AuditEvent>,
    history: Mutex<VecDeque<AuditEvent>>,
    history_capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the default history size
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create an event bus retaining at most `capacity` events
    pub fn with_history_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(VecDeque::new()),
            history_capacity: capacity,
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to history and all subscribers
    pub fn publish(&self, event: AuditEvent) {
        let event_type = event.event_type;

        if let Ok(mut history) = self.history.lock() {
            if self.history_capacity > 0 {
                if history.len() >= self.history_capacity {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        // Broadcast to subscribers (ignore if no receivers)
        match self.sender.send(event) {
            Ok(count) => debug!(%event_type, receivers = count, "Event published"),
            Err(_) => debug!(%event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Snapshot of retained events, oldest first
    pub fn history(&self) -> Vec<AuditEvent> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained events matching `filter`, oldest first
    pub fn query(&self, filter: &EventFilter) -> Vec<AuditEvent> {
        self.history
            .lock()
            .map(|h| h.iter().filter(|e| filter.matches(e)).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for EventBus {
    fn emit(&self, event: AuditEvent) {
        self.publish(event);
    }
}

/// Event filter for history queries
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub workflow_id: Option<String>,
    pub task_id: Option<String>,
    pub event_types: Option<Vec<AuditEventType>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by workflow ID
    pub fn workflow(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Some(workflow_id.to_string());
        self
    }

    /// Filter by task ID
    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<AuditEventType>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref wid) = self.workflow_id {
            if &event.workflow_id != wid {
                return false;
            }
        }

        if let Some(ref tid) = self.task_id {
            if event.task_id.as_ref() != Some(tid) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }

        true
    }
}
