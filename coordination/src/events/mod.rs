//! Append-only audit events emitted by the core.
//!
//! Every state transition, gate decision, spend record and escalation is
//! published as an [`AuditEvent`] with the stable schema
//! `{timestamp, workflow_id, task_id, event_type, payload}`. Dashboards and
//! telemetry consumers read these events; they never mutate core state.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │    Engine    │────▶│  AuditSink   │────▶│  Subscribers │
//! │   (emit)     │     │ (bus / jsonl)│     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod jsonl;
pub mod types;

use std::sync::Arc;

pub use bus::{EventBus, EventFilter, SharedEventBus};
pub use jsonl::{read_audit_log, JsonlAuditLog};
pub use types::{AuditEvent, AuditEventType};

/// Destination for audit events. Emission is fire-and-forget: sinks log
/// their own failures instead of propagating them into the pipeline.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Shared reference to a sink.
pub type SharedSink = Arc<dyn AuditSink>;

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Forwards each event to every inner sink.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for FanoutSink {
    fn emit(&self, event: AuditEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = EventBus::new().shared();
        let b = EventBus::new().shared();
        let fanout = FanoutSink::new()
            .with_sink(a.clone())
            .with_sink(b.clone())
            .with_sink(Arc::new(NullSink));
        assert_eq!(fanout.len(), 3);

        fanout.emit(AuditEvent::workflow("wf-1", AuditEventType::WorkflowCreated));
        assert_eq!(a.history().len(), 1);
        assert_eq!(b.history().len(), 1);
    }
}
