//! Tiergate coordination core
//!
//! Orchestrates LLM agents arranged in four tiers and gates every handoff
//! between them:
//! - Workflow engine: decomposition, phase machine, bounded retries and
//!   escalation suspension
//! - Cost circuit breaker: per-workflow spend guard that never un-trips
//! - Compression gate: token budget per tier pair with one auto-route pass
//! - Synthesis input validator: required fields plus a loop-exhaustion bound
//! - Judge panel: risk-sized persona panel, verdict aggregation, escalation
//!
//! # Tiers
//!
//! | Level | Tier         | Default model  | Phase     |
//! |-------|--------------|----------------|-----------|
//! | 0     | Orchestrator | claude-opus    | Planning  |
//! | 1     | Strategic    | claude-opus    | Critique  |
//! | 2     | Analytical   | claude-sonnet  | Synthesis |
//! | 3     | Execution    | claude-haiku   | Research  |
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiergate_coordination::{EventBus, PipelineConfig, WorkflowEngine};
//! # use tiergate_coordination::SharedInvoker;
//! # async fn demo(invoker: SharedInvoker) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WorkflowEngine::new(PipelineConfig::default(), invoker, Arc::new(EventBus::new()))?;
//! let wf = engine.create_workflow("- pricing\n- support SLAs", 2.0).await?;
//! let done = engine.run_to_completion(&wf.id).await?;
//! println!("{:?}", done.final_output);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod gates;
pub mod invoke;
pub mod oracle;
pub mod panel;
pub mod tier;
pub mod validation;
pub mod workflow;

pub use breaker::{BreakerError, BreakerSnapshot, BreakerState, CostCircuitBreaker, TripCause};
pub use config::{ConfigError, EngineConfig, PipelineConfig, PricingTable};
pub use error::{EngineError, FailureKind};
pub use events::{
    AuditEvent, AuditEventType, AuditSink, EventBus, EventFilter, FanoutSink, JsonlAuditLog,
    NullSink, SharedSink,
};
pub use gates::{
    BudgetMatrix, CompressionGate, GateAction, GateDecision, GateError, PanelSelection,
    PanelSizeSelector, SynthesisInputValidator, SynthesisValidationState, TaskMetadata,
    ValidationAction,
};
pub use invoke::{AgentInvoker, AgentResponse, InvocationError, InvocationRequest, SharedInvoker};
pub use oracle::{EstimateConfidence, TieredTokenOracle, TokenBudgetOracle, TokenEstimate};
pub use panel::{
    AggregatedVerdict, EscalationReason, EscalationRequest, EscalationStatus, EscalationView,
    JudgePanel, JudgePersona, ResolutionDecision, VerdictParser,
};
pub use tier::Tier;
pub use validation::{Handoff, StackOutcome, ValidationLayer, ValidationLayerStack};
pub use workflow::{
    AdvanceOutcome, Phase, Task, TaskStatus, WorkflowEngine, WorkflowRequest, WorkflowSnapshot,
};
