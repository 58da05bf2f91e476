//! Workflow and task entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state_machine::{PhaseMachine, TransitionRecord};
use crate::breaker::{BreakerSnapshot, CostCircuitBreaker};
use crate::gates::{SynthesisValidationState, TaskMetadata};
use crate::tier::Tier;

pub type WorkflowId = String;
pub type TaskId = String;

/// Workflow phase. The last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Research,
    Synthesis,
    Critique,
    Complete,
    Failed,
    BudgetExceeded,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::BudgetExceeded | Self::Cancelled
        )
    }

    /// Next phase on the happy path.
    pub fn next(self) -> Option<Phase> {
        match self {
            Self::Planning => Some(Self::Research),
            Self::Research => Some(Self::Synthesis),
            Self::Synthesis => Some(Self::Critique),
            Self::Critique => Some(Self::Complete),
            _ => None,
        }
    }

    /// Tier whose tasks run in this phase.
    pub fn tier(self) -> Option<Tier> {
        match self {
            Self::Planning => Some(Tier::Orchestrator),
            Self::Research => Some(Tier::Execution),
            Self::Synthesis => Some(Tier::Analytical),
            Self::Critique => Some(Tier::Strategic),
            _ => None,
        }
    }

    /// Tier that receives this phase's output. Critique reports go back to
    /// the orchestrator.
    pub fn handoff_target(self) -> Option<Tier> {
        match self.next()? {
            Self::Complete => Some(Tier::Orchestrator),
            next => next.tier(),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Research => write!(f, "research"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::Critique => write!(f, "critique"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingValidation,
    Passed,
    Rejected,
    Escalated,
    Failed,
    Complete,
}

impl TaskStatus {
    /// Whether the task no longer blocks its phase.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Passed | Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::AwaitingValidation => write!(f, "awaiting_validation"),
            Self::Passed => write!(f, "passed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Escalated => write!(f, "escalated"),
            Self::Failed => write!(f, "failed"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Unit of agent work, owned by its workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent: String,
    pub phase: Phase,
    pub tier: Tier,
    pub model: String,
    pub status: TaskStatus,
    /// What the task was asked to do; prompts are built from this.
    pub objective: String,
    /// Token budget for this task's handoff.
    pub token_budget: u32,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    /// Validation rejections so far.
    pub retry_count: u32,
    /// Agent invocations so far, successful or not.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub depends_on: Vec<TaskId>,
    /// On the critical path: failure fails the workflow.
    pub critical: bool,
    pub output: Option<String>,
    /// Last rejection reason, fed back on the next attempt.
    pub feedback: Option<String>,
    pub gap_documented: bool,
    pub gap_notes: Vec<String>,
    pub synthesis_state: SynthesisValidationState,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        agent: impl Into<String>,
        phase: Phase,
        tier: Tier,
        model: impl Into<String>,
        objective: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            phase,
            tier,
            model: model.into(),
            status: TaskStatus::Pending,
            objective: objective.into(),
            token_budget: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            retry_count: 0,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            depends_on: Vec::new(),
            critical: true,
            output: None,
            feedback: None,
            gap_documented: false,
            gap_notes: Vec::new(),
            synthesis_state: SynthesisValidationState::default(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_budget(mut self, tokens: u32) -> Self {
        self.token_budget = tokens;
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Record a gap and let the workflow continue without this output.
    pub fn document_gap(&mut self, note: impl Into<String>) {
        self.gap_documented = true;
        self.gap_notes.push(note.into());
    }
}

/// What the caller asks for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub description: String,
    pub budget_limit: f64,
    /// Risk metadata; when present every handoff is judged by a panel.
    pub metadata: Option<TaskMetadata>,
    /// Requested panel size, upward only.
    pub panel_override: Option<usize>,
    /// Treat research tasks as critical even when there are several.
    pub critical_research: bool,
}

impl WorkflowRequest {
    pub fn new(description: impl Into<String>, budget_limit: f64) -> Self {
        Self {
            description: description.into(),
            budget_limit,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_panel_override(mut self, size: usize) -> Self {
        self.panel_override = Some(size);
        self
    }

    pub fn with_critical_research(mut self) -> Self {
        self.critical_research = true;
        self
    }
}

/// One orchestration run. Mutated only by the engine.
#[derive(Debug)]
pub struct Workflow {
    pub id: WorkflowId,
    pub description: String,
    pub budget_limit: f64,
    pub breaker: CostCircuitBreaker,
    /// Tasks in execution order.
    pub tasks: Vec<Task>,
    pub machine: PhaseMachine,
    pub metadata: Option<TaskMetadata>,
    pub panel_override: Option<usize>,
    /// Escalation currently suspending the workflow.
    pub pending_escalation: Option<String>,
    pub terminal_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn phase(&self) -> Phase {
        self.machine.current()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn tasks_in(&self, phase: Phase) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.phase == phase)
    }

    pub fn cumulative_cost(&self) -> f64 {
        self.breaker.cumulative()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let final_output = if self.phase() == Phase::Complete {
            self.tasks_in(Phase::Critique)
                .filter_map(|t| t.output.clone())
                .last()
        } else {
            None
        };
        WorkflowSnapshot {
            id: self.id.clone(),
            description: self.description.clone(),
            phase: self.phase(),
            budget_limit: self.budget_limit,
            cumulative_cost: self.cumulative_cost(),
            breaker: self.breaker.snapshot(),
            tasks: self.tasks.clone(),
            transitions: self.machine.transitions().to_vec(),
            metadata: self.metadata,
            panel_override: self.panel_override,
            pending_escalation: self.pending_escalation.clone(),
            terminal_reason: self.terminal_reason.clone(),
            final_output,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Owned, read-only copy of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: WorkflowId,
    pub description: String,
    pub phase: Phase,
    pub budget_limit: f64,
    pub cumulative_cost: f64,
    pub breaker: BreakerSnapshot,
    pub tasks: Vec<Task>,
    pub transitions: Vec<TransitionRecord>,
    pub metadata: Option<TaskMetadata>,
    pub panel_override: Option<usize>,
    pub pending_escalation: Option<String>,
    pub terminal_reason: Option<String>,
    /// Critique output once the workflow completes.
    pub final_output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    pub fn is_suspended(&self) -> bool {
        self.pending_escalation.is_some()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
