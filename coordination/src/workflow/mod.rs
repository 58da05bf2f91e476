//! Workflow lifecycle: decomposition, phase machine, and the engine that
//! drives tasks through the tier boundaries.

pub mod decompose;
pub mod engine;
pub mod prompts;
pub mod state_machine;
pub mod types;

pub use decompose::{decompose, split_items};
pub use engine::{AdvanceOutcome, WorkflowEngine};
pub use state_machine::{PhaseMachine, TransitionRecord};
pub use types::{
    Phase, Task, TaskId, TaskStatus, Workflow, WorkflowId, WorkflowRequest, WorkflowSnapshot,
};
