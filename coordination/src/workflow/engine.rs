//! Workflow engine: decomposes requests and drives them through the tiers.
//!
//! ```text
//!            ┌──────────── advance(id) ────────────┐
//!            ▼                                      │
//!  cancel? ─▶ breaker.allow(est) ─▶ invoke agent ─▶ record_spend ─▶ layer stack
//!                 │ no                  │ err ×N          │ tripped      │
//!                 ▼                     ▼                 ▼              ├─ accept ─▶ passed
//!          BudgetExceeded        task failed /     BudgetExceeded        ├─ reject ─▶ retry w/ feedback
//!                                gap documented                          └─ escalate ─▶ suspend | gaps
//! ```
//!
//! Each workflow sits behind its own async mutex, so concurrent `advance`
//! calls on one workflow serialize while different workflows run freely.
//! Cancellation is a per-workflow flag read at task boundaries, before any
//! spend is committed.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::decompose::decompose;
use super::prompts::{build_prompt, preamble_for};
use super::state_machine::PhaseMachine;
use super::types::{Phase, TaskStatus, Workflow, WorkflowId, WorkflowRequest, WorkflowSnapshot};
use crate::breaker::{BreakerState, CostCircuitBreaker};
use crate::config::{ConfigError, PipelineConfig};
use crate::error::{EngineError, FailureKind};
use crate::events::{AuditEvent, AuditEventType, SharedSink};
use crate::gates::{BudgetMatrix, PanelSizeSelector, SynthesisValidationState, TaskMetadata};
use crate::invoke::{invoke_with_timeout, InvocationRequest, SharedInvoker};
use crate::oracle::{TieredTokenOracle, TokenBudgetOracle};
use crate::panel::{
    EscalationLog, EscalationReason, EscalationRequest, EscalationStatus, EscalationView,
    ResolutionDecision,
};
use crate::tier::Tier;
use crate::validation::{Handoff, StackOutcome, ValidationLayerStack};

/// Result of one `advance` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceOutcome {
    pub workflow_id: WorkflowId,
    pub previous_phase: Phase,
    pub phase: Phase,
    /// Escalation that suspended the workflow during this call.
    pub suspended: Option<String>,
    /// Tasks executed (or resumed) during this call.
    pub tasks_run: usize,
    /// Spend recorded during this call.
    pub cost_spent: f64,
}

impl AdvanceOutcome {
    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }
}

#[derive(Clone)]
struct WorkflowEntry {
    workflow: Arc<tokio::sync::Mutex<Workflow>>,
    cancel: Arc<AtomicBool>,
}

enum TaskRun {
    Settled,
    Suspended(String),
}

/// Owns every workflow and the escalation log.
pub struct WorkflowEngine {
    config: PipelineConfig,
    oracle: Arc<dyn TokenBudgetOracle>,
    invoker: SharedInvoker,
    stack: ValidationLayerStack,
    matrix: BudgetMatrix,
    selector: PanelSizeSelector,
    sink: SharedSink,
    workflows: tokio::sync::RwLock<HashMap<WorkflowId, WorkflowEntry>>,
    escalations: Mutex<EscalationLog>,
}

impl WorkflowEngine {
    /// Engine with the config-driven oracle and the standard layer stack.
    pub fn new(
        config: PipelineConfig,
        invoker: SharedInvoker,
        sink: SharedSink,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let oracle: Arc<dyn TokenBudgetOracle> = Arc::new(TieredTokenOracle::from_config(
            &config.oracle,
            config.pricing.clone(),
        ));
        let stack = ValidationLayerStack::standard(&config, oracle.clone(), invoker.clone())?;
        Self::with_components(config, oracle, invoker, stack, sink)
    }

    /// Engine with a caller-supplied oracle and layer stack.
    pub fn with_components(
        config: PipelineConfig,
        oracle: Arc<dyn TokenBudgetOracle>,
        invoker: SharedInvoker,
        stack: ValidationLayerStack,
        sink: SharedSink,
    ) -> Result<Self, ConfigError> {
        let matrix = BudgetMatrix::from_config(&config.compression)?;
        info!(layers = ?stack.layer_names(), "Workflow engine ready");
        Ok(Self {
            config,
            oracle,
            invoker,
            stack,
            matrix,
            selector: PanelSizeSelector::default(),
            sink,
            workflows: tokio::sync::RwLock::new(HashMap::new()),
            escalations: Mutex::new(EscalationLog::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn create_workflow(
        &self,
        description: &str,
        budget_limit: f64,
    ) -> Result<WorkflowSnapshot, EngineError> {
        self.create_workflow_with(WorkflowRequest::new(description, budget_limit))
            .await
    }

    /// Decompose `request` into tasks and register the workflow in `Planning`.
    pub async fn create_workflow_with(
        &self,
        request: WorkflowRequest,
    ) -> Result<WorkflowSnapshot, EngineError> {
        if request.description.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "workflow description is empty".into(),
            ));
        }
        if request.budget_limit.is_nan() {
            return Err(EngineError::InvalidRequest("budget limit is NaN".into()));
        }
        if let Some(size) = request.panel_override {
            let metadata = request.metadata.unwrap_or_else(TaskMetadata::low_risk);
            self.selector.select_with_override(&metadata, Some(size))?;
        }

        let tasks = decompose(&request, &self.config.engine, &self.matrix, |tier| {
            self.config.model_for(tier)
        });
        let now = chrono::Utc::now();
        let workflow = Workflow {
            id: uuid::Uuid::new_v4().to_string(),
            description: request.description.trim().to_string(),
            budget_limit: request.budget_limit,
            breaker: CostCircuitBreaker::new(request.budget_limit),
            tasks,
            machine: PhaseMachine::new(),
            metadata: request.metadata,
            panel_override: request.panel_override,
            pending_escalation: None,
            terminal_reason: None,
            created_at: now,
            updated_at: now,
        };

        info!(
            workflow_id = %workflow.id,
            budget_limit = workflow.budget_limit,
            tasks = workflow.tasks.len(),
            "Workflow created"
        );
        self.emit(
            AuditEvent::workflow(&workflow.id, AuditEventType::WorkflowCreated).with_payload(json!({
                "description": workflow.description,
                "budget_limit": workflow.budget_limit,
                "tasks": workflow.tasks.iter().map(|t| &t.id).collect::<Vec<_>>(),
            })),
        );

        let snapshot = workflow.snapshot();
        let entry = WorkflowEntry {
            workflow: Arc::new(tokio::sync::Mutex::new(workflow)),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        self.workflows
            .write()
            .await
            .insert(snapshot.id.clone(), entry);
        Ok(snapshot)
    }

    /// Run every outstanding task of the current phase, then move to the
    /// next phase once all of them have settled.
    pub async fn advance(&self, workflow_id: &str) -> Result<AdvanceOutcome, EngineError> {
        let entry = self.entry(workflow_id).await?;
        let mut guard = entry.workflow.lock().await;
        let wf = &mut *guard;

        if wf.phase().is_terminal() {
            return Err(EngineError::WorkflowTerminal {
                id: wf.id.clone(),
                phase: wf.phase(),
            });
        }
        // A cancel requested mid-call wins over a suspension raised by that call.
        self.check_cancelled(wf, &entry.cancel)?;
        if let Some(escalation_id) = &wf.pending_escalation {
            return Err(EngineError::WorkflowSuspended {
                id: wf.id.clone(),
                escalation_id: escalation_id.clone(),
            });
        }

        let previous_phase = wf.phase();
        let cost_before = wf.cumulative_cost();
        let runnable: Vec<usize> = wf
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.phase == previous_phase
                    && !t.status.is_settled()
                    && t.status != TaskStatus::Escalated
            })
            .map(|(i, _)| i)
            .collect();

        debug!(workflow_id = %wf.id, phase = %previous_phase, runnable = runnable.len(), "Advancing");

        let mut tasks_run = 0;
        for idx in runnable {
            tasks_run += 1;
            if let TaskRun::Suspended(escalation_id) =
                self.run_task(wf, idx, &entry.cancel).await?
            {
                wf.touch();
                return Ok(AdvanceOutcome {
                    workflow_id: wf.id.clone(),
                    previous_phase,
                    phase: wf.phase(),
                    suspended: Some(escalation_id),
                    tasks_run,
                    cost_spent: wf.cumulative_cost() - cost_before,
                });
            }
        }

        self.complete_phase(wf)?;
        Ok(AdvanceOutcome {
            workflow_id: wf.id.clone(),
            previous_phase,
            phase: wf.phase(),
            suspended: None,
            tasks_run,
            cost_spent: wf.cumulative_cost() - cost_before,
        })
    }

    /// Advance until the workflow is terminal or suspended.
    pub async fn run_to_completion(&self, workflow_id: &str) -> Result<WorkflowSnapshot, EngineError> {
        loop {
            let outcome = self.advance(workflow_id).await?;
            if outcome.is_suspended() || outcome.phase.is_terminal() {
                break;
            }
        }
        self.get_workflow(workflow_id).await
    }

    /// Apply a human decision to an escalation.
    ///
    /// Only the escalation currently suspending its workflow changes task
    /// state; record-only escalations just get the resolution appended.
    pub async fn resolve_escalation(
        &self,
        escalation_id: &str,
        decision: ResolutionDecision,
        note: Option<String>,
    ) -> Result<WorkflowSnapshot, EngineError> {
        let request = {
            let log = self.escalations();
            let request = log
                .get(escalation_id)
                .cloned()
                .ok_or_else(|| EngineError::EscalationNotFound(escalation_id.to_string()))?;
            if log.resolution_for(escalation_id).is_some() {
                return Err(EngineError::EscalationAlreadyResolved(
                    escalation_id.to_string(),
                ));
            }
            request
        };

        let entry = self.entry(&request.workflow_id).await?;
        let mut guard = entry.workflow.lock().await;
        let wf = &mut *guard;
        let suspending = wf.pending_escalation.as_deref() == Some(escalation_id);

        if suspending && wf.phase().is_terminal() {
            return Err(EngineError::WorkflowTerminal {
                id: wf.id.clone(),
                phase: wf.phase(),
            });
        }

        let resolution = self.escalations().resolve(escalation_id, decision, note)?;
        info!(
            escalation_id,
            workflow_id = %wf.id,
            %decision,
            suspending,
            "Escalation resolved"
        );
        self.emit(
            AuditEvent::workflow(&wf.id, AuditEventType::EscalationResolved)
                .with_payload(json!({ "resolution": resolution, "reason": request.reason })),
        );

        if suspending {
            wf.pending_escalation = None;
            let task_idx = request
                .task_id
                .as_deref()
                .and_then(|id| wf.tasks.iter().position(|t| t.id == id));

            match decision {
                ResolutionDecision::Proceed => {
                    if let Some(idx) = task_idx {
                        let task = &mut wf.tasks[idx];
                        task.status = TaskStatus::Passed;
                        task.feedback = None;
                        task.completed_at = Some(chrono::Utc::now());
                        self.emit_task_state(wf, idx, Some("escalation proceed"));
                    }
                }
                ResolutionDecision::RetryPhase => {
                    if let Some(idx) = task_idx {
                        let task = &mut wf.tasks[idx];
                        task.status = TaskStatus::Pending;
                        task.retry_count = 0;
                        task.output = None;
                        task.synthesis_state = SynthesisValidationState::default();
                        task.completed_at = None;
                        self.emit_task_state(wf, idx, Some("escalation retry_phase"));
                    }
                }
                ResolutionDecision::Abort => {
                    self.terminate(
                        wf,
                        Phase::Failed,
                        format!("escalation {escalation_id} aborted ({})", request.reason),
                    );
                }
            }
        }

        wf.touch();
        Ok(wf.snapshot())
    }

    /// Request cancellation. Takes effect immediately when the workflow is
    /// idle, otherwise at the next task boundary of the running `advance`.
    pub async fn cancel(&self, workflow_id: &str) -> Result<(), EngineError> {
        let entry = self.entry(workflow_id).await?;
        entry.cancel.store(true, Ordering::SeqCst);

        match entry.workflow.try_lock() {
            Ok(mut guard) => {
                let wf = &mut *guard;
                if wf.phase().is_terminal() {
                    return Err(EngineError::WorkflowTerminal {
                        id: wf.id.clone(),
                        phase: wf.phase(),
                    });
                }
                self.terminate(wf, Phase::Cancelled, "cancelled by caller".into());
            }
            Err(_) => {
                info!(workflow_id, "Cancellation requested; workflow busy, will stop at next boundary");
            }
        }
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowSnapshot, EngineError> {
        let entry = self.entry(workflow_id).await?;
        let wf = entry.workflow.lock().await;
        Ok(wf.snapshot())
    }

    /// Snapshots of every non-terminal workflow, oldest first.
    pub async fn list_active_workflows(&self) -> Vec<WorkflowSnapshot> {
        let entries: Vec<WorkflowEntry> = self.workflows.read().await.values().cloned().collect();
        let mut active = Vec::new();
        for entry in entries {
            let wf = entry.workflow.lock().await;
            if !wf.phase().is_terminal() {
                active.push(wf.snapshot());
            }
        }
        active.sort_by_key(|s| s.created_at);
        active
    }

    pub fn get_escalations(&self, status: Option<EscalationStatus>) -> Vec<EscalationView> {
        self.escalations().list(status)
    }

    async fn entry(&self, workflow_id: &str) -> Result<WorkflowEntry, EngineError> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn escalations(&self) -> MutexGuard<'_, EscalationLog> {
        self.escalations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: AuditEvent) {
        self.sink.emit(event);
    }

    fn emit_task_state(&self, wf: &Workflow, idx: usize, detail: Option<&str>) {
        let task = &wf.tasks[idx];
        self.emit(
            AuditEvent::task(&wf.id, &task.id, AuditEventType::TaskStateChanged).with_payload(json!({
                "status": task.status,
                "attempts": task.attempts,
                "retry_count": task.retry_count,
                "detail": detail,
            })),
        );
    }

    fn check_cancelled(&self, wf: &mut Workflow, cancel: &AtomicBool) -> Result<(), EngineError> {
        if !cancel.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !wf.phase().is_terminal() {
            self.terminate(wf, Phase::Cancelled, "cancelled by caller".into());
        }
        Err(EngineError::Cancelled(wf.id.clone()))
    }

    /// Move to a terminal phase and record why.
    fn terminate(&self, wf: &mut Workflow, to: Phase, reason: String) {
        let from = wf.phase();
        if let Err(e) = wf.machine.advance(to, Some(reason.as_str())) {
            warn!(workflow_id = %wf.id, error = %e, "Terminal transition refused");
            return;
        }
        wf.terminal_reason = Some(reason.clone());
        wf.touch();
        self.emit(
            AuditEvent::workflow(&wf.id, AuditEventType::PhaseTransition)
                .with_payload(json!({ "from": from, "to": to, "reason": reason })),
        );
        if to == Phase::Cancelled {
            self.emit(AuditEvent::workflow(&wf.id, AuditEventType::WorkflowCancelled));
        }
    }

    /// Trip handling shared by the estimate check and post-spend check.
    fn budget_exceeded(&self, wf: &mut Workflow, task_id: &str) -> EngineError {
        let breaker = wf.breaker.snapshot();
        self.emit(
            AuditEvent::task(&wf.id, task_id, AuditEventType::BreakerTripped)
                .with_payload(json!({ "breaker": breaker })),
        );

        let tier = wf.task(task_id).map(|t| t.tier).unwrap_or(Tier::Orchestrator);
        let request = EscalationRequest::new(
            EscalationReason::BudgetExceeded,
            wf.id.clone(),
            Some(task_id.to_string()),
            tier,
            Tier::Orchestrator,
        )
        .with_snapshot(json!(breaker))
        .with_detail(breaker.to_string())
        .non_suspending();
        self.raise(wf, request);

        self.terminate(wf, Phase::BudgetExceeded, breaker.to_string());
        EngineError::BudgetExceeded {
            workflow_id: wf.id.clone(),
            breaker,
        }
    }

    fn raise(&self, wf: &Workflow, request: EscalationRequest) -> String {
        let payload = json!({
            "reason": request.reason,
            "detail": request.detail,
            "suspends": request.suspends,
            "source": request.source,
            "target": request.target,
        });
        let task_id = request.task_id.clone();
        let id = self.escalations().raise(request);
        let event = match task_id {
            Some(task_id) => AuditEvent::task(&wf.id, task_id, AuditEventType::EscalationRaised),
            None => AuditEvent::workflow(&wf.id, AuditEventType::EscalationRaised),
        };
        self.emit(event.with_payload(json!({ "escalation_id": id, "request": payload })));
        id
    }

    /// Record one charge; an open breaker afterwards ends the workflow.
    fn charge(
        &self,
        wf: &mut Workflow,
        task_id: &str,
        charge_id: String,
        amount: f64,
    ) -> Result<(), EngineError> {
        match wf.breaker.record_spend(charge_id.clone(), amount) {
            Ok(state) => {
                self.emit(
                    AuditEvent::task(&wf.id, task_id, AuditEventType::SpendRecorded).with_payload(
                        json!({
                            "charge_id": charge_id,
                            "amount": amount,
                            "cumulative": wf.breaker.cumulative(),
                        }),
                    ),
                );
                if state == BreakerState::Open {
                    return Err(self.budget_exceeded(wf, task_id));
                }
            }
            Err(e) => {
                error!(workflow_id = %wf.id, %charge_id, amount, error = %e, "Spend not recorded");
                self.emit(
                    AuditEvent::task(&wf.id, task_id, AuditEventType::SpendRejected).with_payload(
                        json!({
                            "charge_id": charge_id,
                            "amount": amount,
                            "error": e.to_string(),
                        }),
                    ),
                );
            }
        }
        Ok(())
    }

    /// Execute one task until it passes, fails, or suspends the workflow.
    async fn run_task(
        &self,
        wf: &mut Workflow,
        idx: usize,
        cancel: &AtomicBool,
    ) -> Result<TaskRun, EngineError> {
        let engine_cfg = &self.config.engine;
        let timeout = Duration::from_secs(engine_cfg.agent_timeout_secs);
        let task_id = wf.tasks[idx].id.clone();
        let mut invocation_failures = 0u32;

        loop {
            self.check_cancelled(wf, cancel)?;

            let prompt = build_prompt(&wf.tasks[idx], wf);
            let task = &wf.tasks[idx];
            let prompt_tokens = self.oracle.estimate_tokens(&prompt).count;
            let estimate = self.oracle.estimate_cost(
                prompt_tokens,
                engine_cfg.default_output_tokens,
                &task.model,
            );
            if !wf.breaker.allow(estimate) {
                return Err(self.budget_exceeded(wf, &task_id));
            }

            let request = InvocationRequest::new(&task.agent, &task.model, prompt)
                .with_system(preamble_for(task.phase));
            let task = &mut wf.tasks[idx];
            task.status = TaskStatus::Running;
            task.attempts += 1;
            task.started_at.get_or_insert_with(chrono::Utc::now);
            let attempt = task.attempts;
            let model = task.model.clone();
            self.emit_task_state(wf, idx, None);

            let response = match invoke_with_timeout(self.invoker.as_ref(), request, timeout).await {
                Ok(response) => response,
                Err(e) => {
                    invocation_failures += 1;
                    warn!(
                        workflow_id = %wf.id,
                        %task_id,
                        attempt,
                        failures = invocation_failures,
                        error = %e,
                        "Agent invocation failed"
                    );
                    if invocation_failures > engine_cfg.max_agent_retries {
                        return self.fail_task(
                            wf,
                            idx,
                            FailureKind::AgentInvocationFailed,
                            e.to_string(),
                        );
                    }
                    continue;
                }
            };

            // Providers that do not report usage are charged at the estimate.
            let tokens_in = if response.tokens_in > 0 {
                response.tokens_in
            } else {
                prompt_tokens
            };
            let tokens_out = if response.tokens_out > 0 {
                response.tokens_out
            } else {
                self.oracle.estimate_tokens(&response.text).count
            };
            let cost = self.oracle.estimate_cost(tokens_in, tokens_out, &model);
            {
                let task = &mut wf.tasks[idx];
                task.tokens_in += tokens_in;
                task.tokens_out += tokens_out;
                task.cost += cost;
                task.status = TaskStatus::AwaitingValidation;
            }
            self.charge(wf, &task_id, format!("{task_id}#{attempt}"), cost)?;

            let task = &wf.tasks[idx];
            let source = task.tier;
            let target = task.phase.handoff_target().unwrap_or(Tier::Orchestrator);
            let mut handoff = Handoff::new(&wf.id, &task_id, source, target, response.text)
                .with_synthesis_state(task.synthesis_state)
                .with_metadata(wf.metadata)
                .with_panel_override(wf.panel_override);
            let outcome = self.stack.evaluate(&mut handoff).await;
            wf.tasks[idx].synthesis_state = handoff.synthesis_state;
            self.record_layers(wf, &task_id, attempt, &handoff)?;

            match outcome {
                StackOutcome::Accept { payload } => {
                    let task = &mut wf.tasks[idx];
                    task.output = Some(payload);
                    task.feedback = None;
                    task.status = TaskStatus::Passed;
                    task.completed_at = Some(chrono::Utc::now());
                    info!(workflow_id = %wf.id, %task_id, attempt, "Task passed validation");
                    self.emit_task_state(wf, idx, None);
                    return Ok(TaskRun::Settled);
                }
                StackOutcome::Reject { layer, reason, kind } => {
                    self.emit(
                        AuditEvent::task(&wf.id, &task_id, AuditEventType::LayerRejected)
                            .with_payload(json!({ "layer": layer, "reason": reason, "kind": kind })),
                    );
                    if !kind.is_retryable() {
                        return self.fail_task(wf, idx, kind, reason);
                    }

                    let task = &mut wf.tasks[idx];
                    task.retry_count += 1;
                    task.feedback = Some(format!("{layer}: {reason}"));
                    task.status = TaskStatus::Rejected;
                    let retry_count = task.retry_count;
                    self.emit_task_state(wf, idx, Some(reason.as_str()));

                    if retry_count > engine_cfg.max_validation_retries {
                        let request = EscalationRequest::new(
                            EscalationReason::RetriesExhausted,
                            wf.id.clone(),
                            Some(task_id.clone()),
                            source,
                            target,
                        )
                        .with_snapshot(json!({
                            "retry_count": retry_count,
                            "layer": layer,
                            "reason": reason,
                        }))
                        .with_detail(format!(
                            "{retry_count} validation rejections; last from {layer}: {reason}"
                        ));
                        return Ok(self.suspend(wf, idx, handoff.payload, request));
                    }
                }
                StackOutcome::Escalate {
                    layer,
                    reason,
                    detail,
                    snapshot,
                    suspend,
                } => {
                    let request = EscalationRequest::new(
                        reason,
                        wf.id.clone(),
                        Some(task_id.clone()),
                        source,
                        target,
                    )
                    .with_snapshot(snapshot)
                    .with_detail(detail);

                    if suspend {
                        return Ok(self.suspend(wf, idx, handoff.payload, request));
                    }

                    let escalation_id = self.raise(wf, request.non_suspending());
                    let task = &mut wf.tasks[idx];
                    for gap in &handoff.gaps {
                        task.document_gap(format!(
                            "missing {gap} ({layer} escalation {escalation_id})"
                        ));
                    }
                    task.output = Some(handoff.payload);
                    task.feedback = None;
                    task.status = TaskStatus::Passed;
                    task.completed_at = Some(chrono::Utc::now());
                    self.emit_task_state(wf, idx, Some("passed with documented gaps"));
                    return Ok(TaskRun::Settled);
                }
            }
        }
    }

    /// Emit per-layer events and charge the layers' own model calls.
    fn record_layers(
        &self,
        wf: &mut Workflow,
        task_id: &str,
        attempt: u32,
        handoff: &Handoff,
    ) -> Result<(), EngineError> {
        for report in &handoff.reports {
            let event_type = if report.layer == "judge_panel" {
                AuditEventType::PanelVerdict
            } else {
                AuditEventType::GateDecision
            };
            self.emit(AuditEvent::task(&wf.id, task_id, event_type).with_payload(json!({
                "layer": report.layer,
                "passed": report.passed,
                "detail": report.detail,
            })));
        }
        for (i, usage) in handoff.usage.iter().enumerate() {
            let cost = self
                .oracle
                .estimate_cost(usage.tokens_in, usage.tokens_out, &usage.model);
            wf.tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .into_iter()
                .for_each(|t| t.cost += cost);
            self.charge(
                wf,
                task_id,
                format!("{task_id}#{attempt}:{}:{i}", usage.layer),
                cost,
            )?;
        }
        Ok(())
    }

    fn suspend(
        &self,
        wf: &mut Workflow,
        idx: usize,
        payload: String,
        request: EscalationRequest,
    ) -> TaskRun {
        let escalation_id = self.raise(wf, request);
        let task = &mut wf.tasks[idx];
        task.output = Some(payload);
        task.status = TaskStatus::Escalated;
        wf.pending_escalation = Some(escalation_id.clone());
        self.emit_task_state(wf, idx, Some("suspended pending escalation"));
        TaskRun::Suspended(escalation_id)
    }

    /// Task cannot produce usable output. Critical tasks take the workflow
    /// down; others leave a documented gap.
    fn fail_task(
        &self,
        wf: &mut Workflow,
        idx: usize,
        kind: FailureKind,
        message: String,
    ) -> Result<TaskRun, EngineError> {
        let task = &mut wf.tasks[idx];
        task.status = TaskStatus::Failed;
        task.completed_at = Some(chrono::Utc::now());
        let task_id = task.id.clone();
        let attempts = task.attempts;

        if !task.critical {
            task.document_gap(format!("{kind}: {message}"));
            warn!(workflow_id = %wf.id, %task_id, %kind, "Non-critical task failed; gap documented");
            self.emit_task_state(wf, idx, Some(message.as_str()));
            return Ok(TaskRun::Settled);
        }

        self.emit_task_state(wf, idx, Some(message.as_str()));
        self.terminate(
            wf,
            Phase::Failed,
            format!("critical task {task_id} failed ({kind}): {message}"),
        );
        let workflow_id = wf.id.clone();
        Err(match kind {
            FailureKind::AgentInvocationFailed => EngineError::AgentInvocationFailed {
                workflow_id,
                task_id,
                attempts,
                message,
            },
            FailureKind::SchemaInvalid => EngineError::SchemaInvalid {
                workflow_id,
                task_id,
                reason: message,
            },
            _ => EngineError::InvalidRequest(message),
        })
    }

    /// Mark passed tasks complete and take the happy-path edge.
    fn complete_phase(&self, wf: &mut Workflow) -> Result<(), EngineError> {
        let phase = wf.phase();
        let Some(next) = phase.next() else {
            return Ok(());
        };

        let passed: Vec<usize> = wf
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.phase == phase && t.status == TaskStatus::Passed)
            .map(|(i, _)| i)
            .collect();
        for idx in passed {
            wf.tasks[idx].status = TaskStatus::Complete;
            self.emit_task_state(wf, idx, None);
        }

        let gaps = wf
            .tasks_in(phase)
            .filter(|t| t.gap_documented)
            .count();
        let reason = if gaps == 0 {
            format!("all {phase} tasks complete")
        } else {
            format!("{phase} settled with {gaps} documented gap(s)")
        };
        wf.machine.advance(next, Some(reason.as_str()))?;
        wf.touch();
        self.emit(
            AuditEvent::workflow(&wf.id, AuditEventType::PhaseTransition)
                .with_payload(json!({ "from": phase, "to": next, "reason": reason })),
        );
        if next == Phase::Complete {
            info!(
                workflow_id = %wf.id,
                cost = wf.cumulative_cost(),
                path = %wf.machine.summary(),
                "Workflow complete"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::invoke::{AgentInvoker, AgentResponse, InvocationError};
    use async_trait::async_trait;

    struct Canned;

    #[async_trait]
    impl AgentInvoker for Canned {
        async fn invoke(&self, request: InvocationRequest) -> Result<AgentResponse, InvocationError> {
            let text = if request.agent.starts_with("researcher") {
                r#"{"task_id": "r", "outcome": "ok", "key_findings": ["a"], "confidence": 0.8}"#
                    .to_string()
            } else if request.agent.starts_with("judge:") {
                "SCORE: 9\nCONFIDENCE: 0.9".to_string()
            } else {
                format!("{} output", request.agent)
            };
            Ok(AgentResponse {
                text,
                tokens_in: 100,
                tokens_out: 20,
            })
        }
    }

    fn engine() -> (WorkflowEngine, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let engine =
            WorkflowEngine::new(PipelineConfig::default(), Arc::new(Canned), bus.clone()).unwrap();
        (engine, bus)
    }

    #[tokio::test]
    async fn test_empty_description_rejected() {
        let (engine, _) = engine();
        let err = engine.create_workflow("  ", 1.0).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_planning_advances_to_research() {
        let (engine, bus) = engine();
        let wf = engine.create_workflow("- pricing\n- support", 5.0).await.unwrap();
        let outcome = engine.advance(&wf.id).await.unwrap();
        assert_eq!(outcome.previous_phase, Phase::Planning);
        assert_eq!(outcome.phase, Phase::Research);
        assert_eq!(outcome.tasks_run, 1);
        assert!(outcome.cost_spent > 0.0);

        let snap = engine.get_workflow(&wf.id).await.unwrap();
        assert_eq!(snap.task("planner").unwrap().status, TaskStatus::Complete);
        assert!(bus
            .history()
            .iter()
            .any(|e| e.event_type == AuditEventType::PhaseTransition));
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.advance("nope").await.unwrap_err(),
            EngineError::WorkflowNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_idle_cancel_is_immediate() {
        let (engine, _) = engine();
        let wf = engine.create_workflow("Summarise it.", 5.0).await.unwrap();
        engine.cancel(&wf.id).await.unwrap();
        let snap = engine.get_workflow(&wf.id).await.unwrap();
        assert_eq!(snap.phase, Phase::Cancelled);
        assert_eq!(snap.cumulative_cost, 0.0);
        assert!(engine.list_active_workflows().await.is_empty());
        assert!(matches!(
            engine.advance(&wf.id).await.unwrap_err(),
            EngineError::WorkflowTerminal { .. }
        ));
    }

    #[tokio::test]
    async fn test_downgrade_override_rejected_at_creation() {
        let (engine, _) = engine();
        let request = WorkflowRequest::new("Summarise it.", 5.0).with_panel_override(2);
        let err = engine.create_workflow_with(request).await.unwrap_err();
        assert_eq!(err.code(), "panel_size_downgrade_rejected");
    }

    #[tokio::test]
    async fn test_refused_charge_is_surfaced_as_event() {
        let (engine, bus) = engine();
        let wf = engine.create_workflow("Summarise it.", 5.0).await.unwrap();
        let entry = engine.entry(&wf.id).await.unwrap();
        let mut guard = entry.workflow.lock().await;

        engine
            .charge(&mut guard, "planner", "planner#1".into(), 0.01)
            .unwrap();
        engine
            .charge(&mut guard, "planner", "planner#1".into(), 0.01)
            .unwrap();
        assert_eq!(guard.breaker.snapshot().charges, 1);

        let rejected: Vec<AuditEvent> = bus
            .history()
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::SpendRejected)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].payload["charge_id"], "planner#1");
        assert_eq!(rejected[0].task_id.as_deref(), Some("planner"));
    }
}
