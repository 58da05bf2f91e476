//! Preambles and prompt builders for each workflow phase.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes
//! so audit logs can be matched to the wording that produced them.

use super::types::{Phase, Task, Workflow};

/// Prompt version. Bump on any preamble content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Orchestrator planning preamble.
pub const PLANNER_PREAMBLE: &str = "\
You are the orchestrator of a tiered research pipeline. You receive a task \
description and produce a short execution plan for the research agents.

## Output Format
- One line per research item, in the order it should be investigated.
- For each item, name what evidence would settle it.
- Keep the plan under 300 words. No preamble, no closing summary.
";

/// Execution-tier research preamble.
///
/// The output is a structured handoff checked field by field before the
/// synthesis tier sees it.
pub const RESEARCHER_PREAMBLE: &str = "\
You are a research agent. Investigate exactly one item and report what you found.

## Output Format
Return ONLY valid JSON (no markdown, no prose outside JSON) with this exact schema:
{
  \"task_id\": \"the task id from the header\",
  \"outcome\": \"one-sentence answer\",
  \"key_findings\": [\"finding\", \"finding\"],
  \"confidence\": 0.0
}

## Rules
- `confidence` is a number between 0 and 1.
- List at most five findings; each one a single sentence.
- If you could not find an answer, say so in `outcome` and lower `confidence`.
";

/// Analytical-tier synthesis preamble.
pub const SYNTHESIZER_PREAMBLE: &str = "\
You are a synthesis agent. You merge independent research reports into one \
coherent answer.

## Rules
- Reconcile contradictions explicitly; do not silently pick a side.
- Name any gap listed under `Known gaps` in the final answer.
- Stay under 400 words.
";

/// Strategic-tier critique preamble.
pub const CRITIC_PREAMBLE: &str = "\
You are a senior reviewer. You receive a synthesized answer and return the \
final report for the orchestrator.

## Rules
- Correct factual or logical errors you can identify.
- Flag anything that is asserted without support.
- Return the corrected report only, under 400 words.
";

/// Preamble for the agent running `phase`.
pub fn preamble_for(phase: Phase) -> &'static str {
    match phase {
        Phase::Planning => PLANNER_PREAMBLE,
        Phase::Research => RESEARCHER_PREAMBLE,
        Phase::Synthesis => SYNTHESIZER_PREAMBLE,
        _ => CRITIC_PREAMBLE,
    }
}

/// Build the user prompt for `task`, pulling upstream outputs from `workflow`.
pub fn build_prompt(task: &Task, workflow: &Workflow) -> String {
    let mut prompt = format!("# Task {} ({})\n\n", task.id, task.phase);

    match task.phase {
        Phase::Planning => {
            prompt.push_str("## Description\n");
            prompt.push_str(&task.objective);
            prompt.push('\n');
        }
        Phase::Research => {
            prompt.push_str("## Overall goal\n");
            prompt.push_str(&workflow.description);
            prompt.push_str("\n\n## Your item\n");
            prompt.push_str(&task.objective);
            prompt.push('\n');
            if let Some(plan) = upstream(task, workflow).next() {
                prompt.push_str("\n## Plan\n");
                prompt.push_str(plan.1);
                prompt.push('\n');
            }
        }
        Phase::Synthesis => {
            prompt.push_str("## Question\n");
            prompt.push_str(&task.objective);
            prompt.push_str("\n\n## Research reports\n");
            for (id, output) in upstream(task, workflow) {
                prompt.push_str(&format!("### {id}\n{output}\n\n"));
            }
            let gaps: Vec<String> = task
                .depends_on
                .iter()
                .filter_map(|id| workflow.task(id))
                .flat_map(|dep| dep.gap_notes.iter().map(move |n| format!("- {}: {n}", dep.id)))
                .collect();
            if !gaps.is_empty() {
                prompt.push_str("## Known gaps\n");
                prompt.push_str(&gaps.join("\n"));
                prompt.push('\n');
            }
        }
        _ => {
            prompt.push_str("## Question\n");
            prompt.push_str(&task.objective);
            prompt.push_str("\n\n## Draft answer\n");
            for (_, output) in upstream(task, workflow) {
                prompt.push_str(output);
                prompt.push('\n');
            }
        }
    }

    if let Some(feedback) = &task.feedback {
        prompt.push_str("\n## Previous attempt was rejected\n");
        prompt.push_str(feedback);
        prompt.push_str("\nAddress this before anything else.\n");
    }
    prompt
}

/// `(task id, output)` for every finished dependency of `task`.
fn upstream<'a>(task: &'a Task, workflow: &'a Workflow) -> impl Iterator<Item = (&'a str, &'a str)> {
    task.depends_on
        .iter()
        .filter_map(|id| workflow.task(id))
        .filter_map(|dep| dep.output.as_deref().map(|out| (dep.id.as_str(), out)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CostCircuitBreaker;
    use crate::tier::Tier;
    use crate::workflow::PhaseMachine;
    use chrono::Utc;

    fn workflow(tasks: Vec<Task>) -> Workflow {
        Workflow {
            id: "wf".into(),
            description: "Compare vendors".into(),
            budget_limit: 1.0,
            breaker: CostCircuitBreaker::new(1.0),
            tasks,
            machine: PhaseMachine::new(),
            metadata: None,
            panel_override: None,
            pending_escalation: None,
            terminal_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_synthesis_prompt_lists_reports_and_gaps() {
        let mut r1 = Task::new("research-1", "researcher-1", Phase::Research, Tier::Execution, "m", "pricing");
        r1.output = Some("{\"outcome\":\"cheap\"}".into());
        let mut r2 = Task::new("research-2", "researcher-2", Phase::Research, Tier::Execution, "m", "support");
        r2.document_gap("agent unavailable");
        let synth = Task::new("synthesis", "synthesizer", Phase::Synthesis, Tier::Analytical, "m", "Compare vendors")
            .with_dependencies(vec!["research-1".into(), "research-2".into()]);
        let wf = workflow(vec![r1, r2, synth.clone()]);

        let prompt = build_prompt(&synth, &wf);
        assert!(prompt.contains("### research-1"));
        assert!(!prompt.contains("### research-2"));
        assert!(prompt.contains("- research-2: agent unavailable"));
    }

    #[test]
    fn test_feedback_is_appended() {
        let mut task = Task::new("research-1", "researcher-1", Phase::Research, Tier::Execution, "m", "pricing");
        task.feedback = Some("missing key_findings".into());
        let wf = workflow(vec![task.clone()]);
        let prompt = build_prompt(&task, &wf);
        assert!(prompt.contains("Previous attempt was rejected"));
        assert!(prompt.contains("missing key_findings"));
    }

    #[test]
    fn test_research_preamble_demands_json() {
        assert!(preamble_for(Phase::Research).contains("key_findings"));
        assert_eq!(preamble_for(Phase::Planning), PLANNER_PREAMBLE);
    }
}
