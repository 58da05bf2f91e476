//! Task decomposition: description → initial task graph.
//!
//! ```text
//! planner (tier 0)
//!   ├─▶ research-1 … research-N (tier 3, one per item)
//!   │        └──────────┬─────────┘
//!   │                   ▼
//!   └──────────▶ synthesis (tier 2) ─▶ critique (tier 1)
//! ```

use regex::Regex;
use std::sync::LazyLock;

use super::types::{Phase, Task, WorkflowRequest};
use crate::config::EngineConfig;
use crate::gates::BudgetMatrix;
use crate::tier::Tier;

static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(.+?)\s*$").expect("BULLET_RE regex should compile")
});

static SENTENCE_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(?:\s+|$)").expect("SENTENCE_END_RE regex should compile"));

pub const PLANNER_ID: &str = "planner";
pub const SYNTHESIS_ID: &str = "synthesis";
pub const CRITIQUE_ID: &str = "critique";

/// Split a description into at most `max_items` research items.
///
/// Bullet or numbered lines win; otherwise sentences are used. Surplus
/// items are folded into consecutive groups so nothing is dropped.
pub fn split_items(description: &str, max_items: usize) -> Vec<String> {
    let max_items = max_items.max(1);
    let bullets: Vec<String> = description
        .lines()
        .filter_map(|line| BULLET_RE.captures(line))
        .map(|caps| caps[1].to_string())
        .collect();

    let (items, joiner) = if !bullets.is_empty() {
        (bullets, "; ")
    } else {
        let sentences: Vec<String> = SENTENCE_END_RE
            .split(description.trim())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        (sentences, ". ")
    };

    if items.is_empty() {
        return vec![description.trim().to_string()];
    }
    if items.len() <= max_items {
        return items;
    }

    let per_group = items.len().div_ceil(max_items);
    items
        .chunks(per_group)
        .map(|chunk| chunk.join(joiner))
        .collect()
}

/// Build the initial task graph for `request`.
pub fn decompose<F>(
    request: &WorkflowRequest,
    config: &EngineConfig,
    matrix: &BudgetMatrix,
    model_for: F,
) -> Vec<Task>
where
    F: Fn(Tier) -> String,
{
    let description = request.description.trim();
    let items = split_items(description, config.max_research_tasks);
    let research_critical = request.critical_research || items.len() == 1;

    let mut tasks = Vec::with_capacity(items.len() + 3);
    tasks.push(
        Task::new(
            PLANNER_ID,
            "planner",
            Phase::Planning,
            Tier::Orchestrator,
            model_for(Tier::Orchestrator),
            description,
        )
        .with_budget(matrix.budget_for(Tier::Orchestrator, Tier::Execution)),
    );

    let mut research_ids = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let id = format!("research-{}", i + 1);
        let mut task = Task::new(
            id.clone(),
            format!("researcher-{}", i + 1),
            Phase::Research,
            Tier::Execution,
            model_for(Tier::Execution),
            item,
        )
        .with_dependencies(vec![PLANNER_ID.to_string()])
        .with_budget(matrix.budget_for(Tier::Execution, Tier::Analytical));
        if !research_critical {
            task = task.non_critical();
        }
        research_ids.push(id);
        tasks.push(task);
    }

    tasks.push(
        Task::new(
            SYNTHESIS_ID,
            "synthesizer",
            Phase::Synthesis,
            Tier::Analytical,
            model_for(Tier::Analytical),
            description,
        )
        .with_dependencies(research_ids)
        .with_budget(matrix.budget_for(Tier::Analytical, Tier::Strategic)),
    );

    tasks.push(
        Task::new(
            CRITIQUE_ID,
            "critic",
            Phase::Critique,
            Tier::Strategic,
            model_for(Tier::Strategic),
            description,
        )
        .with_dependencies(vec![SYNTHESIS_ID.to_string()])
        .with_budget(matrix.budget_for(Tier::Strategic, Tier::Orchestrator)),
    );

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bullets_become_items() {
        let items = split_items(
            "Compare vendors:\n- pricing\n* support SLAs\n3) data residency\n",
            4,
        );
        assert_eq!(items, vec!["pricing", "support SLAs", "data residency"]);
    }

    #[test]
    fn test_sentences_when_no_bullets() {
        let items = split_items("Find the cheapest plan. Check its limits! Is it GDPR ready?", 4);
        assert_eq!(
            items,
            vec!["Find the cheapest plan", "Check its limits", "Is it GDPR ready"]
        );
    }

    #[test]
    fn test_surplus_items_are_grouped() {
        let items = split_items("- a\n- b\n- c\n- d\n- e", 2);
        assert_eq!(items, vec!["a; b; c", "d; e"]);
    }

    #[test]
    fn test_blank_description_yields_one_item() {
        assert_eq!(split_items("   ", 4), vec![""]);
    }

    #[test]
    fn test_graph_shape() {
        let request = WorkflowRequest::new("- a\n- b", 1.0);
        let tasks = decompose(
            &request,
            &EngineConfig::default(),
            &BudgetMatrix::default(),
            |t| t.default_model().to_string(),
        );
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["planner", "research-1", "research-2", "synthesis", "critique"]);

        let synthesis = &tasks[3];
        assert_eq!(synthesis.depends_on, vec!["research-1", "research-2"]);
        assert_eq!(synthesis.tier, Tier::Analytical);
        assert_eq!(synthesis.token_budget, 1000);
        // Several research items: each one is expendable.
        assert!(!tasks[1].critical && !tasks[2].critical);
        assert!(tasks[0].critical && tasks[3].critical && tasks[4].critical);
        assert_eq!(tasks[1].token_budget, 500);
    }

    #[test]
    fn test_single_research_item_is_critical() {
        let request = WorkflowRequest::new("Summarise the incident.", 1.0);
        let tasks = decompose(
            &request,
            &EngineConfig::default(),
            &BudgetMatrix::default(),
            |t| t.default_model().to_string(),
        );
        assert_eq!(tasks.len(), 4);
        assert!(tasks[1].critical);
    }
}
