//! Dry-run pipeline tests
//!
//! The scripted invoker must carry a workflow through every tier without a
//! network endpoint, and its failure overrides must surface as the engine's
//! documented gaps.

use std::sync::Arc;

use tiergate_agents::ScriptedInvoker;
use tiergate_coordination::{
    EventBus, InvocationError, Phase, PipelineConfig, TaskStatus, WorkflowEngine,
};

/// Test: default scripted replies pass every gate
#[tokio::test]
async fn test_dry_run_completes() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let engine =
        WorkflowEngine::new(PipelineConfig::default(), invoker.clone(), Arc::new(EventBus::new()))
            .unwrap();
    let wf = engine
        .create_workflow("Compare vendors:\n- pricing\n- support SLAs\n- data residency", 2.0)
        .await
        .unwrap();

    let done = engine.run_to_completion(&wf.id).await.unwrap();
    assert_eq!(done.phase, Phase::Complete);
    assert!(done.final_output.as_ref().unwrap().starts_with("Final report"));
    let research = done.task("research-3").unwrap();
    assert!(research.output.as_deref().unwrap().contains("data residency"));
    // planner + 3 researchers + synthesizer + critic + 3 judges
    assert_eq!(invoker.calls(), 9);
}

/// Test: a researcher that is down leaves a gap but the run still completes
#[tokio::test]
async fn test_dry_run_with_unavailable_researcher() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .with_failure("researcher-1", InvocationError::Unavailable("offline".into())),
    );
    let engine =
        WorkflowEngine::new(PipelineConfig::default(), invoker, Arc::new(EventBus::new())).unwrap();
    let wf = engine
        .create_workflow("- pricing\n- support SLAs", 2.0)
        .await
        .unwrap();

    let done = engine.run_to_completion(&wf.id).await.unwrap();
    assert_eq!(done.phase, Phase::Complete);
    let failed = done.task("research-1").unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.gap_notes[0].contains("offline"));
}

/// Test: a TOML config file on disk drives retries and model selection
#[tokio::test]
async fn test_dry_run_with_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiergate.toml");
    std::fs::write(
        &path,
        "[engine]\nmax_agent_retries = 0\n\n[models]\nhaiku = \"dry-haiku\"\n",
    )
    .unwrap();
    let config = PipelineConfig::load(Some(&path)).unwrap();
    assert_eq!(config.engine.max_agent_retries, 0);

    let invoker = Arc::new(
        ScriptedInvoker::new()
            .with_failure("researcher-1", InvocationError::Unavailable("offline".into())),
    );
    let engine = WorkflowEngine::new(config, invoker, Arc::new(EventBus::new())).unwrap();
    let wf = engine
        .create_workflow("- pricing\n- support SLAs", 2.0)
        .await
        .unwrap();
    assert_eq!(wf.task("research-2").unwrap().model, "dry-haiku");

    let done = engine.run_to_completion(&wf.id).await.unwrap();
    assert_eq!(done.phase, Phase::Complete);
    // No retries configured: the failing researcher is tried once.
    assert_eq!(done.task("research-1").unwrap().attempts, 1);
}
