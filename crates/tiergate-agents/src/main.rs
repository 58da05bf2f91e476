use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use tiergate_agents::{init_tracing, parse_snake_case, HttpInvoker, ScriptedInvoker};
use tiergate_coordination::gates::{BlastRadius, Domain, Impact, Reversibility};
use tiergate_coordination::oracle::TieredTokenOracle;
use tiergate_coordination::{
    CompressionGate, EscalationStatus, EventBus, FanoutSink, JsonlAuditLog, PanelSizeSelector,
    PipelineConfig, ResolutionDecision, SharedInvoker, SharedSink, TaskMetadata, Tier,
    WorkflowEngine, WorkflowRequest, WorkflowSnapshot,
};

#[derive(Parser, Debug)]
#[command(name = "tiergate", version, about = "Tiered LLM agent orchestration with gated handoffs")]
struct Cli {
    /// Pipeline configuration (TOML). TIERGATE_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow end to end.
    Run(RunArgs),
    /// Evaluate a handoff against the compression gate.
    Gate(GateArgs),
    /// Compute the judge panel size for a risk profile.
    PanelSize(PanelSizeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Task description. Bullet lines become separate research items.
    description: Option<String>,

    /// Read the description from a file instead.
    #[arg(long, conflicts_with = "description")]
    file: Option<PathBuf>,

    /// Budget limit for the whole workflow.
    #[arg(long, default_value_t = 1.0)]
    budget: f64,

    /// Use scripted agents instead of the HTTP endpoint.
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    risk: RiskArgs,

    /// Request a larger judge panel than the risk score gives.
    #[arg(long)]
    panel_size: Option<usize>,

    /// Fail the workflow if any research task fails.
    #[arg(long)]
    critical_research: bool,

    /// Append audit events to this JSONL file.
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// What to do when an escalation suspends the workflow.
    #[arg(long, value_enum, default_value_t = EscalationPolicy::Stop)]
    on_escalation: EscalationPolicy,

    /// Upper bound on automatic escalation resolutions.
    #[arg(long, default_value_t = 3)]
    max_resolutions: usize,

    /// Print the final snapshot as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug, Default)]
struct RiskArgs {
    /// reversible | easy | moderate | difficult | irreversible
    #[arg(long)]
    reversibility: Option<String>,
    /// internal | team | organization | external
    #[arg(long)]
    blast_radius: Option<String>,
    /// business | software | hardware | mixed
    #[arg(long)]
    domain: Option<String>,
    /// low | moderate | high | severe | critical
    #[arg(long)]
    impact: Option<String>,
}

impl RiskArgs {
    fn is_empty(&self) -> bool {
        self.reversibility.is_none()
            && self.blast_radius.is_none()
            && self.domain.is_none()
            && self.impact.is_none()
    }

    /// Metadata with unspecified axes at their lowest-risk value.
    fn metadata(&self) -> Result<TaskMetadata> {
        let low = TaskMetadata::low_risk();
        Ok(TaskMetadata::new(
            opt_parse::<Reversibility>(&self.reversibility)?.unwrap_or(low.reversibility),
            opt_parse::<BlastRadius>(&self.blast_radius)?.unwrap_or(low.blast_radius),
            opt_parse::<Domain>(&self.domain)?.unwrap_or(low.domain),
            opt_parse::<Impact>(&self.impact)?.unwrap_or(low.impact),
        ))
    }
}

fn opt_parse<T: serde::de::DeserializeOwned>(value: &Option<String>) -> Result<Option<T>> {
    value.as_deref().map(parse_snake_case::<T>).transpose()
}

#[derive(Args, Debug)]
struct GateArgs {
    /// Source tier (orchestrator, strategic, analytical, execution or a family alias).
    #[arg(long)]
    source: String,
    /// Target tier.
    #[arg(long)]
    target: String,
    /// Payload file; stdin when omitted.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PanelSizeArgs {
    #[command(flatten)]
    risk: RiskArgs,
    /// Requested panel size (upward only).
    #[arg(long = "override")]
    requested: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EscalationPolicy {
    /// Leave the workflow suspended and report the escalation.
    Stop,
    Proceed,
    RetryPhase,
    Abort,
}

impl EscalationPolicy {
    fn decision(self) -> Option<ResolutionDecision> {
        match self {
            Self::Stop => None,
            Self::Proceed => Some(ResolutionDecision::Proceed),
            Self::RetryPhase => Some(ResolutionDecision::RetryPhase),
            Self::Abort => Some(ResolutionDecision::Abort),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = PipelineConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "failed to load configuration{}",
            cli.config
                .as_deref()
                .map(|p| format!(" from {}", p.display()))
                .unwrap_or_default()
        )
    })?;

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Gate(args) => gate(&config, args),
        Command::PanelSize(args) => panel_size(args),
    }
}

async fn run(config: PipelineConfig, args: RunArgs) -> Result<()> {
    let description = match (&args.description, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("a description or --file is required"),
    };

    let invoker: SharedInvoker = if args.dry_run {
        info!("Dry run: using scripted agents");
        Arc::new(ScriptedInvoker::new())
    } else {
        let http = HttpInvoker::from_env();
        info!(endpoint = %http.endpoint(), "Using HTTP agents");
        Arc::new(http)
    };

    let bus = Arc::new(EventBus::new());
    let mut fanout = FanoutSink::new().with_sink(bus.clone());
    if let Some(path) = &args.audit_log {
        fanout = fanout.with_sink(Arc::new(JsonlAuditLog::new(path)));
    }
    let sink: SharedSink = Arc::new(fanout);

    let engine =
        WorkflowEngine::new(config, invoker, sink).context("failed to build workflow engine")?;

    let mut request = WorkflowRequest::new(description, args.budget);
    if !args.risk.is_empty() {
        request = request.with_metadata(args.risk.metadata()?);
    }
    if let Some(size) = args.panel_size {
        request = request.with_panel_override(size);
    }
    if args.critical_research {
        request = request.with_critical_research();
    }

    let created = engine
        .create_workflow_with(request)
        .await
        .context("failed to create workflow")?;
    info!(workflow_id = %created.id, tasks = created.tasks.len(), "Workflow started");

    let mut snapshot = engine
        .run_to_completion(&created.id)
        .await
        .context("workflow stopped")?;

    let mut resolutions = 0;
    while let Some(escalation_id) = snapshot.pending_escalation.clone() {
        let Some(decision) = args.on_escalation.decision() else {
            break;
        };
        if resolutions >= args.max_resolutions {
            warn!(resolutions, "Automatic resolution limit reached; leaving workflow suspended");
            break;
        }
        resolutions += 1;
        let resolved = engine
            .resolve_escalation(&escalation_id, decision, Some("resolved by CLI policy".into()))
            .await
            .with_context(|| format!("failed to resolve escalation {escalation_id}"))?;
        snapshot = if resolved.phase.is_terminal() {
            resolved
        } else {
            engine
                .run_to_completion(&created.id)
                .await
                .context("workflow stopped")?
        };
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_summary(&snapshot);
        for view in engine.get_escalations(Some(EscalationStatus::Pending)) {
            println!(
                "pending escalation {} ({}): {}",
                view.request.id, view.request.reason, view.request.detail
            );
        }
        if let Some(path) = &args.audit_log {
            println!("audit log: {}", path.display());
        }
    }
    Ok(())
}

fn print_summary(snapshot: &WorkflowSnapshot) {
    println!("workflow {} → {}", snapshot.id, snapshot.phase);
    println!(
        "spent ${:.4} of ${:.4} ({})",
        snapshot.cumulative_cost, snapshot.budget_limit, snapshot.breaker.state
    );
    for task in &snapshot.tasks {
        println!(
            "  {:<12} {:<20} attempts={} retries={} ${:.4}{}",
            task.id,
            task.status.to_string(),
            task.attempts,
            task.retry_count,
            task.cost,
            if task.gap_documented { "  [gap]" } else { "" }
        );
        for note in &task.gap_notes {
            println!("      gap: {note}");
        }
    }
    if let Some(reason) = &snapshot.terminal_reason {
        println!("reason: {reason}");
    }
    if let Some(output) = &snapshot.final_output {
        println!("\n{output}");
    }
}

fn gate(config: &PipelineConfig, args: GateArgs) -> Result<()> {
    let source: Tier = args
        .source
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --source: {e}"))?;
    let target: Tier = args
        .target
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --target: {e}"))?;
    let payload = read_payload(args.file.as_deref())?;

    let oracle = Arc::new(TieredTokenOracle::from_config(
        &config.oracle,
        config.pricing.clone(),
    ));
    let gate = CompressionGate::from_config(&config.compression, oracle)
        .context("invalid compression configuration")?;
    let decision = gate.evaluate(&payload, source, target);
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn read_payload(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("failed to read {}", p.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("failed to read payload from stdin")?;
            Ok(text)
        }
    }
}

fn panel_size(args: PanelSizeArgs) -> Result<()> {
    let metadata = args.risk.metadata()?;
    let selection = PanelSizeSelector::default()
        .select_with_override(&metadata, args.requested)
        .context("panel size request refused")?;
    println!("{}", serde_json::to_string_pretty(&selection)?);
    Ok(())
}
