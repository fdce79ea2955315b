use anyhow::{Context, Result, bail};
use clap::Parser;
use fsd::agent::{AgentInvoker, ProcessAgent};
use fsd::billing::{BillingConfig, BillingContext, BillingMode};
use fsd::config::{FsdConfig, RunPaths};
use fsd::executor::MilestoneExecutor;
use fsd::guard::GitProtectionGuard;
use fsd::orchestrator::FsdOrchestrator;
use fsd::output::{ConsoleReporter, InteractiveReporter, OutputHandler};
use fsd::pause::PauseController;
use fsd::planner::{AgentPlanner, Planner};
use fsd::process::{ProcessRunner, ToolRunner};
use fsd::qa::QaReviewer;
use fsd::state::StatePersistence;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fsd")]
#[command(version, about = "Self-driving build sessions for an agent CLI")]
struct Cli {
    /// What to build. Required unless --clear is given.
    goal: Option<String>,

    /// Hard ceiling on cumulative model cost in USD.
    #[arg(long, default_value_t = 10.0)]
    max_cost: f64,

    /// Persist a checkpoint every N completed milestones.
    #[arg(long, default_value_t = 1)]
    checkpoint: u32,

    /// Plan and show the milestones without executing anything.
    #[arg(long)]
    dry_run: bool,

    /// Resume from the persisted checkpoint.
    #[arg(long)]
    resume: bool,

    /// Skip the QA review pass after each milestone.
    #[arg(long)]
    skip_qa: bool,

    /// Delete the persisted checkpoint and exit.
    #[arg(long)]
    clear: bool,

    /// Plain console output instead of progress bars.
    #[arg(long)]
    no_ink: bool,

    /// Ask for confirmation before starting each milestone.
    #[arg(long)]
    approve: bool,

    #[arg(long)]
    project_dir: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    /// Assume yes for every confirmation prompt.
    #[arg(long)]
    yes: bool,
}

/// Billing mode/context come from the deployment environment, not flags.
fn billing_from_env() -> BillingConfig {
    let mode = match std::env::var("FSD_BILLING_MODE").as_deref() {
        Ok("managed") => BillingMode::Managed,
        _ => BillingMode::Byok,
    };
    let context = match std::env::var("FSD_BILLING_CONTEXT").as_deref() {
        Ok("cloud") => BillingContext::Cloud,
        _ => BillingContext::Cli,
    };
    BillingConfig { mode, context }
}

/// SIGUSR1 toggles the pause gate; the run suspends at the next safe
/// boundary.
#[cfg(unix)]
fn spawn_pause_listener(pause: Arc<PauseController>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut stream) = signal(SignalKind::user_defined1()) else {
            return;
        };
        while stream.recv().await.is_some() {
            if pause.is_paused() {
                pause.resume();
            } else {
                pause.pause();
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let paths = RunPaths::new(project_dir)?;

    let handler: Arc<dyn OutputHandler> = if cli.no_ink {
        Arc::new(ConsoleReporter::new(cli.verbose, cli.yes))
    } else {
        Arc::new(InteractiveReporter::new(cli.verbose, cli.yes))
    };

    if cli.clear {
        let persistence = StatePersistence::new(paths.state_file.clone());
        if !persistence.exists() {
            println!("No checkpoint to clear.");
            return Ok(());
        }
        if handler.confirm("Delete the persisted session checkpoint?") {
            persistence.clear()?;
            println!("Checkpoint cleared.");
        }
        return Ok(());
    }

    let Some(goal) = cli.goal.clone() else {
        bail!("a goal is required (or use --clear to drop the checkpoint)");
    };

    let tools = ProcessRunner;
    if !tools.check_installed(&paths.agent_cmd).await {
        bail!(
            "agent command '{}' not found; install it or set FSD_AGENT_CMD",
            paths.agent_cmd
        );
    }

    paths.ensure_directories()?;
    let agent: Arc<dyn AgentInvoker> = Arc::new(ProcessAgent::new(
        paths.agent_cmd.clone(),
        paths.project_dir.clone(),
    ));

    if cli.dry_run {
        let planner = AgentPlanner::new(agent);
        handler.planning_start();
        let plan = planner.plan(&goal, &*handler).await?;
        handler.planning_complete(&plan);
        handler.show_plan(&plan);
        return Ok(());
    }

    let config = FsdConfig {
        max_cost_usd: cli.max_cost,
        checkpoint_interval: cli.checkpoint,
        skip_qa: cli.skip_qa,
        sensitive_approval: cli.approve,
        ..Default::default()
    };

    // Project conventions fed into QA fix prompts, if the project keeps any.
    let project_rules =
        std::fs::read_to_string(paths.fsd_dir.join("rules.md")).unwrap_or_default();

    let pause = Arc::new(PauseController::new());
    #[cfg(unix)]
    spawn_pause_listener(Arc::clone(&pause));

    let mut orchestrator = FsdOrchestrator::new(
        config,
        billing_from_env(),
        paths.clone(),
        Arc::new(AgentPlanner::new(agent.clone())),
        MilestoneExecutor::new(agent.clone(), paths.clone(), goal.clone()),
        QaReviewer::new(agent, paths.qa_dir.clone(), project_rules),
        Box::new(GitProtectionGuard::new(
            paths.project_dir.clone(),
            paths.summary_file.clone(),
        )),
        pause,
        handler,
    );

    match orchestrator.run(&goal, cli.resume).await {
        Ok(_) => Ok(()),
        // The handler already reported the failure. Fatal aborts (budget,
        // planning, git protection, exhaustion) get their own exit code so
        // wrappers can tell them from declined confirmations and stalls.
        Err(e) => std::process::exit(if e.is_fatal() { 2 } else { 1 }),
    }
}
