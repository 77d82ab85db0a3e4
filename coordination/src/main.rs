//! CLI entry point for the autonomous coding-agent orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use coordination::data_model::{Goal, Plan};
use coordination::{OrchestratorConfig, WorkflowEngine, WorkflowStatus};

/// Drives an external LLM coding assistant through a bounded
/// plan/review/execute/verify workflow until the goal is achieved or the run
/// is stopped, times out, or exhausts verification attempts.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The goal to accomplish, in plain language.
    goal: String,

    /// Directory the worker process operates in.
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Path to a TOML config file overlaying the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wall-clock time budget for the run, in minutes.
    #[arg(long, default_value_t = 60)]
    time_limit_minutes: u64,

    /// Resume the most recent active session for this goal, if one exists.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Emit structured JSON logs instead of human-readable text.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Build the plan and print it without executing any steps.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let config = OrchestratorConfig::load(args.config.as_deref())
        .context("loading orchestrator configuration")?;

    let mut resumed_record = None;
    if args.resume {
        let store = coordination::persistence::PersistenceStore::new(&args.working_dir, config.persistence.clone());
        store.initialize().await.context("initializing persistence store")?;
        match store.find_resumable(&args.goal).await.context("scanning for a resumable session")? {
            Some(record) => {
                tracing::info!(session_id = %record.session_id, "resuming existing session");
                resumed_record = Some(record);
            }
            None => tracing::info!("no resumable session found for this goal, starting fresh"),
        }
    }

    let goal = Goal::new(args.goal.clone());
    let mut engine = WorkflowEngine::new(
        goal,
        args.working_dir.clone(),
        Duration::from_secs(args.time_limit_minutes * 60),
        config,
    );
    if let Some(record) = resumed_record {
        engine.resume_from(record);
    }

    if args.dry_run {
        let plan = engine.plan_only().await.context("planning the run")?;
        match plan {
            Some(plan) => print_plan(&plan),
            None => println!("no plan was produced"),
        }
        return Ok(());
    }

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("stop requested, finishing the current iteration");
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let report = engine.run().await.context("running the workflow")?;
    print_report(&report);

    std::process::exit(match report.status {
        WorkflowStatus::Completed => 0,
        _ => 1,
    });
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn print_plan(plan: &Plan) {
    println!("plan ({} step(s)):", plan.steps.len());
    for step in &plan.steps {
        println!("  {}. [{:?}] {}", step.number, step.complexity, step.description);
    }
}

fn print_report(report: &coordination::RunReport) {
    println!("status: {:?}", report.status);
    println!("overall progress: {}%", report.overall_progress);
    println!("phase transitions:");
    for transition in &report.transitions {
        println!("  {:?} -> {:?}: {}", transition.from, transition.to, transition.reason);
    }
}
