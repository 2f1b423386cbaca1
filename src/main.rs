use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use autopack::agents::{CommandAgent, ProviderRegistry};
use autopack::approval::{ApprovalBroker, ApprovalResponse};
use autopack::config::Config;
use autopack::doctor::Doctor;
use autopack::learning::LearningStore;
use autopack::orchestrator::{PhaseServices, RunOrchestrator};
use autopack::phase::{BuildPlan, RunState};
use autopack::store::Store;

// Batch exit codes.
const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_PLAN_INVALID: u8 = 2;
const EXIT_ABORTED: u8 = 3;
const EXIT_RUN_FAILED: u8 = 4;
const EXIT_INFRA: u8 = 5;

#[derive(Parser)]
#[command(name = "autopack")]
#[command(version, about = "Autonomous multi-phase build orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a build plan; prints the new run id
    Submit {
        /// Path to the plan JSON file
        plan: PathBuf,
        /// Validate the plan without creating a run
        #[arg(long)]
        dry_run: bool,
    },
    /// Execute a submitted run to completion
    Run {
        run_id: String,
    },
    /// Query run state and per-phase progress
    Status {
        run_id: String,
    },
    /// Submit an approval decision for a pending request
    Approve {
        request_id: String,
        /// approve | reject
        #[arg(long, default_value = "approve")]
        decision: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Abort a run
    Abort {
        run_id: String,
    },
    /// Inspect a phase's error history and decision audit trail
    History {
        run_id: String,
        phase_id: String,
    },
    /// View or validate configuration
    Config {
        #[arg(long)]
        validate: bool,
    },
}

fn load_config(cli_project_dir: Option<PathBuf>, verbose: bool) -> Result<Config> {
    let project_dir = match cli_project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let config = Config::load(project_dir, verbose)?;
    config.ensure_directories()?;
    Ok(config)
}

fn build_services(config: &Config, store: Arc<Store>) -> PhaseServices {
    let cheap = std::time::Duration::from_secs(config.settings.agent_timeout_seconds_cheap);
    let strong = std::time::Duration::from_secs(config.settings.agent_timeout_seconds_strong);
    let workdir = config.project_dir.clone();

    let builder = Arc::new(CommandAgent::new(
        config.agents.builder_cmd.clone(),
        workdir.clone(),
        cheap,
        strong,
        "builder",
    ));
    let auditor = Arc::new(CommandAgent::new(
        config.agents.auditor_cmd.clone(),
        workdir.clone(),
        cheap,
        strong,
        "auditor",
    ));
    let doctor_agent = Arc::new(CommandAgent::new(
        config.agents.doctor_cmd.clone(),
        workdir.clone(),
        cheap,
        strong,
        "doctor",
    ));
    let replanner = Arc::new(CommandAgent::new(
        config.agents.replan_cmd.clone(),
        workdir,
        cheap,
        strong,
        "replan",
    ));

    let broker = Arc::new(ApprovalBroker::new(
        Arc::clone(&store),
        vec![],
        std::time::Duration::from_secs(config.settings.approval_sweep_interval_seconds),
    ));
    let learning = LearningStore::new(
        Arc::clone(&store),
        config.settings.hint_promotion_min_occurrences,
    );

    PhaseServices {
        config: config.clone(),
        store,
        builder,
        auditor,
        doctor: Doctor::new(doctor_agent, config.settings.clone()),
        replanner,
        broker,
        learning,
        providers: Arc::new(ProviderRegistry::new(vec!["primary".into()])),
    }
}

async fn cmd_submit(config: &Config, plan_path: &PathBuf, dry_run: bool) -> Result<u8> {
    let plan = match BuildPlan::load(plan_path) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("{} {:#}", style("Plan error:").red(), e);
            return Ok(EXIT_PLAN_INVALID);
        }
    };
    if let Err(e) = plan.validate() {
        eprintln!("{} {:#}", style("Plan invalid:").red(), e);
        return Ok(EXIT_PLAN_INVALID);
    }

    if dry_run {
        println!(
            "{} {} ({} phases)",
            style("Plan valid:").green(),
            plan.name,
            plan.phases.len()
        );
        return Ok(EXIT_OK);
    }

    let store = Arc::new(Store::open(&config.db_path)?);
    let services = build_services(config, store);
    let orchestrator = RunOrchestrator::new(services);
    let run_id = orchestrator.submit(plan)?;
    println!("{}", run_id);
    Ok(EXIT_OK)
}

async fn cmd_run(config: &Config, run_id: &str) -> Result<u8> {
    let store = Arc::new(Store::open(&config.db_path)?);
    let services = build_services(config, store);
    let broker = Arc::clone(&services.broker);
    let sweeper = broker.spawn_sweeper();

    let orchestrator = RunOrchestrator::new(services);
    let state = orchestrator.execute(run_id).await?;
    sweeper.abort();

    match state {
        RunState::Complete => {
            println!("{} run {}", style("Complete:").green(), run_id);
            Ok(EXIT_OK)
        }
        RunState::Paused => {
            println!("{} run {} (budget limit)", style("Paused:").yellow(), run_id);
            Ok(EXIT_OK)
        }
        RunState::Aborted => {
            println!("{} run {}", style("Aborted:").yellow(), run_id);
            Ok(EXIT_ABORTED)
        }
        _ => {
            println!("{} run {}", style("Failed:").red(), run_id);
            Ok(EXIT_RUN_FAILED)
        }
    }
}

fn cmd_status(config: &Config, run_id: &str) -> Result<u8> {
    let store = Store::open(&config.db_path)?;
    let Some(run) = store.get_run(run_id)? else {
        eprintln!("{} unknown run {}", style("Error:").red(), run_id);
        return Ok(EXIT_USAGE);
    };

    println!("run:      {}", run.run_id);
    println!("plan:     {} ({})", run.plan.name, run.plan_hash);
    println!("state:    {}", run.state.as_str());
    println!(
        "tokens:   {}  doctor: {}  replans: {}  attempts: {}",
        run.counters.tokens_consumed,
        run.counters.doctor_invocations,
        run.counters.replans,
        run.counters.attempts
    );
    if let Some(failure) = &run.failure {
        println!("failure:  {}", failure);
    }

    println!();
    for record in store.list_phases(run_id)? {
        let state_styled = match record.state.as_str() {
            "complete" => style(record.state.as_str()).green(),
            "failed" | "blocked" => style(record.state.as_str()).red(),
            _ => style(record.state.as_str()).dim(),
        };
        println!(
            "  {:<12} {:<18} attempts={} escalation={}",
            record.spec.id, state_styled, record.retry_attempt, record.escalation_level
        );
    }
    Ok(EXIT_OK)
}

fn cmd_approve(config: &Config, request_id: &str, decision: &str, actor: &str) -> Result<u8> {
    let approve = match decision {
        "approve" => true,
        "reject" => false,
        other => {
            eprintln!("{} decision must be approve|reject, got {}", style("Error:").red(), other);
            return Ok(EXIT_USAGE);
        }
    };

    let store = Arc::new(Store::open(&config.db_path)?);
    let broker = ApprovalBroker::new(Arc::clone(&store), vec![], std::time::Duration::from_secs(1));
    let accepted = broker.submit_response(&ApprovalResponse {
        request_id: request_id.to_string(),
        approve,
        actor: actor.to_string(),
        timestamp: chrono::Utc::now(),
    })?;

    if accepted {
        println!("{} {} {}", style("Recorded:").green(), decision, request_id);
    } else {
        println!(
            "{} request {} was already resolved",
            style("Ignored:").yellow(),
            request_id
        );
    }
    Ok(EXIT_OK)
}

fn cmd_abort(config: &Config, run_id: &str) -> Result<u8> {
    let store = Store::open(&config.db_path)?;
    let Some(mut run) = store.get_run(run_id)? else {
        eprintln!("{} unknown run {}", style("Error:").red(), run_id);
        return Ok(EXIT_USAGE);
    };
    if run.state.is_terminal() {
        println!("run {} already {}", run_id, run.state.as_str());
        return Ok(EXIT_OK);
    }
    run.state = RunState::Aborted;
    run.ended_at = Some(chrono::Utc::now());
    store.save_run(&run)?;
    println!("{} run {}", style("Abort requested:").yellow(), run_id);
    Ok(EXIT_ABORTED)
}

fn cmd_history(config: &Config, run_id: &str, phase_id: &str) -> Result<u8> {
    let store = Store::open(&config.db_path)?;
    let Some(record) = store.get_phase(run_id, phase_id)? else {
        eprintln!(
            "{} unknown phase {} in run {}",
            style("Error:").red(),
            phase_id,
            run_id
        );
        return Ok(EXIT_USAGE);
    };

    println!("phase:           {}", record.spec.id);
    println!("state:           {}", record.state.as_str());
    println!("goal:            {}", record.spec.goal);
    println!("original intent: {}", record.original_intent);
    println!(
        "attempts={} escalation={} replans={} doctor={}",
        record.retry_attempt, record.escalation_level, record.replans, record.doctor_invocations
    );

    if !record.error_history.is_empty() {
        println!("\n{}", style("error history:").bold());
        for err in &record.error_history {
            println!(
                "  [{}] {} {}",
                err.timestamp.format("%H:%M:%S"),
                style(err.category.as_str()).red(),
                err.normalized_message
            );
        }
    }

    let trail = store.audit_trail(run_id, phase_id)?;
    if !trail.is_empty() {
        println!("\n{}", style("decision trail:").bold());
        for entry in trail {
            println!(
                "  [{}] {:<20} {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.kind,
                entry.detail
            );
        }
    }
    Ok(EXIT_OK)
}

fn cmd_config(config: &Config, validate: bool) -> Result<u8> {
    if validate {
        config.settings.validate()?;
        println!("{}", style("Configuration valid").green());
        return Ok(EXIT_OK);
    }
    println!("project dir: {}", config.project_dir.display());
    println!("database:    {}", config.db_path.display());
    let rendered = toml::to_string_pretty(&config.settings).unwrap_or_default();
    println!("\n[settings]\n{}", rendered);
    Ok(EXIT_OK)
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let config = load_config(cli.project_dir.clone(), cli.verbose)?;

    match &cli.command {
        Commands::Submit { plan, dry_run } => cmd_submit(&config, plan, *dry_run).await,
        Commands::Run { run_id } => cmd_run(&config, run_id).await,
        Commands::Status { run_id } => cmd_status(&config, run_id),
        Commands::Approve {
            request_id,
            decision,
            actor,
        } => cmd_approve(&config, request_id, decision, actor),
        Commands::Abort { run_id } => cmd_abort(&config, run_id),
        Commands::History { run_id, phase_id } => cmd_history(&config, run_id, phase_id),
        Commands::Config { validate } => cmd_config(&config, *validate),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version print through clap's own rendering.
            if e.use_stderr() {
                eprintln!("{}", e);
                return ExitCode::from(EXIT_USAGE);
            }
            println!("{}", e);
            return ExitCode::from(EXIT_OK);
        }
    };

    let filter = if cli.verbose { "autopack=debug" } else { "autopack=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red(), e);
            ExitCode::from(EXIT_INFRA)
        }
    }
}
