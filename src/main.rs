use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use waypoint::config::{CliOverrides, EngineSettings};
use waypoint::decision::DecisionChoice;

mod cmd;

/// Exit code for errors that stop the command itself (bad input, I/O).
const EXIT_ERROR: u8 = 4;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(version, about = "Durable, phase-gated workflow orchestration")]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// State directory. Overrides waypoint.toml and WAYPOINT_STATE_DIR.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Parallel-phase concurrency limit
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Budget ceiling for a new run, or a raised ceiling on resume
    #[arg(long, global = true)]
    pub budget_ceiling: Option<u64>,

    /// Stay running and wait for decisions instead of exiting
    #[arg(long, global = true)]
    pub wait: bool,

    /// Machine-readable output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run from a run definition file
    Start {
        definition: PathBuf,
        /// Run id (defaults to a generated one)
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Resume a run from its last checkpoint
    Resume { run_id: String },
    /// Show a run's status
    Status { run_id: String },
    /// Abort a run
    Abort { run_id: String },
    /// Resolve a pending decision (retry, advance, abort)
    Decide {
        run_id: String,
        decision_id: String,
        /// Prompts for a choice when omitted
        choice: Option<DecisionChoice>,
    },
    /// List runs in the state directory
    List,
    /// Move a finished run out of the state directory
    Archive {
        run_id: String,
        /// Archive even if the run has not finished
        #[arg(long)]
        force: bool,
    },
    /// Show a run's attempt log and gate history
    History { run_id: String },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default waypoint.toml
    Init,
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<u8> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Config { command } = &cli.command {
        cmd::cmd_config(&project_dir, command.clone())?;
        return Ok(0);
    }

    let settings = EngineSettings::load(&project_dir)?.with_cli_overrides(&CliOverrides {
        state_dir: cli.state_dir.clone(),
        concurrency: cli.concurrency,
        budget_ceiling: cli.budget_ceiling,
        wait_for_decisions: cli.wait,
    });

    match &cli.command {
        Commands::Start { definition, run_id } => {
            cmd::cmd_start(&settings, definition, run_id.clone(), cli.json).await
        }
        Commands::Resume { run_id } => cmd::cmd_resume(&settings, run_id, cli.json).await,
        Commands::Status { run_id } => cmd::cmd_status(&settings, run_id, cli.json),
        Commands::Abort { run_id } => cmd::cmd_abort(&settings, run_id, cli.json),
        Commands::Decide {
            run_id,
            decision_id,
            choice,
        } => cmd::cmd_decide(&settings, run_id, decision_id, *choice).map(|_| 0),
        Commands::List => cmd::cmd_list(&settings, cli.json).map(|_| 0),
        Commands::Archive { run_id, force } => {
            cmd::cmd_archive(&settings, run_id, *force).map(|_| 0)
        }
        Commands::History { run_id } => cmd::cmd_history(&settings, run_id, cli.json).map(|_| 0),
        Commands::Config { .. } => Ok(0),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.verbose, cli.log_json) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(EXIT_ERROR);
    }

    match run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}
