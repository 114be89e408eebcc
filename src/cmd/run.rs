//! Driving runs: `waypoint start` and `waypoint resume`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use waypoint::config::EngineSettings;
use waypoint::gates::GateEvaluator;
use waypoint::orchestrator::{RunController, RunEvent, RunReport};
use waypoint::phase::{RunDefinition, validate_id};
use waypoint::providers::{RubricScorer, VerificationProvider};
use waypoint::shell::{CommandScorer, HttpVerifier, ShellExecutor};
use waypoint::store::FileStore;

use super::print_report;

fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}", &id[..8])
}

fn gate_evaluator(settings: &EngineSettings) -> Result<GateEvaluator> {
    let shell = settings.shell_settings();
    let scorer: Arc<dyn RubricScorer> = Arc::new(CommandScorer::new(shell.clone()));
    let timeout = shell.timeout.unwrap_or(std::time::Duration::from_secs(30));
    let verifier: Arc<dyn VerificationProvider> = Arc::new(HttpVerifier::new(timeout)?);
    Ok(GateEvaluator::new()
        .with_scorer(Some(scorer))
        .with_verifier(Some(verifier))
        .with_shell(shell))
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::PhaseEntered {
            phase,
            attempt,
            created,
        } => {
            if *attempt == 0 {
                println!(
                    "{} {} ({} items created)",
                    console::style("▶").cyan(),
                    console::style(phase).bold(),
                    created
                );
            } else {
                println!(
                    "{} {} retry {}",
                    console::style("▶").cyan(),
                    console::style(phase).bold(),
                    attempt
                );
            }
        }
        RunEvent::PhaseDispatched {
            phase,
            attempts,
            succeeded,
        } => {
            println!(
                "  {} {}: {} attempts, {} succeeded",
                console::style("·").dim(),
                phase,
                attempts,
                succeeded
            );
        }
        RunEvent::GateEvaluated {
            gate,
            total,
            threshold,
            passed,
            ..
        } => {
            let verdict = if *passed {
                console::style("passed").green()
            } else {
                console::style("failed").red()
            };
            println!(
                "  {} gate {} {} ({} / {})",
                console::style("·").dim(),
                gate,
                verdict,
                total,
                threshold
            );
        }
        RunEvent::PhaseRetrying {
            requeued, revised, ..
        } => {
            println!(
                "  {} retrying: {} requeued, {} revised",
                console::style("↻").yellow(),
                requeued.len(),
                revised.len()
            );
        }
        RunEvent::PhaseAdvanced { phase, overridden } => {
            let note = if *overridden { " (operator override)" } else { "" };
            println!("{} {}{}", console::style("✓").green(), phase, note);
        }
        RunEvent::PhaseBlocked { phase, reason } => {
            println!("{} {}: {}", console::style("✗").red(), phase, reason);
        }
        RunEvent::DecisionRequired { decision_id, .. } => {
            println!(
                "  {} decision {} is waiting (retry, advance, abort)",
                console::style("?").yellow().bold(),
                decision_id
            );
        }
        RunEvent::RunHalted { status, reason } => match reason {
            Some(reason) => println!("{} {} ({})", console::style("■").yellow(), status, reason),
            None => println!("{} {}", console::style("■").yellow(), status),
        },
        RunEvent::RunCompleted => {
            println!("{}", console::style("Run complete").green().bold());
        }
    }
}

/// Drive a controller to its next pause, printing progress and forwarding Ctrl-C as an abort.
async fn drive(controller: RunController, resume: bool, json: bool) -> Result<RunReport> {
    let (event_tx, mut event_rx) = mpsc::channel::<RunEvent>(100);
    let controller = controller.with_event_channel(event_tx);

    let display_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !json {
                print_event(&event);
            }
        }
    });

    let handle = controller.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", console::style("Interrupted; aborting run").yellow());
            if let Err(e) = handle.abort() {
                eprintln!("Failed to abort: {}", e);
            }
        }
    });

    let report = if resume {
        controller.resume().await
    } else {
        controller.start().await
    };
    interrupt.abort();
    // Dropping the controller closes the channel so the printer drains and exits.
    drop(controller);
    display_handle.await.ok();
    Ok(report?)
}

pub async fn cmd_start(
    settings: &EngineSettings,
    definition_path: &Path,
    run_id: Option<String>,
    json: bool,
) -> Result<u8> {
    let definition = RunDefinition::load(definition_path)?;
    let run_id = run_id.unwrap_or_else(new_run_id);
    validate_id(&run_id).context("Invalid --run-id")?;
    let state_dir = settings.state_dir();
    if FileStore::exists(&state_dir, &run_id) {
        anyhow::bail!("Run {} already exists in {}", run_id, state_dir.display());
    }
    let store = Arc::new(
        FileStore::create(&state_dir, &run_id)
            .with_context(|| format!("Failed to create run {}", run_id))?,
    );

    let executor = Arc::new(ShellExecutor::new(settings.shell_settings()));
    let controller = RunController::new(store, definition, executor)?
        .with_options(settings.run_options())
        .with_gate_evaluator(gate_evaluator(settings)?);

    if !json {
        println!(
            "{} {} ({})",
            console::style("Starting run").bold().cyan(),
            console::style(&run_id).bold(),
            definition_path.display()
        );
    }
    let report = drive(controller, false, json).await?;
    print_report(&report, json)?;
    Ok(report.exit_code)
}

pub async fn cmd_resume(settings: &EngineSettings, run_id: &str, json: bool) -> Result<u8> {
    let store = Arc::new(FileStore::open(&settings.state_dir(), run_id)?);
    let executor = Arc::new(ShellExecutor::new(settings.shell_settings()));
    let controller = RunController::for_existing_run(store, executor)?
        .with_options(settings.run_options())
        .with_gate_evaluator(gate_evaluator(settings)?);

    if !json {
        println!(
            "{} {}",
            console::style("Resuming run").bold().cyan(),
            console::style(run_id).bold()
        );
    }
    let report = drive(controller, true, json).await?;
    print_report(&report, json)?;
    Ok(report.exit_code)
}
