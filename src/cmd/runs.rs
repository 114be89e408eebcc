//! Run inspection and control: status, list, history, archive, abort, decide.

use anyhow::{Context, Result};
use dialoguer::{Select, theme::ColorfulTheme};
use serde_json::json;

use waypoint::config::EngineSettings;
use waypoint::decision::DecisionChoice;
use waypoint::orchestrator::{abort_run, resolve_decision, run_status};
use waypoint::store::{AttemptLog, DecisionStore, FileStore, GateStore, RunStore};

use super::{print_json, print_report};

fn open(settings: &EngineSettings, run_id: &str) -> Result<FileStore> {
    FileStore::open(&settings.state_dir(), run_id)
        .with_context(|| format!("No run {} in {}", run_id, settings.state_dir().display()))
}

/// Prints the report; the exit code mirrors the run's state.
pub fn cmd_status(settings: &EngineSettings, run_id: &str, json: bool) -> Result<u8> {
    let store = open(settings, run_id)?;
    let report = run_status(&store)?;
    print_report(&report, json)?;
    Ok(report.exit_code)
}

pub fn cmd_list(settings: &EngineSettings, json: bool) -> Result<()> {
    let runs = FileStore::list_runs(&settings.state_dir())?;
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs in {}", settings.state_dir().display());
        return Ok(());
    }

    println!();
    println!(
        "{:<16} {:<20} {:<28} {:<14} {:>8}  Last checkpoint",
        "Run", "Definition", "Status", "Phase", "Budget"
    );
    println!(
        "{:<16} {:<20} {:<28} {:<14} {:>8}  ---------------",
        "---", "----------", "------", "-----", "------"
    );
    for run in &runs {
        println!(
            "{:<16} {:<20} {:<28} {:<14} {:>8}  {}",
            run.run_id,
            run.definition_name,
            run.status,
            run.current_phase_id.as_deref().unwrap_or("-"),
            run.budget_consumed,
            run.last_checkpoint_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}

pub fn cmd_history(settings: &EngineSettings, run_id: &str, json: bool) -> Result<()> {
    let store = open(settings, run_id)?;
    let attempts = store.attempts()?;
    let phases: Vec<String> = store
        .load_definition()?
        .map(|d| d.phases.into_iter().map(|p| p.id).collect())
        .unwrap_or_default();
    let mut gates = Vec::new();
    for phase in &phases {
        gates.extend(store.gate_history(phase)?);
    }
    let decisions = store.list_decisions()?;

    if json {
        return print_json(&json!({
            "run_id": run_id,
            "attempts": attempts,
            "gates": gates,
            "decisions": decisions,
        }));
    }

    println!();
    println!("{}", console::style("Attempts").bold());
    if attempts.is_empty() {
        println!("  (none)");
    }
    for attempt in &attempts {
        let outcome = match attempt.outcome.as_str() {
            "ok" => console::style(attempt.outcome.as_str()).green(),
            "cancelled" => console::style(attempt.outcome.as_str()).dim(),
            other => console::style(other).red(),
        };
        println!(
            "  {} {:<12} {:<20} #{:<3} {:<16} {:>6}ms {}",
            attempt.recorded_at.format("%H:%M:%S"),
            attempt.phase_id,
            attempt.item_id,
            attempt.attempt_count,
            outcome,
            attempt.duration_ms,
            attempt.error.as_deref().unwrap_or("")
        );
    }

    println!();
    println!("{}", console::style("Gates").bold());
    if gates.is_empty() {
        println!("  (none)");
    }
    for gate in &gates {
        let verdict = if gate.passed {
            console::style("passed").green()
        } else {
            console::style("failed").red()
        };
        println!(
            "  {:<12} {:<22} attempt {:<2} {} {} / {}",
            gate.phase_id, gate.gate_id, gate.attempt, verdict, gate.total, gate.threshold
        );
        if !gate.notes.is_empty() {
            println!("      {}", console::style(&gate.notes).dim());
        }
        if !gate.flagged_items.is_empty() {
            println!("      flagged: {}", gate.flagged_items.join(", "));
        }
    }

    if !decisions.is_empty() {
        println!();
        println!("{}", console::style("Decisions").bold());
        for decision in &decisions {
            let choice = decision
                .choice()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "pending".to_string());
            println!("  {:<16} {:<10} {}", decision.id, choice, decision.reason);
        }
    }
    println!();
    Ok(())
}

pub fn cmd_archive(settings: &EngineSettings, run_id: &str, force: bool) -> Result<()> {
    let store = open(settings, run_id)?;
    if !force {
        let report = run_status(&store)?;
        if !report.status.is_terminal() {
            anyhow::bail!(
                "Run {} is {}; abort it first or pass --force",
                run_id,
                report.status
            );
        }
    }
    drop(store);
    let target = FileStore::archive_run(&settings.state_dir(), run_id)?;
    println!("Archived {} to {}", run_id, target.display());
    Ok(())
}

pub fn cmd_abort(settings: &EngineSettings, run_id: &str, json: bool) -> Result<u8> {
    let store = open(settings, run_id)?;
    let report = abort_run(&store)?;
    if !report.status.is_terminal() && !json {
        println!(
            "{}",
            console::style("Abort requested; the driving process will stop shortly.").yellow()
        );
    }
    print_report(&report, json)?;
    Ok(report.exit_code)
}

fn prompt_choice(decision_id: &str) -> Result<DecisionChoice> {
    if !console::user_attended() {
        anyhow::bail!("Decision {} needs a choice: retry, advance or abort", decision_id);
    }
    let options: Vec<&str> = DecisionChoice::ALL.iter().map(|c| c.as_str()).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Resolve {}", decision_id))
        .items(&options)
        .default(0)
        .interact()?;
    DecisionChoice::ALL
        .get(selection)
        .copied()
        .context("Invalid selection")
}

pub fn cmd_decide(
    settings: &EngineSettings,
    run_id: &str,
    decision_id: &str,
    choice: Option<DecisionChoice>,
) -> Result<()> {
    let store = open(settings, run_id)?;
    let decision = store
        .get_decision(decision_id)?
        .with_context(|| format!("No decision {} in run {}", decision_id, run_id))?;
    if choice.is_none() {
        println!();
        println!("{} {}", console::style("Decision").bold(), decision.id);
        println!("  phase:  {}", decision.phase_id);
        println!("  reason: {}", decision.reason);
        println!();
    }
    let choice = match choice {
        Some(choice) => choice,
        None => prompt_choice(decision_id)?,
    };

    let decision = resolve_decision(&store, decision_id, choice)?;
    println!(
        "Decision {} resolved: {}",
        console::style(&decision.id).bold(),
        console::style(choice).cyan()
    );
    // A process started with --wait picks the decision up by itself.
    match choice {
        DecisionChoice::Abort => println!("Run `waypoint resume {}` to finalize the abort.", run_id),
        _ => println!("Run `waypoint resume {}` to continue.", run_id),
    }
    Ok(())
}
