//! CLI command implementations.
//!
//! | Module   | Commands handled                                          |
//! |----------|-----------------------------------------------------------|
//! | `run`    | `Start`, `Resume`                                         |
//! | `runs`   | `Status`, `List`, `History`, `Archive`, `Abort`, `Decide` |
//! | `config` | `Config`                                                  |

pub mod config;
pub mod run;
pub mod runs;

pub use config::cmd_config;
pub use run::{cmd_resume, cmd_start};
pub use runs::{cmd_abort, cmd_archive, cmd_decide, cmd_history, cmd_list, cmd_status};

use anyhow::Result;
use serde::Serialize;

use waypoint::orchestrator::{RunReport, RunStatus};

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Human or JSON rendering of a run report.
pub fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    let status = match report.status {
        RunStatus::Complete => console::style(report.status.as_str()).green().bold(),
        RunStatus::Aborted => console::style(report.status.as_str()).red().bold(),
        RunStatus::Blocked | RunStatus::AwaitingExternalDecision => {
            console::style(report.status.as_str()).yellow().bold()
        }
        _ => console::style(report.status.as_str()).cyan().bold(),
    };

    println!();
    println!("Run:        {} ({})", report.run_id, report.definition_name);
    println!("Status:     {}", status);
    if let Some(reason) = report.halt_reason {
        println!("Halted:     {}", reason);
    }
    if let Some(phase) = &report.current_phase_id {
        println!(
            "Phase:      {} ({:?}, retry {})",
            phase, report.phase_state, report.phase_attempt
        );
    }
    if !report.completed_phases.is_empty() {
        println!("Completed:  {}", report.completed_phases.join(", "));
    }
    match report.budget_ceiling {
        Some(ceiling) => println!(
            "Budget:     {} / {} {}",
            report.budget_consumed, ceiling, report.budget_unit
        ),
        None => println!(
            "Budget:     {} {} (no ceiling)",
            report.budget_consumed, report.budget_unit
        ),
    }
    if !report.items.is_empty() {
        let counts: Vec<String> = report
            .items
            .iter()
            .map(|(status, count)| format!("{} {}", count, status))
            .collect();
        println!("Items:      {}", counts.join(", "));
    }
    if let Some(decision) = &report.pending_decision {
        println!();
        println!(
            "{} {}: {}",
            console::style("Decision required").yellow().bold(),
            decision.id,
            decision.reason
        );
        println!(
            "  waypoint decide {} {} <retry|advance|abort>",
            report.run_id, decision.id
        );
    }
    println!();
    Ok(())
}
