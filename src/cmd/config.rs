//! Configuration view and validation: `waypoint config`.

use anyhow::Result;
use std::path::Path;

use waypoint::config::{CONFIG_FILE, EngineSettings, WaypointToml};

use super::super::ConfigCommands;

fn print_effective(settings: &EngineSettings) {
    let toml = &settings.toml;
    println!("[engine]");
    println!("  state_dir = \"{}\"", settings.state_dir().display());
    println!("  concurrency_limit = {}", toml.engine.concurrency_limit);
    println!("  item_timeout_secs = {}", toml.engine.item_timeout_secs);
    println!(
        "  checkpoint_interval_secs = {}",
        toml.engine.checkpoint_interval_secs
    );
    println!("  wait_for_decisions = {}", toml.engine.wait_for_decisions);
    println!();
    println!("[budget]");
    match toml.budget.ceiling {
        Some(ceiling) => println!("  ceiling = {}", ceiling),
        None => println!("  ceiling = (none)"),
    }
    println!("  unit = \"{}\"", toml.budget.unit);
    println!();
    let shell = settings.shell_settings();
    println!("[shell]");
    println!("  transient_exit_codes = {:?}", shell.transient_exit_codes);
    println!("  working_dir = \"{}\"", shell.working_dir.display());
    println!(
        "  command_timeout_secs = {}",
        toml.shell.command_timeout_secs
    );
    println!();
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = project_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("Waypoint Configuration").bold());
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found; using defaults.", CONFIG_FILE);
            }
            println!("Effective values (with env overrides):");
            println!();
            let settings = EngineSettings::load(project_dir)?;
            print_effective(&settings);
            if !config_path.exists() {
                println!("Run 'waypoint config init' to create {}.", CONFIG_FILE);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }
            let settings = EngineSettings::load(project_dir)?;
            let warnings = settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", console::style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            WaypointToml::default().save(&config_path)?;
            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] state_dir, concurrency_limit, item_timeout_secs");
            println!("  - [budget] ceiling, unit");
            println!("  - [shell] transient_exit_codes, working_dir");
            println!();
        }
    }

    Ok(())
}
