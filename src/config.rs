//! Layered engine configuration.
//!
//! Settings are read from `waypoint.toml` in the project directory, then
//! overridden by environment variables, then by CLI flags.
//!
//! ```toml
//! [engine]
//! state_dir = ".waypoint"
//! concurrency_limit = 4
//! item_timeout_secs = 600
//! checkpoint_interval_secs = 30
//! wait_for_decisions = false
//!
//! [budget]
//! ceiling = 1000
//! unit = "cost"
//!
//! [shell]
//! transient_exit_codes = [75]
//! working_dir = "."
//! command_timeout_secs = 300
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::{BudgetUnit, DispatchConfig};
use crate::orchestrator::RunOptions;
use crate::shell::{EX_TEMPFAIL, ShellSettings};

pub const CONFIG_FILE: &str = "waypoint.toml";
pub const DEFAULT_STATE_DIR: &str = ".waypoint";

pub const ENV_STATE_DIR: &str = "WAYPOINT_STATE_DIR";
pub const ENV_CONCURRENCY: &str = "WAYPOINT_CONCURRENCY";
pub const ENV_BUDGET_CEILING: &str = "WAYPOINT_BUDGET_CEILING";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Where run state is persisted, relative to the project directory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Per-attempt timeout; 0 disables it
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Keep the process alive on a blocked phase until `decide` is called in-process
    #[serde(default)]
    pub wait_for_decisions: bool,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_item_timeout_secs() -> u64 {
    600
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            concurrency_limit: default_concurrency_limit(),
            item_timeout_secs: default_item_timeout_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            wait_for_decisions: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSection {
    /// No ceiling when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<u64>,
    #[serde(default)]
    pub unit: BudgetUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
    /// Defaults to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Timeout for gate, scorer and undo commands; 0 disables it
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_transient_exit_codes() -> Vec<i32> {
    vec![EX_TEMPFAIL]
}

fn default_command_timeout_secs() -> u64 {
    300
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            transient_exit_codes: default_transient_exit_codes(),
            working_dir: None,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// The complete waypoint.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub shell: ShellSection,
}

impl WaypointToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse waypoint.toml")
    }

    /// Load `waypoint.toml` from `project_dir`, or defaults if there is none.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize waypoint.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.engine.state_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_CONCURRENCY) {
            self.engine.concurrency_limit = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer", ENV_CONCURRENCY))?;
        }
        if let Some(value) = lookup(ENV_BUDGET_CEILING) {
            self.budget.ceiling = Some(
                value
                    .trim()
                    .parse()
                    .with_context(|| format!("{} must be an integer", ENV_BUDGET_CEILING))?,
            );
        }
        Ok(())
    }

    /// Warnings for settings that load but make little sense.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.engine.concurrency_limit == 0 {
            warnings.push("concurrency_limit is 0; parallel phases will run one item at a time".to_string());
        }
        if self.engine.checkpoint_interval_secs == 0 {
            warnings.push("checkpoint_interval_secs is 0; using 1 second".to_string());
        }
        if self.budget.ceiling == Some(0) {
            warnings.push("budget ceiling is 0; runs will halt before dispatching".to_string());
        }
        if self.shell.transient_exit_codes.contains(&0) {
            warnings.push("transient_exit_codes contains 0, which always means success".to_string());
        }
        warnings
    }
}

/// CLI flags that override file and environment settings.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub state_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub budget_ceiling: Option<u64>,
    pub wait_for_decisions: bool,
}

/// Resolved settings: file, then environment, then CLI.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub project_dir: PathBuf,
    pub toml: WaypointToml,
}

impl EngineSettings {
    /// Load from `project_dir` and the process environment.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let mut toml = WaypointToml::load_or_default(&project_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;
        Ok(Self { project_dir, toml })
    }

    pub fn with_cli_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(dir) = &overrides.state_dir {
            self.toml.engine.state_dir = dir.clone();
        }
        if let Some(limit) = overrides.concurrency {
            self.toml.engine.concurrency_limit = limit;
        }
        if let Some(ceiling) = overrides.budget_ceiling {
            self.toml.budget.ceiling = Some(ceiling);
        }
        if overrides.wait_for_decisions {
            self.toml.engine.wait_for_decisions = true;
        }
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.project_dir.join(CONFIG_FILE)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.toml.engine.state_dir)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let engine = &self.toml.engine;
        DispatchConfig {
            concurrency_limit: engine.concurrency_limit.max(1),
            item_timeout: secs(engine.item_timeout_secs),
            tick_interval: Duration::from_secs(engine.checkpoint_interval_secs.max(1)),
        }
    }

    pub fn shell_settings(&self) -> ShellSettings {
        let shell = &self.toml.shell;
        ShellSettings {
            working_dir: shell
                .working_dir
                .as_deref()
                .map(|dir| self.resolve(dir))
                .unwrap_or_else(|| self.project_dir.clone()),
            transient_exit_codes: shell.transient_exit_codes.clone(),
            timeout: secs(shell.command_timeout_secs),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            dispatch: self.dispatch_config(),
            budget_ceiling: self.toml.budget.ceiling,
            budget_unit: self.toml.budget.unit,
            wait_for_decisions: self.toml.engine.wait_for_decisions,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}
