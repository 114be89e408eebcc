//! Run orchestration: phase sequencing, the run controller and its checkpoint state.

mod controller;
mod scheduler;
pub mod state;

pub use controller::{
    RunController, RunEvent, RunHandle, RunOptions, RunReport, abort_run, resolve_decision,
    run_status,
};
pub use scheduler::{PhaseScheduler, RetryPlan, unsettled_items};
pub use state::{HaltReason, PhaseOutcome, PhaseState, RunState, RunStatus};
