pub mod audit;
pub mod config;
pub mod dag;
pub mod decision;
pub mod dispatch;
pub mod errors;
pub mod gates;
pub mod orchestrator;
pub mod phase;
pub mod providers;
pub mod rollback;
pub mod shell;
pub mod store;
pub mod work_item;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{DefinitionError, EngineError, StoreError};
pub use orchestrator::{RunController, RunHandle, RunOptions, RunReport};
pub use phase::{Phase, RunDefinition};
