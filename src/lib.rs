pub mod anthropic;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod gate;
pub mod logging;
pub mod oracle;
pub mod outline;
pub mod pipeline;
pub mod prompts;
pub mod state_machine;
pub mod store;
pub mod ui;

pub use engine::Engine;
pub use error::{OracleError, PipelineError, StoreError};
pub use pipeline::{Pipeline, PipelineSettings, RunMode, RunOutcome};
