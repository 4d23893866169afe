//! KDL configuration parsing for Conveyor.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (conveyor.kdl)
//! - System configuration for the orchestrator
//! - Variable interpolation

pub mod error;
mod kdl_util;
pub mod pipeline;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use system::{SecretBackend, SystemConfig, load_system_config, parse_system_config};
pub use variables::{
    GitContext, PipelineContext, RunContext, StepContext, VariableContext,
};
