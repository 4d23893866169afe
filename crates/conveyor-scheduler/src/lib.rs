//! Run orchestration for Conveyor.
//!
//! Turns trigger events into runs: provisions a workspace per run, resolves
//! the run's secrets, executes steps one at a time and hands artifacts from
//! producers to consumers.

pub mod artifacts;
pub mod orchestrator;
pub mod registry;
pub mod secrets;
pub mod workspace;

pub use artifacts::ArtifactChannel;
pub use orchestrator::{Dispatch, RunEvent, RunHandle, RunOrchestrator};
pub use registry::RunRegistry;
pub use secrets::{RunSecrets, SecretResolver};
pub use workspace::Workspace;
