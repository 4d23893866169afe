//! Core domain types and traits for the Conveyor deployment orchestrator.
//!
//! This crate contains:
//! - Run identifiers and error types
//! - Pipeline, step and reusable action definitions
//! - Trigger rules and their evaluation
//! - The run state machine and step results
//! - Step executor trait and execution environment
//! - Secret values and the secret store trait
//! - Repository snapshot accessors

pub mod artifact;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod run;
pub mod secret;
pub mod snapshot;
pub mod trigger;

pub use error::{Error, Result};
pub use id::RunId;
