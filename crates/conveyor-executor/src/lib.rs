//! Step execution backends for Conveyor.
//!
//! The only backend runs steps as local shell processes. Each step gets its
//! own process group so timeouts and cancellation reach every child.

pub mod local;
pub mod output;

pub use conveyor_core::executor::{
    ExecutionEnvironment, LogLine, LogStream, StepExecutor, StepSpec,
};
pub use local::LocalProcessExecutor;
pub use output::{MASK, OutputBuffer};
