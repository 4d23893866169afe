//! Step executor trait and execution types.
//!
//! Executors run one step's command in an isolated working directory and
//! report what happened. They record exit status; they never decide what a
//! failure means for the run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::id::RunId;
use crate::run::StepResult;
use crate::secret::SecretValue;
use crate::Result;

/// Default cap on captured output per step (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// A step ready to execute: everything interpolated, nothing left to resolve.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub run_id: RunId,
    pub step: String,
    /// Position of the step in its pipeline.
    pub index: usize,
    /// Shell command, run with `sh -c`.
    pub command: String,
    /// Hard limit on wall-clock time.
    pub timeout: Duration,
}

/// The environment a step executes in.
#[derive(Debug, Clone)]
pub struct ExecutionEnvironment {
    /// Working directory, inside the run's workspace.
    pub working_dir: PathBuf,
    /// Plain environment variables.
    pub vars: BTreeMap<String, String>,
    /// Environment variables carrying secret material. Masked in captured output.
    pub secrets: BTreeMap<String, SecretValue>,
    /// Cap on captured output; anything past it is dropped and marked.
    pub max_output_bytes: usize,
    /// Where to stream output lines as they arrive.
    pub log_tx: Option<mpsc::Sender<LogLine>>,
    /// Cancelled when the run is cancelled.
    pub cancel: CancellationToken,
}

impl ExecutionEnvironment {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            vars: BTreeMap::new(),
            secrets: BTreeMap::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            log_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: SecretValue) -> Self {
        self.secrets.insert(key.into(), value);
        self
    }

    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    pub fn with_log_channel(mut self, tx: mpsc::Sender<LogLine>) -> Self {
        self.log_tx = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A line of step output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for step executors.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run a step to completion, timeout or cancellation.
    ///
    /// Returns `Err` only when the step could not be started at all; a
    /// command that ran and failed is an `Ok` result with a failed outcome.
    async fn execute(&self, spec: &StepSpec, env: &ExecutionEnvironment) -> Result<StepResult>;
}
