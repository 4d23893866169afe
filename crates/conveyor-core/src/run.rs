//! Runs, step results and the run state machine.
//!
//! A [`Run`] moves `Pending → Running → {Succeeded, Failed, Cancelled}`.
//! Results are append-only and a terminal run rejects every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::id::RunId;
use crate::trigger::{RefKind, TriggerEvent};
use crate::{Error, Result};

/// Overall run status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Created, nothing provisioned yet.
    Pending,
    /// Workspace provisioned, steps executing.
    Running,
    /// Every step exited zero.
    Succeeded,
    /// Halted by a failure.
    Failed(RunFailure),
    /// Halted by an external cancellation request.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed(_) | RunStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed(_) => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RunFailure {
    #[error("secret '{name}' has no value in the secret store")]
    SecretNotFound { name: String },

    #[error("secret store could not provide '{name}': {message}")]
    SecretStore { name: String, message: String },

    #[error("step '{step}' {}", describe_exit(.exit_code))]
    StepExecution {
        step: String,
        exit_code: Option<i32>,
    },

    #[error("step '{step}' exceeded its timeout of {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },

    #[error("step '{step}' consumes artifact '{artifact}' before it was published")]
    ArtifactNotReady { step: String, artifact: String },

    #[error("step '{step}' declared artifact '{artifact}' at '{path}' but nothing was produced there")]
    ArtifactMissing {
        step: String,
        artifact: String,
        path: String,
    },

    #[error("artifact '{artifact}' was already published by step '{publisher}'")]
    ArtifactAlreadyPublished { artifact: String, publisher: String },

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("step '{step}' could not be executed: {message}")]
    Executor { step: String, message: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "exited without an exit code".to_string(),
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Output captured from a step, bounded in size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    /// Combined stdout and stderr, in arrival order.
    pub text: String,
    /// Bytes dropped after the buffer limit was reached.
    pub truncated_bytes: u64,
}

impl CapturedOutput {
    pub fn is_truncated(&self) -> bool {
        self.truncated_bytes > 0
    }
}

/// Record of a single executed step. Never rewritten once appended to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    /// Position of the step in the pipeline.
    pub index: usize,
    pub outcome: StepOutcome,
    pub exit_code: Option<i32>,
    pub output: CapturedOutput,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.outcome == StepOutcome::Succeeded
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// What triggered a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSummary {
    pub ref_name: String,
    pub ref_kind: RefKind,
    /// Pattern of the trigger rule that matched.
    pub matched_pattern: String,
}

impl TriggerSummary {
    pub fn new(event: &TriggerEvent, matched_pattern: impl Into<String>) -> Self {
        Self {
            ref_name: event.ref_name.clone(),
            ref_kind: event.ref_kind,
            matched_pattern: matched_pattern.into(),
        }
    }
}

/// One execution of a pipeline against one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    id: RunId,
    pipeline: String,
    trigger: TriggerSummary,
    status: RunStatus,
    current_step: usize,
    results: Vec<StepResult>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(pipeline: impl Into<String>, trigger: TriggerSummary) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            trigger,
            status: RunStatus::Pending,
            current_step: 0,
            results: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn trigger(&self) -> &TriggerSummary {
        &self.trigger
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Index of the step executing next (or currently).
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `Pending → Running`.
    pub fn start(&mut self) -> Result<()> {
        if self.status != RunStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Append a step result. A successful result advances the step index.
    pub fn record(&mut self, result: StepResult) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(self.invalid("record a step result"));
        }
        if result.index != self.current_step {
            return Err(Error::InvalidTransition(format!(
                "run {} expected a result for step {}, got step {}",
                self.id, self.current_step, result.index
            )));
        }
        let advance = result.is_success();
        self.results.push(result);
        if advance {
            self.current_step += 1;
        }
        Ok(())
    }

    /// `Running → Succeeded`.
    pub fn succeed(&mut self) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(self.invalid("succeed"));
        }
        if let Some(failed) = self.results.iter().find(|r| !r.is_success()) {
            return Err(Error::InvalidTransition(format!(
                "run {} cannot succeed: step '{}' did not",
                self.id, failed.step
            )));
        }
        self.finish(RunStatus::Succeeded);
        Ok(())
    }

    /// `Pending | Running → Failed`.
    pub fn fail(&mut self, failure: RunFailure) -> Result<()> {
        if self.is_terminal() {
            return Err(self.invalid("fail"));
        }
        self.finish(RunStatus::Failed(failure));
        Ok(())
    }

    /// `Pending | Running → Cancelled`.
    pub fn cancel(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.finish(RunStatus::Cancelled);
        Ok(())
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    fn invalid(&self, action: &str) -> Error {
        Error::InvalidTransition(format!(
            "cannot {} run {} in state {}",
            action,
            self.id,
            self.status.label()
        ))
    }
}
