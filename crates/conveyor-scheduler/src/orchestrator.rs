//! Run orchestrator - executes a pipeline's steps in declaration order.

use conveyor_config::variables::{references_secret, secrets_as_shell_vars};
use conveyor_config::{StepContext, SystemConfig, VariableContext};
use conveyor_core::artifact::artifact_env_var;
use conveyor_core::executor::{ExecutionEnvironment, LogLine, StepExecutor, StepSpec};
use conveyor_core::pipeline::{PipelineDefinition, Step, StepAction};
use conveyor_core::run::{Run, RunFailure, RunStatus, StepOutcome, StepResult, TriggerSummary};
use conveyor_core::secret::{SecretStore, SecretValue};
use conveyor_core::trigger::{self, TriggerEvent};
use conveyor_core::{Error, Result, RunId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactChannel;
use crate::registry::RunRegistry;
use crate::secrets::{RunSecrets, SecretResolver, pipeline_secret_names, step_secret_names};
use crate::workspace::Workspace;

/// Event emitted during run execution.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        pipeline: String,
        trigger: TriggerSummary,
    },
    StepStarted {
        run_id: RunId,
        step: String,
        index: usize,
    },
    StepLog {
        run_id: RunId,
        step: String,
        line: LogLine,
    },
    StepCompleted {
        run_id: RunId,
        result: StepResult,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
    },
}

/// What happened to an incoming event.
#[derive(Debug)]
pub enum Dispatch {
    /// The trigger rule did not match; nothing was created or provisioned.
    Skipped { ref_name: String },
    /// A run was created and is executing.
    Started(RunHandle),
}

/// Handle to a run executing in the background.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    /// Progress events. Must be drained (or dropped) for the run to make progress.
    pub events: mpsc::Receiver<RunEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Run>,
}

impl RunHandle {
    /// Request cancellation. The current step's process is killed and no
    /// further steps start.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach a terminal state, discarding undelivered events.
    pub async fn wait(self) -> Result<Run> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {}", e)))
    }

    /// Split into the event stream and the task producing the final run.
    pub fn into_parts(self) -> (mpsc::Receiver<RunEvent>, JoinHandle<Run>) {
        (self.events, self.task)
    }
}

/// Orchestrates runs of pipelines.
pub struct RunOrchestrator {
    executor: Arc<dyn StepExecutor>,
    secrets: SecretResolver,
    config: SystemConfig,
    registry: Option<Arc<RunRegistry>>,
}

impl RunOrchestrator {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        secret_store: Arc<dyn SecretStore>,
        config: SystemConfig,
    ) -> Self {
        Self {
            executor,
            secrets: SecretResolver::new(secret_store),
            config,
            registry: None,
        }
    }

    /// Keep a registry entry for every run this orchestrator starts.
    pub fn with_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Evaluate `event` against the pipeline's trigger rule and, on a match,
    /// start a run in the background.
    ///
    /// The `var_ctx` seeds variable interpolation (`${git.sha}` and friends);
    /// run, pipeline and step variables are filled in by the orchestrator.
    pub async fn dispatch(
        &self,
        pipeline: Arc<PipelineDefinition>,
        event: TriggerEvent,
        var_ctx: Option<VariableContext>,
    ) -> Dispatch {
        let matched = match trigger::first_match(&event, &pipeline.trigger) {
            Some(pattern) if trigger::evaluate(&event, &pipeline.trigger) => pattern.to_string(),
            _ => {
                info!(
                    pipeline = %pipeline.name,
                    ref_name = %event.ref_name,
                    ref_kind = %event.ref_kind,
                    "event does not match trigger rule; skipping"
                );
                return Dispatch::Skipped {
                    ref_name: event.ref_name,
                };
            }
        };

        let run = Run::new(pipeline.name.clone(), TriggerSummary::new(&event, matched));
        let run_id = run.id();
        let cancel = CancellationToken::new();
        if let Some(registry) = &self.registry {
            registry.register(run.clone(), cancel.clone()).await;
        }

        let mut vars = var_ctx.unwrap_or_default();
        vars.pipeline.name = pipeline.name.clone();
        vars.run.id = run_id.to_string();
        vars.run.trigger = event.ref_name.clone();
        vars.git.ref_name = event.ref_name.clone();
        match event.ref_kind {
            trigger::RefKind::Branch => vars.git.branch = event.ref_name.clone(),
            trigger::RefKind::Tag => vars.git.tag = Some(event.ref_name.clone()),
        }

        let (tx, rx) = mpsc::channel(100);
        let task = RunTask {
            executor: self.executor.clone(),
            secrets: self.secrets.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            pipeline,
            event,
            vars,
            cancel: cancel.clone(),
            tx,
        };

        info!(run_id = %run_id, pipeline = %task.pipeline.name, "run created");
        let handle = tokio::spawn(task.run(run));

        Dispatch::Started(RunHandle {
            run_id,
            events: rx,
            cancel,
            task: handle,
        })
    }
}

/// How the steps of a run ended.
enum Ending {
    Succeeded,
    Failed(RunFailure),
    Cancelled,
}

/// A step with every variable resolved, ready for the executor.
struct PreparedStep {
    spec: StepSpec,
    env: ExecutionEnvironment,
}

/// Everything one run needs, moved onto its own task.
struct RunTask {
    executor: Arc<dyn StepExecutor>,
    secrets: SecretResolver,
    config: SystemConfig,
    registry: Option<Arc<RunRegistry>>,
    pipeline: Arc<PipelineDefinition>,
    event: TriggerEvent,
    vars: VariableContext,
    cancel: CancellationToken,
    tx: mpsc::Sender<RunEvent>,
}

impl RunTask {
    async fn run(self, mut run: Run) -> Run {
        let run_id = run.id();

        if let Err(e) = run.start() {
            error!(run_id = %run_id, error = %e, "failed to start run");
            return run;
        }
        self.sync(&run).await;
        self.emit(RunEvent::RunStarted {
            run_id,
            pipeline: self.pipeline.name.clone(),
            trigger: run.trigger().clone(),
        })
        .await;
        info!(run_id = %run_id, pipeline = %self.pipeline.name, steps = self.pipeline.steps.len(), "run started");

        let transition = match self.execute(&mut run).await {
            Ending::Succeeded => run.succeed(),
            Ending::Failed(failure) => {
                error!(run_id = %run_id, failure = %failure, "run failed");
                run.fail(failure)
            }
            Ending::Cancelled => run.cancel(),
        };
        if let Err(e) = transition {
            error!(run_id = %run_id, error = %e, "invalid run transition");
        }

        info!(run_id = %run_id, status = run.status().label(), "run finished");
        self.sync(&run).await;
        self.emit(RunEvent::RunCompleted {
            run_id,
            status: run.status().clone(),
        })
        .await;

        run
    }

    /// Provision the workspace, run the steps, and tear the workspace down
    /// whatever the outcome.
    async fn execute(&self, run: &mut Run) -> Ending {
        if self.cancel.is_cancelled() {
            return Ending::Cancelled;
        }

        let workspace = match Workspace::provision(&self.config.workspace_root, run.id()).await {
            Ok(workspace) => workspace,
            Err(e) => return Ending::Failed(RunFailure::Workspace(e.to_string())),
        };

        let ending = self.execute_in(run, &workspace).await;

        if let Err(e) = workspace.teardown().await {
            warn!(run_id = %run.id(), error = %e, "failed to remove workspace");
        }
        ending
    }

    async fn execute_in(&self, run: &mut Run, workspace: &Workspace) -> Ending {
        if let Err(e) = self.event.snapshot.materialize(workspace.work_dir()).await {
            return Ending::Failed(RunFailure::Workspace(format!(
                "failed to materialize {}: {}",
                self.event.snapshot.describe(),
                e
            )));
        }

        // Resolved up front so a missing secret fails the run before any step starts.
        let secrets = match self.secrets.resolve(&pipeline_secret_names(&self.pipeline)).await {
            Ok(secrets) => secrets,
            Err(failure) => return Ending::Failed(failure),
        };
        let mut artifacts = ArtifactChannel::new(workspace.work_dir());

        for (index, step) in self.pipeline.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(run_id = %run.id(), step = %step.name, "run cancelled before step");
                return Ending::Cancelled;
            }

            self.emit(RunEvent::StepStarted {
                run_id: run.id(),
                step: step.name.clone(),
                index,
            })
            .await;

            let prepared =
                match self.prepare(run.id(), index, step, workspace, &secrets, &artifacts) {
                    Ok(prepared) => prepared,
                    Err(failure) => return Ending::Failed(failure),
                };
            let timeout = prepared.spec.timeout;

            let result = match self.execute_step(prepared).await {
                Ok(result) => result,
                Err(e) => {
                    return Ending::Failed(RunFailure::Executor {
                        step: step.name.clone(),
                        message: e.to_string(),
                    });
                }
            };

            let outcome = result.outcome;
            let exit_code = result.exit_code;
            if let Err(e) = run.record(result.clone()) {
                error!(run_id = %run.id(), step = %step.name, error = %e, "failed to record step result");
            }
            self.sync(run).await;
            self.emit(RunEvent::StepCompleted {
                run_id: run.id(),
                result,
            })
            .await;

            match outcome {
                StepOutcome::Succeeded => {
                    info!(run_id = %run.id(), step = %step.name, "step succeeded");
                    for decl in &step.publishes {
                        if let Err(failure) =
                            artifacts.publish(&step.name, &decl.name, &decl.path).await
                        {
                            return Ending::Failed(failure);
                        }
                    }
                }
                StepOutcome::Failed => {
                    return Ending::Failed(RunFailure::StepExecution {
                        step: step.name.clone(),
                        exit_code,
                    });
                }
                StepOutcome::TimedOut => {
                    return Ending::Failed(RunFailure::StepTimeout {
                        step: step.name.clone(),
                        timeout,
                    });
                }
                StepOutcome::Cancelled => return Ending::Cancelled,
            }
        }

        Ending::Succeeded
    }

    /// Resolve a step's command, environment and secrets.
    fn prepare(
        &self,
        run_id: RunId,
        index: usize,
        step: &Step,
        workspace: &Workspace,
        secrets: &RunSecrets,
        artifacts: &ArtifactChannel,
    ) -> std::result::Result<PreparedStep, RunFailure> {
        let consumed = step
            .consumes
            .iter()
            .map(|name| artifacts.consume(&step.name, name))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let (template, inputs) = match &step.action {
            StepAction::Run { command } => (command.clone(), step.inputs.clone()),
            StepAction::Uses { action } => {
                let definition = self.pipeline.actions.get(action).ok_or_else(|| {
                    RunFailure::Executor {
                        step: step.name.clone(),
                        message: format!("unknown action '{}'", action),
                    }
                })?;
                let inputs = definition.resolve_inputs(&step.inputs).map_err(|missing| {
                    RunFailure::Executor {
                        step: step.name.clone(),
                        message: format!("action '{}' requires input '{}'", action, missing),
                    }
                })?;
                (definition.command.clone(), inputs)
            }
        };

        let step_secrets = secrets.for_step(&step_secret_names(&self.pipeline, step));

        let mut merged_env = self.pipeline.env.clone();
        merged_env.extend(step.env.clone());

        // Anything that carries a secret reaches the command only as a shell
        // variable, so secret values never appear in the command text.
        let mut ctx = self.vars.clone();
        ctx.step = StepContext {
            name: step.name.clone(),
            index,
        };
        ctx.secrets = step_secrets
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ctx.artifacts = consumed
            .iter()
            .map(|a| (a.name.clone(), a.path.display().to_string()))
            .collect();
        let env_values: HashMap<String, String> = merged_env
            .iter()
            .map(|(k, v)| {
                let value = if references_secret(v) {
                    format!("${{{}}}", k)
                } else {
                    ctx.interpolate(v)
                };
                (k.clone(), value)
            })
            .collect();
        ctx.env = env_values;
        let input_values: BTreeMap<String, String> = inputs
            .iter()
            .map(|(k, v)| {
                let value = if references_secret(v) {
                    format!("${{{}}}", input_env_var(k))
                } else {
                    ctx.interpolate(v)
                };
                (k.clone(), value)
            })
            .collect();
        ctx.inputs = input_values;

        let mut env = ExecutionEnvironment::new(workspace.work_dir())
            .with_max_output_bytes(self.config.max_output_bytes)
            .with_cancellation(self.cancel.clone())
            .with_var("CI", "true")
            .with_var("CONVEYOR_RUN_ID", run_id.to_string())
            .with_var("CONVEYOR_PIPELINE", self.pipeline.name.clone())
            .with_var("CONVEYOR_STEP", step.name.clone())
            .with_var("CONVEYOR_REF", self.event.ref_name.clone())
            .with_var("CONVEYOR_WORKSPACE", workspace.work_dir().display().to_string());

        for artifact in &consumed {
            env = env.with_var(
                artifact_env_var(&artifact.name),
                artifact.path.display().to_string(),
            );
        }

        let bindings = merged_env
            .into_iter()
            .chain(inputs.into_iter().map(|(k, v)| (input_env_var(&k), v)));
        for (key, value) in bindings {
            env.vars.remove(&key);
            env.secrets.remove(&key);
            let resolved = ctx.interpolate(&value);
            env = if references_secret(&value) {
                env.with_secret(key, SecretValue::new(resolved))
            } else {
                env.with_var(key, resolved)
            };
        }

        for (name, value) in step_secrets {
            env = env.with_secret(name, value);
        }

        let command = ctx.interpolate(&secrets_as_shell_vars(&template));
        let spec = StepSpec {
            run_id,
            step: step.name.clone(),
            index,
            command,
            timeout: step.timeout.unwrap_or(self.config.step_timeout),
        };

        Ok(PreparedStep { spec, env })
    }

    /// Run one step, forwarding its output lines as events.
    async fn execute_step(&self, prepared: PreparedStep) -> Result<StepResult> {
        let PreparedStep { spec, env } = prepared;

        let (log_tx, mut log_rx) = mpsc::channel::<LogLine>(256);
        let env = env.with_log_channel(log_tx);

        let tx = self.tx.clone();
        let run_id = spec.run_id;
        let step_name = spec.step.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                let _ = tx
                    .send(RunEvent::StepLog {
                        run_id,
                        step: step_name.clone(),
                        line,
                    })
                    .await;
            }
        });

        let result = self.executor.execute(&spec, &env).await;

        drop(env);
        let _ = forwarder.await;
        result
    }

    async fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event).await;
    }

    async fn sync(&self, run: &Run) {
        if let Some(registry) = &self.registry {
            registry.update(run).await;
        }
    }
}

/// Environment variable through which a step sees input `name`.
///
/// `node-version` becomes `INPUT_NODE_VERSION`.
pub fn input_env_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("INPUT_{}", suffix)
}
