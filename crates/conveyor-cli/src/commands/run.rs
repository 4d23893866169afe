//! Local pipeline execution command.

use anyhow::{Context, Result};
use conveyor_config::{SecretBackend, SystemConfig, VariableContext, load_system_config};
use conveyor_core::executor::LogStream;
use conveyor_core::run::{Run, RunStatus, StepOutcome};
use conveyor_core::secret::EnvSecretStore;
use conveyor_core::snapshot::LocalDirSnapshot;
use conveyor_executor::LocalProcessExecutor;
use conveyor_scheduler::{Dispatch, RunEvent, RunOrchestrator, RunRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::RunArgs;

/// Run a pipeline locally with the process executor.
pub async fn run_local(args: RunArgs) -> Result<()> {
    let pipeline = Arc::new(super::read_pipeline(&args.path)?);
    let config = system_config(&args)?;

    // The checkout defaults to the directory containing the pipeline file.
    let source = match &args.source {
        Some(dir) => dir.clone(),
        None => args
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf(),
    };
    let source = source
        .canonicalize()
        .with_context(|| format!("Failed to resolve source directory: {}", source.display()))?;

    let event = super::build_event(&args.event).with_snapshot(Arc::new(LocalDirSnapshot::new(&source)));

    let mut var_ctx = VariableContext::new();
    var_ctx.populate_git_from_repo(&source.to_string_lossy());

    let SecretBackend::Env { prefix } = &config.secrets;
    let secret_store = Arc::new(EnvSecretStore::new(prefix.clone()));
    let executor = Arc::new(LocalProcessExecutor::new().with_kill_grace(config.kill_grace));
    let registry = Arc::new(RunRegistry::new());

    println!("Running pipeline: {}", pipeline.name);
    println!("Steps: {}", pipeline.steps.len());
    println!("Source: {}", source.display());

    let orchestrator =
        RunOrchestrator::new(executor, secret_store, config).with_registry(registry.clone());

    let handle = match orchestrator.dispatch(pipeline.clone(), event, Some(var_ctx)).await {
        Dispatch::Started(handle) => handle,
        Dispatch::Skipped { ref_name } => {
            println!(
                "⊘ '{}' does not match the trigger rule of '{}'; nothing to run",
                ref_name, pipeline.name
            );
            return Ok(());
        }
    };

    let run_id = handle.run_id;
    println!("Run: {}\n", run_id);
    let (mut events, task) = handle.into_parts();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(event),
                None => break,
            },
            _ = &mut ctrl_c, if !cancel_requested => {
                warn!(run_id = %run_id, "interrupt received; cancelling run");
                println!("\n--- Cancelling run {} ---", run_id.short());
                registry.cancel(run_id).await;
                cancel_requested = true;
            }
        }
    }

    let run = task.await.context("Run task failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_summary(&run);
    }

    match run.status() {
        RunStatus::Succeeded => {
            println!("\n✓ Run succeeded!");
            Ok(())
        }
        RunStatus::Failed(failure) => anyhow::bail!("Run failed: {}", failure),
        RunStatus::Cancelled => anyhow::bail!("Run cancelled"),
        other => anyhow::bail!("Run ended in unexpected state: {}", other.label()),
    }
}

/// Load the system config file, if any, and apply command-line overrides.
fn system_config(args: &RunArgs) -> Result<SystemConfig> {
    let mut config = match &args.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("Failed to load system config: {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(root) = &args.workspace_root {
        config.workspace_root = root.clone();
    }
    if let Some(secs) = args.step_timeout {
        anyhow::ensure!(secs > 0, "--step-timeout must be positive");
        config.step_timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

fn print_event(event: RunEvent) {
    match event {
        RunEvent::RunStarted { trigger, .. } => {
            println!(
                "--- Triggered by {} '{}' (pattern '{}') ---\n",
                trigger.ref_kind, trigger.ref_name, trigger.matched_pattern
            );
        }
        RunEvent::StepStarted { step, index, .. } => {
            println!("▶ Step {} '{}' started", index + 1, step);
        }
        RunEvent::StepLog { step, line, .. } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", step, stream_marker, line.content);
        }
        RunEvent::StepCompleted { result, .. } => match result.outcome {
            StepOutcome::Succeeded => println!("✓ Step '{}' completed successfully\n", result.step),
            StepOutcome::Failed => println!(
                "✗ Step '{}' failed (exit code {})\n",
                result.step,
                result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
            StepOutcome::TimedOut => println!("✗ Step '{}' timed out\n", result.step),
            StepOutcome::Cancelled => println!("⊘ Step '{}' cancelled\n", result.step),
        },
        RunEvent::RunCompleted { status, .. } => {
            println!("--- Run {} ---", status.label());
        }
    }
}

fn print_summary(run: &Run) {
    println!("\n--- Step Summary ---");
    for result in run.results() {
        let status = match result.outcome {
            StepOutcome::Succeeded => "✓ succeeded",
            StepOutcome::Failed => "✗ failed",
            StepOutcome::TimedOut => "✗ timed out",
            StepOutcome::Cancelled => "⊘ cancelled",
        };
        let truncated = if result.output.is_truncated() {
            format!(", {} bytes of output dropped", result.output.truncated_bytes)
        } else {
            String::new()
        };
        println!(
            "  {} - {} in {:.1}s{}",
            result.step,
            status,
            result.duration().as_secs_f64(),
            truncated
        );
    }
}
