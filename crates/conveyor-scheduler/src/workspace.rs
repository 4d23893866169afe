//! Per-run workspaces.

use conveyor_core::{Error, Result, RunId};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A disposable directory owned by one run.
///
/// Laid out as `<root>/<run-id>/work`; steps execute in `work`.
#[derive(Debug)]
pub struct Workspace {
    run_dir: PathBuf,
    work_dir: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace for `run_id`, replacing any leftover directory.
    pub async fn provision(root: &Path, run_id: RunId) -> Result<Self> {
        let run_dir = root.join(run_id.to_string());
        let work_dir = run_dir.join("work");

        if tokio::fs::try_exists(&run_dir).await? {
            debug!(path = %run_dir.display(), "removing stale workspace");
            tokio::fs::remove_dir_all(&run_dir).await.map_err(|e| {
                Error::Workspace(format!("failed to clear {}: {}", run_dir.display(), e))
            })?;
        }

        tokio::fs::create_dir_all(&work_dir).await.map_err(|e| {
            Error::Workspace(format!("failed to create {}: {}", work_dir.display(), e))
        })?;

        debug!(path = %work_dir.display(), "provisioned workspace");
        Ok(Self { run_dir, work_dir })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Remove the workspace and everything in it, artifacts included.
    pub async fn teardown(self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.run_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Workspace(format!(
                "failed to remove {}: {}",
                self.run_dir.display(),
                e
            ))),
        }
    }
}
