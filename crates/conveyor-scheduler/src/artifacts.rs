//! Artifact hand-off between steps of one run.

use chrono::Utc;
use conveyor_core::artifact::ArtifactRef;
use conveyor_core::run::RunFailure;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Named filesystem outputs published by earlier steps of a run.
///
/// Each name has exactly one producer. Artifacts live inside the run's
/// workspace and disappear with it.
#[derive(Debug)]
pub struct ArtifactChannel {
    workspace: PathBuf,
    published: HashMap<String, ArtifactRef>,
}

impl ArtifactChannel {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            published: HashMap::new(),
        }
    }

    /// Publish `path` (relative to the workspace) under `name`.
    pub async fn publish(
        &mut self,
        step: &str,
        name: &str,
        path: &str,
    ) -> Result<&ArtifactRef, RunFailure> {
        if let Some(existing) = self.published.get(name) {
            return Err(RunFailure::ArtifactAlreadyPublished {
                artifact: name.to_string(),
                publisher: existing.producer.clone(),
            });
        }

        let missing = || RunFailure::ArtifactMissing {
            step: step.to_string(),
            artifact: name.to_string(),
            path: path.to_string(),
        };

        let escapes = || {
            RunFailure::Workspace(format!(
                "artifact '{}' path '{}' escapes the workspace",
                name, path
            ))
        };

        if !is_contained(Path::new(path)) {
            return Err(escapes());
        }

        let full_path = self.workspace.join(path);
        match tokio::fs::try_exists(&full_path).await {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(missing()),
        }

        // Symlinks are followed, so the resolved target must stay inside too.
        let workspace = tokio::fs::canonicalize(&self.workspace)
            .await
            .map_err(|e| RunFailure::Workspace(format!("{}: {}", self.workspace.display(), e)))?;
        let resolved = tokio::fs::canonicalize(&full_path).await.map_err(|_| missing())?;
        if !resolved.starts_with(&workspace) {
            return Err(escapes());
        }

        debug!(step, artifact = name, path = %full_path.display(), "artifact published");
        let artifact = ArtifactRef {
            name: name.to_string(),
            producer: step.to_string(),
            path: full_path,
            published_at: Utc::now(),
        };
        Ok(self.published.entry(name.to_string()).or_insert(artifact))
    }

    /// Look up an artifact for a consuming step.
    pub fn consume(&self, step: &str, name: &str) -> Result<&ArtifactRef, RunFailure> {
        self.published
            .get(name)
            .ok_or_else(|| RunFailure::ArtifactNotReady {
                step: step.to_string(),
                artifact: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.published.len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.is_empty()
    }
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_consume_yields_same_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        std::fs::write(dir.path().join("dist/index.html"), "<html/>").unwrap();

        let mut channel = ArtifactChannel::new(dir.path());
        let published = channel.publish("build", "dist", "dist").await.unwrap().clone();
        assert_eq!(published.path, dir.path().join("dist"));
        assert_eq!(published.producer, "build");

        let consumed = channel.consume("deploy", "dist").unwrap();
        assert_eq!(consumed.path, published.path);
        assert_eq!(
            std::fs::read_to_string(consumed.path.join("index.html")).unwrap(),
            "<html/>"
        );
    }

    #[tokio::test]
    async fn test_consume_before_publish() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ArtifactChannel::new(dir.path());

        assert_eq!(
            channel.consume("deploy", "dist").unwrap_err(),
            RunFailure::ArtifactNotReady {
                step: "deploy".to_string(),
                artifact: "dist".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_publish_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = ArtifactChannel::new(dir.path());

        let err = channel.publish("build", "dist", "dist").await.unwrap_err();
        assert!(matches!(err, RunFailure::ArtifactMissing { .. }));
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_single_producer_per_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), "ok").unwrap();

        let mut channel = ArtifactChannel::new(dir.path());
        channel.publish("test", "report", "report.txt").await.unwrap();

        let err = channel.publish("lint", "report", "report.txt").await.unwrap_err();
        assert_eq!(
            err,
            RunFailure::ArtifactAlreadyPublished {
                artifact: "report".to_string(),
                publisher: "test".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = ArtifactChannel::new(dir.path().join("work"));

        let err = channel.publish("build", "etc", "../secrets").await.unwrap_err();
        assert!(matches!(err, RunFailure::Workspace(_)));
        let err = channel.publish("build", "etc", "/etc").await.unwrap_err();
        assert!(matches!(err, RunFailure::Workspace(_)));
    }

    #[tokio::test]
    async fn test_symlink_target_must_stay_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("dist")).unwrap();
        std::os::unix::fs::symlink("build", dir.path().join("latest")).unwrap();

        let mut channel = ArtifactChannel::new(dir.path());
        let err = channel.publish("build", "dist", "dist").await.unwrap_err();
        assert!(matches!(err, RunFailure::Workspace(_)));
        assert!(channel.is_empty());

        let published = channel.publish("build", "latest", "latest").await.unwrap();
        assert_eq!(published.path, dir.path().join("latest"));
    }
}
