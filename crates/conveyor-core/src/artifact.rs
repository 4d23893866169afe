//! Artifact references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A published artifact: a named subtree of a run's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Artifact name, unique within a run.
    pub name: String,
    /// Step that published it.
    pub producer: String,
    /// Absolute path inside the run workspace.
    pub path: PathBuf,
    pub published_at: DateTime<Utc>,
}

/// Environment variable through which a consuming step finds an artifact.
///
/// `dist` becomes `CONVEYOR_ARTIFACT_DIST`; characters outside `[A-Za-z0-9]`
/// become `_`.
pub fn artifact_env_var(name: &str) -> String {
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
    format!("CONVEYOR_ARTIFACT_{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_env_var() {
        assert_eq!(artifact_env_var("dist"), "CONVEYOR_ARTIFACT_DIST");
        assert_eq!(artifact_env_var("site-build.v2"), "CONVEYOR_ARTIFACT_SITE_BUILD_V2");
    }
}
