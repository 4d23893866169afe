//! System configuration parsing.
//!
//! ```kdl
//! workspace-root "/var/lib/conveyor/runs"
//! step-timeout 1800
//! max-output-bytes 1048576
//! kill-grace 5
//! secrets {
//!     env-prefix "CONVEYOR_SECRET_"
//! }
//! ```
//!
//! Every setting is optional; omitted settings keep their defaults.

use crate::kdl_util::*;
use crate::{ConfigError, ConfigResult};
use conveyor_core::executor::DEFAULT_MAX_OUTPUT_BYTES;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_SECRET_ENV_PREFIX: &str = "CONVEYOR_SECRET_";

/// Orchestrator-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Directory under which each run gets its own workspace.
    pub workspace_root: PathBuf,
    /// Timeout for steps that do not set their own.
    pub step_timeout: Duration,
    /// Cap on captured output per step.
    pub max_output_bytes: usize,
    /// How long to wait for a killed step's process group to exit and its output to drain.
    pub kill_grace: Duration,
    /// Where secrets come from.
    pub secrets: SecretBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretBackend {
    /// Process environment variables named `<prefix><SECRET>`.
    Env { prefix: String },
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("conveyor"),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            kill_grace: DEFAULT_KILL_GRACE,
            secrets: SecretBackend::Env {
                prefix: DEFAULT_SECRET_ENV_PREFIX.to_string(),
            },
        }
    }
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "workspace-root" => {
                let root = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workspace-root path".to_string()))?;
                config.workspace_root = PathBuf::from(root);
            }
            "step-timeout" => {
                config.step_timeout = Duration::from_secs(positive_integer(node)?);
            }
            "max-output-bytes" => {
                config.max_output_bytes = usize::try_from(positive_integer(node)?).map_err(|_| {
                    ConfigError::InvalidValue {
                        field: "max-output-bytes".to_string(),
                        message: "value too large".to_string(),
                    }
                })?;
            }
            "kill-grace" => {
                config.kill_grace = Duration::from_secs(positive_integer(node)?);
            }
            "secrets" => {
                config.secrets = parse_secret_backend(node)?;
            }
            _ => {}
        }
    }

    Ok(config)
}

fn positive_integer(node: &KdlNode) -> ConfigResult<u64> {
    let field = node.name().value().to_string();
    let value = get_first_integer_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} value", field)))?;
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field,
            message: format!("expected a positive integer, got {}", value),
        })
}

fn parse_secret_backend(node: &KdlNode) -> ConfigResult<SecretBackend> {
    let mut prefix = DEFAULT_SECRET_ENV_PREFIX.to_string();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "env-prefix" => {
                    prefix = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField("secrets env-prefix value".to_string())
                    })?;
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "secrets".to_string(),
                        message: format!("unknown setting: {}", other),
                    });
                }
            }
        }
    }
    Ok(SecretBackend::Env { prefix })
}
