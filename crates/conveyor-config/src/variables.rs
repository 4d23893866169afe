//! Variable interpolation for pipeline definitions.
//!
//! Supports variables like:
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - Short (7 char) git commit SHA
//! - `${git.branch}` - Branch name (empty for tag events)
//! - `${git.tag}` - Tag name (if applicable)
//! - `${git.ref}` - Ref name (branch or tag)
//! - `${git.message}` - Commit message (first line)
//! - `${git.author}` - Commit author name
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${step.name}` - Current step name
//! - `${step.index}` - Current step position
//! - `${env.VAR_NAME}` - Pipeline environment variable
//! - `${secrets.SECRET_NAME}` - Secret value (only inside env bindings and inputs)
//! - `${inputs.NAME}` - Step input
//! - `${artifacts.NAME}` - Path of a consumed artifact
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime

use conveyor_core::secret::SecretValue;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub pipeline: PipelineContext,
    pub run: RunContext,
    pub step: StepContext,
    /// Pipeline-level environment variables
    pub env: HashMap<String, String>,
    /// Secrets resolved for the current step
    pub secrets: HashMap<String, SecretValue>,
    /// Inputs of the current step
    pub inputs: BTreeMap<String, String>,
    /// Paths of artifacts consumed by the current step
    pub artifacts: HashMap<String, String>,
}

/// Git context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub tag: Option<String>,
    pub ref_name: String,
    pub message: String,
    pub author: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub name: String,
    pub repository: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub trigger: String,
}

#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_-]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate git context by running git commands in a repo path.
    pub fn populate_git_from_repo(&mut self, repo_path: &str) {
        use std::process::Command;

        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        };

        if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha;
        }

        if let Some(message) = run_git(&["log", "-1", "--format=%s"]) {
            self.git.message = message;
        }

        if let Some(author) = run_git(&["log", "-1", "--format=%an"]) {
            self.git.author = author;
        }

        if self.pipeline.repository.is_empty() {
            if let Some(url) = run_git(&["remote", "get-url", "origin"]) {
                self.pipeline.repository = url;
            }
        }
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "ref"] => Some(self.git.ref_name.clone()),
            ["git", "message"] => Some(self.git.message.clone()),
            ["git", "author"] => Some(self.git.author.clone()),

            ["pipeline", "name"] => Some(self.pipeline.name.clone()),
            ["pipeline", "repository"] => Some(self.pipeline.repository.clone()),

            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "trigger"] => Some(self.run.trigger.clone()),

            ["step", "name"] => Some(self.step.name.clone()),
            ["step", "index"] => Some(self.step.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).map(|s| s.expose().to_string()),
            ["inputs", name] => self.inputs.get(*name).cloned(),
            ["artifacts", name] => self.artifacts.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }
}

/// Names of all secrets referenced as `${secrets.NAME}` in a string.
pub fn secret_references(input: &str) -> Vec<String> {
    VAR_REGEX
        .captures_iter(input)
        .filter_map(|caps| caps[1].strip_prefix("secrets.").map(str::to_string))
        .collect()
}

/// Rewrite `${secrets.NAME}` into the shell expansion `${NAME}`.
///
/// Commands never carry secret values: the step's environment already holds
/// each secret under its own name, so the shell expands it at run time.
pub fn secrets_as_shell_vars(input: &str) -> String {
    VAR_REGEX
        .replace_all(input, |caps: &regex::Captures| match caps[1].strip_prefix("secrets.") {
            Some(name) => format!("${{{}}}", name),
            None => caps[0].to_string(),
        })
        .to_string()
}

/// Whether a string references any secret.
pub fn references_secret(input: &str) -> bool {
    !secret_references(input).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_ctx(sha: &str, branch: &str) -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.git.sha = sha.to_string();
        ctx.git.short_sha = sha.chars().take(7).collect();
        ctx.git.branch = branch.to_string();
        ctx.git.ref_name = branch.to_string();
        ctx
    }

    #[test]
    fn test_basic_interpolation() {
        let ctx = git_ctx("abc1234567890", "main");

        let result = ctx.interpolate("Commit ${git.sha} on ${git.branch}");
        assert_eq!(result, "Commit abc1234567890 on main");
        assert_eq!(ctx.interpolate("${git.short_sha}"), "abc1234");
        assert_eq!(ctx.interpolate("${git.ref}"), "main");
    }

    #[test]
    fn test_missing_tag_is_left_as_written() {
        let mut ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("${git.tag}"), "${git.tag}");
        ctx.git.tag = Some("v1.2.0".to_string());
        assert_eq!(ctx.interpolate("${git.tag}"), "v1.2.0");
    }

    #[test]
    fn test_secrets_and_inputs() {
        let mut ctx = VariableContext::new();
        ctx.secrets
            .insert("API_KEY".to_string(), SecretValue::new("super-secret-key"));
        ctx.inputs
            .insert("bucket".to_string(), "www.example.com".to_string());

        assert_eq!(ctx.interpolate("Key: ${secrets.API_KEY}"), "Key: super-secret-key");
        assert_eq!(ctx.interpolate("s3://${inputs.bucket}"), "s3://www.example.com");
    }

    #[test]
    fn test_artifact_names_may_contain_dashes() {
        let mut ctx = VariableContext::new();
        ctx.artifacts
            .insert("site-build".to_string(), "/runs/1/work/build".to_string());
        assert_eq!(ctx.interpolate("${artifacts.site-build}"), "/runs/1/work/build");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("Unknown: ${unknown.var}"), "Unknown: ${unknown.var}");
        assert_eq!(ctx.interpolate("${version}"), "${version}");
        // Secrets not resolved for this step stay unexpanded.
        assert_eq!(ctx.interpolate("${secrets.OTHER}"), "${secrets.OTHER}");
    }

    #[test]
    fn test_pipeline_run_step_and_env_context() {
        let mut ctx = VariableContext::new();
        ctx.pipeline.name = "site-deploy".to_string();
        ctx.run.id = "run-456".to_string();
        ctx.step = StepContext {
            name: "build".to_string(),
            index: 1,
        };
        ctx.env.insert("REGION".to_string(), "eu-west-1".to_string());

        let result = ctx.interpolate("${pipeline.name} ${run.id} ${step.name}#${step.index}");
        assert_eq!(result, "site-deploy run-456 build#1");
        assert_eq!(ctx.interpolate("${env.REGION}"), "eu-west-1");
    }

    #[test]
    fn test_date_variable() {
        let ctx = VariableContext::new();
        let result = ctx.interpolate("${date}");
        assert_eq!(result.len(), 10);
        assert!(result.contains('-'));
    }

    #[test]
    fn test_secret_references() {
        let refs = secret_references(
            "Using ${secrets.API_KEY} and ${secrets.DB_PASSWORD} with ${git.sha}",
        );
        assert_eq!(refs, vec!["API_KEY", "DB_PASSWORD"]);
        assert!(references_secret("${secrets.X}"));
        assert!(!references_secret("${env.X}"));
    }

    #[test]
    fn test_secrets_as_shell_vars() {
        let rewritten = secrets_as_shell_vars("deploy --token ${secrets.TOKEN} --ref ${git.ref}");
        assert_eq!(rewritten, "deploy --token ${TOKEN} --ref ${git.ref}");
    }

    #[test]
    fn test_nested_braces() {
        let ctx = git_ctx("abc123", "main");
        let result = ctx.interpolate(r#"{"sha": "${git.sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
