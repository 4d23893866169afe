//! Pipeline definition parsing.
//!
//! ```kdl
//! pipeline "site-deploy"
//!
//! on "push" branches="main"
//!
//! action "sync" {
//!     input "bucket" required=#true
//!     input "source" default="build"
//!     run "aws s3 sync ${inputs.source} s3://${inputs.bucket} --delete"
//! }
//!
//! step "install" { run "npm ci" }
//! step "build" {
//!     run "npm run build"
//!     publish "site" path="build"
//! }
//! step "deploy" {
//!     uses "sync"
//!     with { bucket "www.example.com"; source "${artifacts.site}" }
//!     consume "site"
//!     env { AWS_SECRET_ACCESS_KEY "${secrets.AWS_SECRET_ACCESS_KEY}" }
//! }
//! ```

use crate::kdl_util::*;
use crate::variables::secret_references;
use crate::{ConfigError, ConfigResult};
use conveyor_core::pipeline::{
    ActionDefinition, ActionInput, ArtifactDecl, PipelineDefinition, Step, StepAction,
};
use conveyor_core::trigger::{MatchPolicy, RefKind, TriggerRule};
use kdl::{KdlDocument, KdlNode};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Read and parse a pipeline definition file.
pub fn load_pipeline(path: impl AsRef<Path>) -> ConfigResult<PipelineDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline(&content)
}

/// Parse a pipeline definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut trigger = None;
    let mut steps: Vec<Step> = Vec::new();
    let mut actions: HashMap<String, ActionDefinition> = HashMap::new();
    let mut env = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "on" => {
                if trigger.is_some() {
                    return Err(ConfigError::Duplicate("trigger (on)".to_string()));
                }
                trigger = Some(parse_trigger(node)?);
            }
            "env" => {
                env.extend(get_string_map(node));
            }
            "action" => {
                let action = parse_action(node)?;
                if actions.contains_key(&action.name) {
                    return Err(ConfigError::Duplicate(format!("action '{}'", action.name)));
                }
                actions.insert(action.name.clone(), action);
            }
            "step" => {
                steps.push(parse_step(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    let trigger = trigger.ok_or_else(|| ConfigError::MissingField("trigger (on)".to_string()))?;
    if steps.is_empty() {
        return Err(ConfigError::MissingField("at least one step".to_string()));
    }

    let mut seen = HashSet::new();
    for step in &steps {
        if !seen.insert(step.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("step '{}'", step.name)));
        }
    }

    for step in &mut steps {
        link_action(step, &actions)?;
    }
    validate_artifacts(&steps)?;

    Ok(PipelineDefinition {
        name,
        trigger,
        steps,
        env,
        actions,
    })
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<TriggerRule> {
    let trigger_type = get_first_string_arg(node).unwrap_or_else(|| "push".to_string());
    if trigger_type != "push" {
        return Err(ConfigError::InvalidValue {
            field: "trigger type".to_string(),
            message: format!("unknown trigger type: {}", trigger_type),
        });
    }

    let patterns = get_string_list_prop(node, "branches");
    if patterns.is_empty() {
        return Err(ConfigError::MissingField("trigger branches".to_string()));
    }

    let policy = match get_string_prop(node, "match").as_deref() {
        None | Some("exact") => MatchPolicy::Exact,
        Some("prefix") => MatchPolicy::Prefix,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                field: "match".to_string(),
                message: format!("expected \"exact\" or \"prefix\", got \"{}\"", other),
            });
        }
    };

    let mut ref_kinds = vec![RefKind::Branch];
    if get_bool_prop(node, "tags").unwrap_or(false) {
        ref_kinds.push(RefKind::Tag);
    }

    Ok(TriggerRule {
        patterns,
        policy,
        ref_kinds,
        paths: get_string_list_prop(node, "paths"),
    })
}

fn parse_action(node: &KdlNode) -> ConfigResult<ActionDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("action name".to_string()))?;

    let mut description = None;
    let mut inputs = Vec::new();
    let mut commands = Vec::new();
    let mut secrets = BTreeSet::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "description" => description = get_first_string_arg(child),
                "input" => {
                    let input_name = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("input name in action '{}'", name))
                    })?;
                    let default = get_string_prop(child, "default");
                    let required = get_bool_prop(child, "required").unwrap_or(false);
                    inputs.push(if required && default.is_none() {
                        ActionInput::required(input_name)
                    } else {
                        ActionInput::optional(input_name, default)
                    });
                }
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "secret" => {
                    for secret in get_all_string_args(child) {
                        secrets.insert(validate_secret_name(secret)?);
                    }
                }
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run command for action '{}'",
            name
        )));
    }
    let command = commands.join(" && ");
    for secret in secret_references(&command) {
        secrets.insert(validate_secret_name(secret)?);
    }

    Ok(ActionDefinition {
        name,
        description,
        inputs,
        command,
        secrets,
    })
}

fn parse_step(node: &KdlNode) -> ConfigResult<Step> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;

    let timeout = match get_integer_prop(node, "timeout") {
        None => None,
        Some(secs) if secs > 0 && secs <= u64::MAX as i128 => Some(Duration::from_secs(secs as u64)),
        Some(secs) => {
            return Err(ConfigError::InvalidValue {
                field: format!("timeout of step '{}'", name),
                message: format!("expected a positive number of seconds, got {}", secs),
            });
        }
    };

    let mut commands = Vec::new();
    let mut uses = None;
    let mut inputs = BTreeMap::new();
    let mut env = BTreeMap::new();
    let mut secrets = BTreeSet::new();
    let mut publishes = Vec::new();
    let mut consumes = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "uses" => uses = get_first_string_arg(child),
                "with" => inputs.extend(get_string_map(child)),
                "env" => env.extend(get_string_map(child)),
                "secret" => {
                    for secret in get_all_string_args(child) {
                        secrets.insert(validate_secret_name(secret)?);
                    }
                }
                "publish" => {
                    let artifact = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("artifact name in step '{}'", name))
                    })?;
                    let path = get_string_prop(child, "path").unwrap_or_else(|| artifact.clone());
                    publishes.push(ArtifactDecl {
                        name: artifact,
                        path,
                    });
                }
                "consume" => consumes.extend(get_all_string_args(child)),
                _ => {}
            }
        }
    }

    let action = match (commands.is_empty(), uses) {
        (false, None) => StepAction::Run {
            command: commands.join(" && "),
        },
        (true, Some(action)) => StepAction::Uses { action },
        (true, None) => {
            return Err(ConfigError::MissingField(format!(
                "run or uses for step '{}'",
                name
            )));
        }
        (false, Some(_)) => {
            return Err(ConfigError::InvalidValue {
                field: format!("step '{}'", name),
                message: "a step has either run commands or uses an action, not both".to_string(),
            });
        }
    };

    if let StepAction::Run { command } = &action {
        secrets.extend(secret_references(command));
    }
    for value in env.values().chain(inputs.values()) {
        secrets.extend(secret_references(value));
    }
    for secret in &secrets {
        validate_secret_name(secret.clone())?;
    }

    Ok(Step {
        name,
        action,
        inputs,
        env,
        secrets,
        publishes,
        consumes,
        timeout,
    })
}

/// Secrets are injected as environment variables under their own name.
fn validate_secret_name(name: String) -> ConfigResult<String> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(ConfigError::InvalidValue {
            field: "secret name".to_string(),
            message: format!("'{}' is not a valid environment variable name", name),
        })
    }
}

/// Check a `uses` step against its action and pull in the action's secrets.
fn link_action(step: &mut Step, actions: &HashMap<String, ActionDefinition>) -> ConfigResult<()> {
    let StepAction::Uses { action } = &step.action else {
        return Ok(());
    };

    let definition = actions.get(action).ok_or_else(|| {
        ConfigError::InvalidReference(format!(
            "step '{}' uses unknown action '{}'",
            step.name, action
        ))
    })?;

    if let Err(missing) = definition.resolve_inputs(&step.inputs) {
        return Err(ConfigError::MissingField(format!(
            "input '{}' for step '{}' (required by action '{}')",
            missing, step.name, action
        )));
    }

    step.secrets.extend(definition.secrets.iter().cloned());
    Ok(())
}

/// Every consumed artifact must be published by some step, and names are unique.
/// Publication order is checked when the run executes.
fn validate_artifacts(steps: &[Step]) -> ConfigResult<()> {
    let mut published = HashSet::new();
    for step in steps {
        for artifact in &step.publishes {
            if !published.insert(artifact.name.as_str()) {
                return Err(ConfigError::Duplicate(format!("artifact '{}'", artifact.name)));
            }
        }
    }

    for step in steps {
        for name in &step.consumes {
            if !published.contains(name.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "step '{}' consumes artifact '{}' which no step publishes",
                    step.name, name
                )));
            }
        }
    }

    Ok(())
}
