//! Pipeline and step definitions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use crate::trigger::TriggerRule;

/// A deployment pipeline definition.
///
/// Loaded once per run and never mutated while the run executes; the
/// orchestrator shares it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "site-deploy").
    pub name: String,
    /// Rule deciding which events start a run.
    pub trigger: TriggerRule,
    /// Steps, in execution order.
    pub steps: Vec<Step>,
    /// Environment variables for every step.
    pub env: BTreeMap<String, String>,
    /// Reusable actions that steps can reference with `uses`.
    pub actions: HashMap<String, ActionDefinition>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, trigger: TriggerRule) -> Self {
        Self {
            name: name.into(),
            trigger,
            steps: Vec::new(),
            env: BTreeMap::new(),
            actions: HashMap::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_action(mut self, action: ActionDefinition) -> Self {
        self.actions.insert(action.name.clone(), action);
        self
    }

    /// Every secret name any step needs. Resolved up front when a run starts.
    pub fn required_secrets(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .flat_map(|step| step.secrets.iter().cloned())
            .collect()
    }
}

/// One ordered unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Display name, unique within the pipeline.
    pub name: String,
    /// What the step runs.
    pub action: StepAction,
    /// Input parameters (`with` block). Exposed as `INPUT_<NAME>` and `${inputs.name}`.
    pub inputs: BTreeMap<String, String>,
    /// Environment bindings. Values may reference `${secrets.NAME}`.
    pub env: BTreeMap<String, String>,
    /// Secret names this step needs, by name only.
    pub secrets: BTreeSet<String>,
    /// Artifacts this step produces, available to later steps once it succeeds.
    pub publishes: Vec<ArtifactDecl>,
    /// Artifact names this step reads.
    pub consumes: Vec<String>,
    /// Overrides the orchestrator's default step timeout.
    pub timeout: Option<Duration>,
}

impl Step {
    /// A step running a shell command.
    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_action(
            name,
            StepAction::Run {
                command: command.into(),
            },
        )
    }

    /// A step delegating to a reusable action.
    pub fn uses(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self::with_action(
            name,
            StepAction::Uses {
                action: action.into(),
            },
        )
    }

    fn with_action(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            inputs: BTreeMap::new(),
            env: BTreeMap::new(),
            secrets: BTreeSet::new(),
            publishes: Vec::new(),
            consumes: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>) -> Self {
        self.secrets.insert(name.into());
        self
    }

    pub fn publishes(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.publishes.push(ArtifactDecl {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    pub fn consumes(mut self, name: impl Into<String>) -> Self {
        self.consumes.push(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepAction {
    /// Run a shell command in the run workspace.
    Run { command: String },
    /// Run a reusable action declared in the pipeline.
    Uses { action: String },
}

/// An artifact a step publishes: a name and a path relative to the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDecl {
    pub name: String,
    pub path: String,
}

/// A reusable action: a command template parameterised by inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub description: Option<String>,
    pub inputs: Vec<ActionInput>,
    /// Command template; may reference `${inputs.NAME}`.
    pub command: String,
    /// Secrets every use of this action needs.
    pub secrets: BTreeSet<String>,
}

impl ActionDefinition {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            command: command.into(),
            secrets: BTreeSet::new(),
        }
    }

    pub fn with_input(mut self, input: ActionInput) -> Self {
        self.inputs.push(input);
        self
    }

    /// Merge `provided` inputs with declared defaults.
    /// Returns the name of the first required input with no value.
    pub fn resolve_inputs(
        &self,
        provided: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, String> {
        let mut resolved = provided.clone();
        for input in &self.inputs {
            if resolved.contains_key(&input.name) {
                continue;
            }
            match &input.default {
                Some(default) => {
                    resolved.insert(input.name.clone(), default.clone());
                }
                None if input.required => return Err(input.name.clone()),
                None => {}
            }
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInput {
    pub name: String,
    pub required: bool,
    pub default: Option<String>,
}

impl ActionInput {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Option<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default,
        }
    }
}
