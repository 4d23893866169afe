//! Secret resolution scoped to a single run.
//!
//! Every secret a pipeline needs is fetched once, before the first step
//! runs. The values live in a [`RunSecrets`] owned by the run task and are
//! dropped (and zeroized) when the run ends.

use conveyor_config::variables::secret_references;
use conveyor_core::pipeline::{PipelineDefinition, Step, StepAction};
use conveyor_core::run::RunFailure;
use conveyor_core::secret::{SecretStore, SecretValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Names of the secrets `step` needs: declared ones, those of the action it
/// uses, and any `${secrets.NAME}` in its env, inputs or command.
pub fn step_secret_names(pipeline: &PipelineDefinition, step: &Step) -> BTreeSet<String> {
    let mut names = step.secrets.clone();

    let command = match &step.action {
        StepAction::Run { command } => Some(command.as_str()),
        StepAction::Uses { action } => pipeline.actions.get(action).map(|a| {
            names.extend(a.secrets.iter().cloned());
            a.command.as_str()
        }),
    };

    let referenced = step
        .env
        .values()
        .chain(step.inputs.values())
        .map(String::as_str)
        .chain(command)
        .flat_map(secret_references);
    names.extend(referenced);
    names
}

/// Every secret any step of `pipeline` needs.
pub fn pipeline_secret_names(pipeline: &PipelineDefinition) -> BTreeSet<String> {
    let mut names = pipeline.required_secrets();
    for step in &pipeline.steps {
        names.extend(step_secret_names(pipeline, step));
    }
    names
}

/// Resolves secret names against a process-wide store.
#[derive(Clone)]
pub struct SecretResolver {
    store: Arc<dyn SecretStore>,
}

impl SecretResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Fetch every name, failing on the first one the store has no value for.
    pub async fn resolve(&self, names: &BTreeSet<String>) -> Result<RunSecrets, RunFailure> {
        let mut values = BTreeMap::new();
        for name in names {
            match self.store.get(name).await {
                Ok(Some(value)) => {
                    values.insert(name.clone(), value);
                }
                Ok(None) => {
                    return Err(RunFailure::SecretNotFound { name: name.clone() });
                }
                Err(e) => {
                    error!(secret = %name, error = %e, "secret store lookup failed");
                    return Err(RunFailure::SecretStore {
                        name: name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        debug!(count = values.len(), "resolved run secrets");
        Ok(RunSecrets { values })
    }
}

/// Secret values resolved for one run.
pub struct RunSecrets {
    values: BTreeMap<String, SecretValue>,
}

impl RunSecrets {
    /// The subset of secrets named in `names`.
    pub fn for_step(&self, names: &BTreeSet<String>) -> BTreeMap<String, SecretValue> {
        names
            .iter()
            .filter_map(|name| self.values.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for RunSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSecrets")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::pipeline::ActionDefinition;
    use conveyor_core::secret::MemorySecretStore;
    use conveyor_core::trigger::TriggerRule;

    fn pipeline() -> PipelineDefinition {
        let mut sync = ActionDefinition::new("s3-sync", "aws s3 sync dist ${inputs.bucket}");
        sync.secrets.insert("AWS_SECRET_ACCESS_KEY".to_string());

        PipelineDefinition::new("site", TriggerRule::default())
            .with_action(sync)
            .with_step(Step::run("install", "npm ci"))
            .with_step(
                Step::run("build", "npm run build")
                    .with_env("NPM_TOKEN", "${secrets.NPM_TOKEN}"),
            )
            .with_step(
                Step::uses("deploy", "s3-sync")
                    .with_input("bucket", "s3://site")
                    .with_secret("AWS_ACCESS_KEY_ID"),
            )
    }

    #[test]
    fn test_step_secret_names() {
        let pipeline = pipeline();
        assert!(step_secret_names(&pipeline, &pipeline.steps[0]).is_empty());
        assert_eq!(
            step_secret_names(&pipeline, &pipeline.steps[1]),
            BTreeSet::from(["NPM_TOKEN".to_string()])
        );
        assert_eq!(
            step_secret_names(&pipeline, &pipeline.steps[2]),
            BTreeSet::from([
                "AWS_ACCESS_KEY_ID".to_string(),
                "AWS_SECRET_ACCESS_KEY".to_string()
            ])
        );
        assert_eq!(pipeline_secret_names(&pipeline).len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_and_scope_to_step() {
        let store = MemorySecretStore::new()
            .with_secret("NPM_TOKEN", "npm-1")
            .with_secret("AWS_ACCESS_KEY_ID", "AKIA")
            .with_secret("AWS_SECRET_ACCESS_KEY", "shh");
        let resolver = SecretResolver::new(Arc::new(store));
        let pipeline = pipeline();

        let secrets = resolver
            .resolve(&pipeline_secret_names(&pipeline))
            .await
            .unwrap();
        assert_eq!(secrets.len(), 3);

        let build = secrets.for_step(&step_secret_names(&pipeline, &pipeline.steps[1]));
        assert_eq!(build.len(), 1);
        assert_eq!(build["NPM_TOKEN"].expose(), "npm-1");
    }

    #[tokio::test]
    async fn test_missing_secret_fails() {
        let store = MemorySecretStore::new().with_secret("NPM_TOKEN", "npm-1");
        let resolver = SecretResolver::new(Arc::new(store));

        let err = resolver
            .resolve(&pipeline_secret_names(&pipeline()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RunFailure::SecretNotFound {
                name: "AWS_ACCESS_KEY_ID".to_string()
            }
        );
    }

    struct BrokenStore;

    #[async_trait::async_trait]
    impl SecretStore for BrokenStore {
        async fn get(&self, name: &str) -> conveyor_core::Result<Option<SecretValue>> {
            Err(conveyor_core::Error::InvalidInput(format!(
                "secret '{}' is not valid UTF-8",
                name
            )))
        }
    }

    #[tokio::test]
    async fn test_store_error_keeps_its_message() {
        let resolver = SecretResolver::new(Arc::new(BrokenStore));
        let names = BTreeSet::from(["NPM_TOKEN".to_string()]);

        let err = resolver.resolve(&names).await.unwrap_err();
        assert_eq!(
            err,
            RunFailure::SecretStore {
                name: "NPM_TOKEN".to_string(),
                message: "invalid input: secret 'NPM_TOKEN' is not valid UTF-8".to_string(),
            }
        );
    }

    #[test]
    fn test_debug_hides_values() {
        let secrets = RunSecrets {
            values: BTreeMap::from([("TOKEN".to_string(), SecretValue::new("hunter2"))]),
        };
        let debug = format!("{:?}", secrets);
        assert!(debug.contains("TOKEN"));
        assert!(!debug.contains("hunter2"));
    }
}
