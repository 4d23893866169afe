//! Secret values and the secret store abstraction.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::{Error, Result};

/// A credential value.
///
/// Not serialisable, and `Debug` never prints the value, so a secret cannot
/// end up in a run record or a log line by accident.
#[derive(Clone)]
pub struct SecretValue {
    inner: SecretString,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: SecretString::from(value.into()),
        }
    }

    /// The plain value. Only for placing into a step's environment.
    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.expose_secret().is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// A process-wide credential store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Look up a secret by name. `Ok(None)` means the name has no bound value.
    async fn get(&self, name: &str) -> Result<Option<SecretValue>>;
}

/// In-memory store, for tests and embedding.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(name.into(), SecretValue::new(value));
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| Error::Internal("secret store lock poisoned".to_string()))?;
        Ok(secrets.get(name).cloned())
    }
}

/// Reads secrets from the process environment, as `<prefix><NAME>`.
///
/// With prefix `CONVEYOR_SECRET_`, the secret `AWS_ACCESS_KEY_ID` is read from
/// `CONVEYOR_SECRET_AWS_ACCESS_KEY_ID`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        match std::env::var(self.variable_for(name)) {
            Ok(value) => Ok(Some(SecretValue::new(value))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(Error::InvalidInput(format!(
                "secret '{}' is not valid UTF-8",
                name
            ))),
        }
    }
}
