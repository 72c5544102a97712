//! Secret store backends.

use async_trait::async_trait;
use conveyor_core::secret::{SecretStore, SecretValue};
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// Reads secrets from environment variables: secret `GITHUB_TOKEN` with
/// prefix `CONVEYOR_SECRET_` is `$CONVEYOR_SECRET_GITHUB_TOKEN`.
pub struct EnvSecretStore {
    prefix: String,
    vars: HashMap<String, String>,
}

impl EnvSecretStore {
    /// Snapshot the process environment.
    pub fn from_env(prefix: impl Into<String>) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    pub fn from_vars<I>(prefix: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = prefix.into();
        let vars = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix.as_str())
                    .map(|name| (name.to_string(), value))
            })
            .collect();
        Self { prefix, vars }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<SecretValue> {
        self.vars
            .get(name)
            .cloned()
            .map(SecretValue::String)
            .ok_or_else(|| Error::NotFound(format!("secret {} ({}{})", name, self.prefix, name)))
    }

    async fn get_key(&self, name: &str, key: &str) -> Result<String> {
        // Env secrets are flat; `NAME` + `KEY` reads `NAME_KEY`.
        let flat = format!("{}_{}", name, key);
        match self.get(&flat).await? {
            SecretValue::String(value) => Ok(value),
            SecretValue::Map(_) => Err(Error::Internal(format!("secret {} is a map", flat))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .vars
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Secrets held in memory.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, SecretValue::String(value.into()));
        self
    }

    pub fn insert(&self, name: impl Into<String>, value: SecretValue) {
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(name.into(), value);
        }
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, name: &str) -> Result<SecretValue> {
        self.secrets
            .read()
            .map_err(|_| Error::Internal("secret store poisoned".to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret {}", name)))
    }

    async fn get_key(&self, name: &str, key: &str) -> Result<String> {
        let value = self.get(name).await?;
        value
            .get(key)
            .map(str::to_string)
            .ok_or_else(|| Error::NotFound(format!("key {} in secret {}", key, name)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| Error::Internal("secret store poisoned".to_string()))?;
        let mut names: Vec<String> = secrets
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_store() -> EnvSecretStore {
        EnvSecretStore::from_vars(
            "CONVEYOR_SECRET_",
            vec![
                ("CONVEYOR_SECRET_GITHUB_TOKEN".to_string(), "ghp_abc".to_string()),
                ("CONVEYOR_SECRET_REGISTRY_PASSWORD".to_string(), "pw".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ],
        )
    }

    #[tokio::test]
    async fn test_env_store_strips_prefix() {
        let store = env_store();
        assert_eq!(
            store.get("GITHUB_TOKEN").await.unwrap().as_string(),
            Some("ghp_abc")
        );
        assert!(matches!(store.get("HOME").await, Err(Error::NotFound(_))));
        assert_eq!(store.get_key("REGISTRY", "PASSWORD").await.unwrap(), "pw");
        assert_eq!(
            store.list("").await.unwrap(),
            vec!["GITHUB_TOKEN", "REGISTRY_PASSWORD"]
        );
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemorySecretStore::new().with_secret("NPM_TOKEN", "npm_123");
        let mut registry = HashMap::new();
        registry.insert("username".to_string(), "AWS".to_string());
        store.insert("registry", SecretValue::Map(registry));

        assert_eq!(store.get("NPM_TOKEN").await.unwrap().as_string(), Some("npm_123"));
        assert_eq!(store.get_key("registry", "username").await.unwrap(), "AWS");
        assert!(store.get_key("registry", "password").await.is_err());
        assert_eq!(store.list("NPM").await.unwrap(), vec!["NPM_TOKEN"]);
    }
}
