//! In-memory deploy target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::deployer::DeployTarget;
use conveyor_core::stack::{DeploymentOutputs, RenderedTemplate};
use conveyor_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// A stack as last applied to the in-memory target.
#[derive(Debug, Clone)]
pub struct DeployedStack {
    pub template: Option<RenderedTemplate>,
    pub outputs: DeploymentOutputs,
    pub applied_at: DateTime<Utc>,
}

/// Records applied templates and synthesizes outputs. Used for dry runs
/// and tests.
///
/// Each declared output gets the value `<environment>/<stack>/<output>`
/// unless fixed outputs were configured for the stack.
#[derive(Default)]
pub struct InMemoryDeployTarget {
    stacks: Mutex<HashMap<(String, String), DeployedStack>>,
    attempts: Mutex<Vec<String>>,
    failing: HashSet<String>,
    fixed_outputs: HashMap<String, DeploymentOutputs>,
    delay: Option<Duration>,
}

impl InMemoryDeployTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every apply of `stack`.
    pub fn failing_on(mut self, stack: impl Into<String>) -> Self {
        self.failing.insert(stack.into());
        self
    }

    /// Report exactly `outputs` when `stack` is applied.
    pub fn with_outputs(mut self, stack: impl Into<String>, outputs: DeploymentOutputs) -> Self {
        self.fixed_outputs.insert(stack.into(), outputs);
        self
    }

    /// Sleep before every apply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Record a stack as already deployed, as if by an earlier run.
    pub fn seed(&self, environment: &str, stack: &str, outputs: DeploymentOutputs) {
        if let Ok(mut stacks) = self.stacks.lock() {
            stacks.insert(
                (environment.to_string(), stack.to_string()),
                DeployedStack {
                    template: None,
                    outputs,
                    applied_at: Utc::now(),
                },
            );
        }
    }

    /// Stack names in the order applies were attempted.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn apply_count(&self, stack: &str) -> usize {
        self.attempts().iter().filter(|s| *s == stack).count()
    }

    pub fn deployed(&self, environment: &str, stack: &str) -> Option<DeployedStack> {
        self.stacks
            .lock()
            .ok()?
            .get(&(environment.to_string(), stack.to_string()))
            .cloned()
    }
}

#[async_trait]
impl DeployTarget for InMemoryDeployTarget {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_or_update(
        &self,
        environment: &str,
        template: &RenderedTemplate,
    ) -> Result<DeploymentOutputs> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let stack = template.stack_name.as_str();
        self.attempts
            .lock()
            .map_err(|_| Error::Internal("attempt log poisoned".to_string()))?
            .push(stack.to_string());

        if self.failing.contains(stack) {
            return Err(Error::DeploymentFailed(format!(
                "stack {} rejected by target",
                stack
            )));
        }
        if let Some(reference) = template.references().first() {
            return Err(Error::InvalidInput(format!(
                "template of {} still references {}",
                stack, reference
            )));
        }

        let outputs = match self.fixed_outputs.get(stack) {
            Some(fixed) => fixed.clone(),
            None => template
                .outputs
                .iter()
                .map(|name| (name.clone(), format!("{}/{}/{}", environment, stack, name)))
                .collect(),
        };

        self.stacks
            .lock()
            .map_err(|_| Error::Internal("stack table poisoned".to_string()))?
            .insert(
                (environment.to_string(), stack.to_string()),
                DeployedStack {
                    template: Some(template.clone()),
                    outputs: outputs.clone(),
                    applied_at: Utc::now(),
                },
            );
        Ok(outputs)
    }

    async fn describe(
        &self,
        environment: &str,
        stack_name: &str,
    ) -> Result<Option<DeploymentOutputs>> {
        Ok(self.deployed(environment, stack_name).map(|s| s.outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn template(stack: &str, outputs: &[&str]) -> RenderedTemplate {
        RenderedTemplate::new(
            stack,
            "{}",
            BTreeMap::new(),
            outputs.iter().map(|o| o.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_synthesizes_declared_outputs() {
        let target = InMemoryDeployTarget::new();
        let outputs = target
            .create_or_update("prod", &template("auth", &["UserPoolId"]))
            .await
            .unwrap();
        assert_eq!(outputs["UserPoolId"], "prod/auth/UserPoolId");
        assert_eq!(target.describe("prod", "auth").await.unwrap(), Some(outputs));
        assert_eq!(target.describe("staging", "auth").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_stack_is_recorded_as_attempt() {
        let target = InMemoryDeployTarget::new().failing_on("api");
        assert!(target.create_or_update("prod", &template("api", &[])).await.is_err());
        assert_eq!(target.attempts(), vec!["api"]);
        assert!(target.deployed("prod", "api").is_none());
    }

    #[tokio::test]
    async fn test_rejects_unbound_template() {
        let target = InMemoryDeployTarget::new();
        let mut params = BTreeMap::new();
        params.insert("Pool".to_string(), "${stacks.auth.UserPoolId}".to_string());
        let unbound = RenderedTemplate::new("api", "{}", params, Vec::new());
        assert!(matches!(
            target.create_or_update("prod", &unbound).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
