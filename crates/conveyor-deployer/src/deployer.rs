//! Stack deployment executor.

use conveyor_core::artifact::{ArtifactStore, get_json};
use conveyor_core::deployer::{DeployTarget, DeploymentAction};
use conveyor_core::stack::{DeploymentOutputs, RenderedTemplate, StackOutputRef};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A failed stack deployment.
#[derive(Debug, Error)]
#[error("deploy of stack '{stack_name}' failed: {cause}")]
pub struct DeployError {
    pub stack_name: String,
    #[source]
    pub cause: DeployCause,
}

#[derive(Debug, Error)]
pub enum DeployCause {
    #[error("template unavailable: {0}")]
    Template(#[source] conveyor_core::Error),

    #[error("unresolved reference {0}")]
    UnresolvedReference(StackOutputRef),

    #[error("deployment did not report declared output '{0}'")]
    MissingOutput(String),

    #[error(transparent)]
    Target(conveyor_core::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
struct AppliedStack {
    checksum: String,
    outputs: DeploymentOutputs,
}

/// Applies rendered stack templates to a [`DeployTarget`].
///
/// Keeps the checksum of the last bound template applied per
/// `(environment, stack)`; re-applying an identical template returns the
/// recorded outputs without calling the target.
pub struct StackDeployer {
    target: Arc<dyn DeployTarget>,
    artifacts: Arc<dyn ArtifactStore>,
    timeout: Option<Duration>,
    applied: Mutex<HashMap<(String, String), AppliedStack>>,
}

impl StackDeployer {
    pub fn new(target: Arc<dyn DeployTarget>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            target,
            artifacts,
            timeout: None,
            applied: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target_name(&self) -> &'static str {
        self.target.name()
    }

    /// Checksum of the template last applied for a stack.
    pub fn applied_checksum(&self, environment: &str, stack: &str) -> Option<String> {
        self.recorded(environment, stack).map(|a| a.checksum)
    }

    fn recorded(&self, environment: &str, stack: &str) -> Option<AppliedStack> {
        self.applied
            .lock()
            .ok()?
            .get(&(environment.to_string(), stack.to_string()))
            .cloned()
    }

    fn record(&self, environment: &str, stack: &str, applied: AppliedStack) {
        if let Ok(mut records) = self.applied.lock() {
            records.insert((environment.to_string(), stack.to_string()), applied);
        }
    }

    /// Deploy one stack.
    ///
    /// `upstream` holds the outputs of stacks already deployed in this run;
    /// deferred references to other stacks fall back to the target's
    /// current outputs for them.
    pub async fn deploy(
        &self,
        action: &DeploymentAction,
        upstream: &HashMap<String, DeploymentOutputs>,
    ) -> Result<DeploymentOutputs, DeployError> {
        let environment = action.target_environment.as_str();
        let stack = action.stack_name.as_str();
        let fail = |cause: DeployCause| DeployError {
            stack_name: stack.to_string(),
            cause,
        };

        let template: RenderedTemplate = get_json(self.artifacts.as_ref(), &action.template)
            .await
            .map_err(|e| fail(DeployCause::Template(e)))?;
        if template.stack_name != stack {
            return Err(fail(DeployCause::Template(
                conveyor_core::Error::InvalidInput(format!(
                    "artifact holds the template of stack '{}'",
                    template.stack_name
                )),
            )));
        }

        let bound = self
            .bind(environment, &template, upstream)
            .await
            .map_err(fail)?;

        if let Some(previous) = self.recorded(environment, stack) {
            if previous.checksum == bound.checksum {
                info!(stack = %stack, environment = %environment, "Template unchanged, skipping apply");
                return Ok(previous.outputs);
            }
        }

        info!(
            stack = %stack,
            environment = %environment,
            target = %self.target.name(),
            checksum = %bound.checksum,
            "Applying stack"
        );
        let apply = self.target.create_or_update(environment, &bound);
        let reported = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, apply)
                .await
                .map_err(|_| fail(DeployCause::Timeout(limit)))?,
            None => apply.await,
        }
        .map_err(|e| fail(DeployCause::Target(e)))?;

        let outputs = declared_outputs(&bound.outputs, reported).map_err(fail)?;
        self.record(
            environment,
            stack,
            AppliedStack {
                checksum: bound.checksum.clone(),
                outputs: outputs.clone(),
            },
        );

        debug!(stack = %stack, outputs = ?outputs.keys().collect::<Vec<_>>(), "Stack deployed");
        Ok(outputs)
    }

    async fn bind(
        &self,
        environment: &str,
        template: &RenderedTemplate,
        upstream: &HashMap<String, DeploymentOutputs>,
    ) -> Result<RenderedTemplate, DeployCause> {
        let references = template.references();
        if references.is_empty() {
            return Ok(template.clone());
        }

        let mut elsewhere: Vec<&str> = references
            .iter()
            .map(|r| r.stack.as_str())
            .filter(|s| !upstream.contains_key(*s))
            .collect();
        elsewhere.sort_unstable();
        elsewhere.dedup();

        let described = join_all(
            elsewhere
                .iter()
                .map(|stack| self.target.describe(environment, stack)),
        )
        .await;

        let mut recorded: HashMap<&str, DeploymentOutputs> = HashMap::new();
        for (stack, result) in elsewhere.iter().zip(described) {
            match result {
                Ok(Some(outputs)) => {
                    recorded.insert(*stack, outputs);
                }
                Ok(None) => {}
                Err(e) => warn!(stack = %stack, error = %e, "Failed to describe stack"),
            }
        }

        template
            .bind(|reference| {
                upstream
                    .get(&reference.stack)
                    .or_else(|| recorded.get(reference.stack.as_str()))
                    .and_then(|outputs| outputs.get(&reference.output))
                    .cloned()
            })
            .map_err(DeployCause::UnresolvedReference)
    }
}

/// Keep only the declared outputs; every one of them must be reported.
fn declared_outputs(
    declared: &[String],
    mut reported: DeploymentOutputs,
) -> Result<DeploymentOutputs, DeployCause> {
    let mut outputs = DeploymentOutputs::new();
    for name in declared {
        let value = reported
            .remove(name)
            .ok_or_else(|| DeployCause::MissingOutput(name.clone()))?;
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDeployTarget;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use conveyor_core::artifact::{Artifact, ArtifactKey, PruneStats, content_digest, put_json};
    use conveyor_core::{Error, ResourceId, Result};
    use std::collections::BTreeMap;

    /// Minimal artifact store for deployer tests.
    #[derive(Default)]
    struct MapStore {
        blobs: Mutex<HashMap<String, Bytes>>,
    }

    #[async_trait]
    impl ArtifactStore for MapStore {
        async fn put(&self, key: ArtifactKey, data: Bytes) -> Result<Artifact> {
            let id = content_digest(&data);
            let size = data.len() as u64;
            self.blobs.lock().unwrap().insert(id.clone(), data);
            Ok(Artifact {
                id,
                key,
                size,
                created_at: Utc::now(),
            })
        }

        async fn get(&self, artifact: &Artifact) -> Result<Bytes> {
            self.blobs
                .lock()
                .unwrap()
                .get(&artifact.id)
                .cloned()
                .ok_or_else(|| Error::NotFound(artifact.id.clone()))
        }

        async fn list(&self, _run_id: &ResourceId) -> Result<Vec<Artifact>> {
            Ok(Vec::new())
        }

        async fn release_run(&self, _run_id: &ResourceId) -> Result<PruneStats> {
            Ok(PruneStats::default())
        }
    }

    struct Fixture {
        store: Arc<MapStore>,
        target: Arc<InMemoryDeployTarget>,
        deployer: StackDeployer,
        run_id: ResourceId,
    }

    fn fixture(target: InMemoryDeployTarget) -> Fixture {
        let store = Arc::new(MapStore::default());
        let target = Arc::new(target);
        let deployer = StackDeployer::new(target.clone(), store.clone());
        Fixture {
            store,
            target,
            deployer,
            run_id: ResourceId::new(),
        }
    }

    impl Fixture {
        async fn action(&self, template: &RenderedTemplate) -> DeploymentAction {
            let key = ArtifactKey::new(self.run_id, "build", format!("template:{}", template.stack_name));
            let artifact = put_json(self.store.as_ref(), key, template).await.unwrap();
            DeploymentAction::new(self.run_id, template.stack_name.clone(), artifact, "prod")
        }
    }

    fn auth_template() -> RenderedTemplate {
        RenderedTemplate::new("auth", "{}", BTreeMap::new(), vec!["UserPoolId".to_string()])
    }

    fn api_template() -> RenderedTemplate {
        let mut params = BTreeMap::new();
        params.insert("UserPoolId".to_string(), "${stacks.auth.UserPoolId}".to_string());
        RenderedTemplate::new("api", "{}", params, vec!["GraphQLUrl".to_string()])
    }

    #[tokio::test]
    async fn test_binds_references_from_upstream_outputs() {
        let f = fixture(InMemoryDeployTarget::new());
        let auth = f.deployer.deploy(&f.action(&auth_template()).await, &HashMap::new()).await.unwrap();
        assert_eq!(auth.keys().collect::<Vec<_>>(), vec!["UserPoolId"]);

        let mut upstream = HashMap::new();
        upstream.insert("auth".to_string(), auth.clone());
        f.deployer.deploy(&f.action(&api_template()).await, &upstream).await.unwrap();

        let deployed = f.target.deployed("prod", "api").unwrap();
        assert_eq!(deployed.template.as_ref().unwrap().parameters["UserPoolId"], auth["UserPoolId"]);
        assert!(deployed.template.as_ref().unwrap().is_bound());
    }

    #[tokio::test]
    async fn test_falls_back_to_recorded_outputs() {
        let mut existing = DeploymentOutputs::new();
        existing.insert("UserPoolId".to_string(), "us-east-1_prev".to_string());
        let target = InMemoryDeployTarget::new();
        target.seed("prod", "auth", existing);
        let f = fixture(target);

        f.deployer.deploy(&f.action(&api_template()).await, &HashMap::new()).await.unwrap();
        let deployed = f.target.deployed("prod", "api").unwrap();
        assert_eq!(deployed.template.as_ref().unwrap().parameters["UserPoolId"], "us-east-1_prev");
    }

    #[tokio::test]
    async fn test_unresolved_reference_fails_before_apply() {
        let f = fixture(InMemoryDeployTarget::new());
        let err = f
            .deployer
            .deploy(&f.action(&api_template()).await, &HashMap::new())
            .await
            .unwrap_err();

        assert_eq!(err.stack_name, "api");
        assert!(matches!(err.cause, DeployCause::UnresolvedReference(ref r) if r.stack == "auth"));
        assert_eq!(f.target.apply_count("api"), 0);
    }

    #[tokio::test]
    async fn test_identical_reapply_is_noop() {
        let f = fixture(InMemoryDeployTarget::new());
        let action = f.action(&auth_template()).await;

        let first = f.deployer.deploy(&action, &HashMap::new()).await.unwrap();
        let second = f.deployer.deploy(&action, &HashMap::new()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.target.apply_count("auth"), 1);
        assert!(f.deployer.applied_checksum("prod", "auth").is_some());
    }

    #[tokio::test]
    async fn test_changed_template_is_reapplied() {
        let f = fixture(InMemoryDeployTarget::new());
        f.deployer.deploy(&f.action(&auth_template()).await, &HashMap::new()).await.unwrap();

        let changed = RenderedTemplate::new(
            "auth",
            r#"{"mfa": true}"#,
            BTreeMap::new(),
            vec!["UserPoolId".to_string()],
        );
        f.deployer.deploy(&f.action(&changed).await, &HashMap::new()).await.unwrap();
        assert_eq!(f.target.apply_count("auth"), 2);
    }

    #[tokio::test]
    async fn test_missing_declared_output() {
        let mut partial = DeploymentOutputs::new();
        partial.insert("Unrelated".to_string(), "x".to_string());
        let f = fixture(InMemoryDeployTarget::new().with_outputs("auth", partial));

        let err = f
            .deployer
            .deploy(&f.action(&auth_template()).await, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err.cause, DeployCause::MissingOutput(ref o) if o == "UserPoolId"));
        assert!(f.deployer.applied_checksum("prod", "auth").is_none());
    }

    #[tokio::test]
    async fn test_target_failure() {
        let f = fixture(InMemoryDeployTarget::new().failing_on("auth"));
        let err = f
            .deployer
            .deploy(&f.action(&auth_template()).await, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err.cause, DeployCause::Target(Error::DeploymentFailed(_))));
        assert!(err.to_string().contains("auth"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let store = Arc::new(MapStore::default());
        let target = Arc::new(InMemoryDeployTarget::new().with_delay(Duration::from_millis(500)));
        let deployer = StackDeployer::new(target, store.clone())
            .with_timeout(Some(Duration::from_millis(20)));

        let run_id = ResourceId::new();
        let artifact = put_json(
            store.as_ref(),
            ArtifactKey::new(run_id, "build", "template:auth"),
            &auth_template(),
        )
        .await
        .unwrap();
        let action = DeploymentAction::new(run_id, "auth", artifact, "prod");

        let err = deployer.deploy(&action, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err.cause, DeployCause::Timeout(_)));
    }

    #[tokio::test]
    async fn test_template_for_other_stack_rejected() {
        let f = fixture(InMemoryDeployTarget::new());
        let mut action = f.action(&auth_template()).await;
        action.stack_name = "api".to_string();
        let err = f.deployer.deploy(&action, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err.cause, DeployCause::Template(_)));
    }
}
