//! Deployment action and the target environment collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::stack::{DeploymentOutputs, RenderedTemplate};
use crate::{ResourceId, Result};

/// One stack's deployment within one pipeline execution.
///
/// Created once per run per stack and executed exactly once; the outcome is
/// recorded on the run, the action itself is never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentAction {
    pub id: ResourceId,
    pub run_id: ResourceId,
    pub stack_name: String,
    /// Rendered template produced by the build stage.
    pub template: Artifact,
    pub target_environment: String,
}

impl DeploymentAction {
    pub fn new(
        run_id: ResourceId,
        stack_name: impl Into<String>,
        template: Artifact,
        target_environment: impl Into<String>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            run_id,
            stack_name: stack_name.into(),
            template,
            target_environment: target_environment.into(),
        }
    }
}

/// Target environment deploy API.
#[async_trait]
pub trait DeployTarget: Send + Sync {
    /// Name of this target backend.
    fn name(&self) -> &'static str;

    /// Create or update the stack from a fully bound template and return the
    /// outputs the deployment reports.
    async fn create_or_update(
        &self,
        environment: &str,
        template: &RenderedTemplate,
    ) -> Result<DeploymentOutputs>;

    /// Outputs of the stack as currently deployed, if it exists.
    async fn describe(&self, environment: &str, stack_name: &str)
    -> Result<Option<DeploymentOutputs>>;
}
