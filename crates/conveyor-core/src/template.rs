//! Infrastructure template provider collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::build::ImageReference;
use crate::stack::{RenderedTemplate, StackDefinition};
use crate::{ResourceId, Result};

/// Values available while rendering stack templates during a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderContext {
    pub run_id: ResourceId,
    /// The image pushed by this build, tagged with the revision tag.
    pub image: ImageReference,
    pub revision: Option<String>,
    pub branch: Option<String>,
    /// Root of the source checkout.
    pub workspace: PathBuf,
    /// Extra variables (pipeline environment).
    pub variables: HashMap<String, String>,
}

/// Renders a stack definition into a deployable template.
///
/// Deferred `${stacks.<stack>.<output>}` references must be preserved;
/// the deployment executor binds them at apply time.
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(
        &self,
        stack: &StackDefinition,
        ctx: &RenderContext,
    ) -> Result<RenderedTemplate>;
}
