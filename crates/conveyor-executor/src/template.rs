//! File-based template provider.
//!
//! A stack's `template` names a file relative to the source checkout. The
//! file and the stack's parameters are interpolated with the build's
//! variables; deferred `${stacks.<stack>.<output>}` references are left for
//! the deployment executor.

use async_trait::async_trait;
use conveyor_config::{VariableContext, VariableContextBuilder};
use conveyor_core::stack::{RenderedTemplate, StackDefinition};
use conveyor_core::template::{RenderContext, TemplateProvider};
use conveyor_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path};
use tracing::debug;

/// Body used for stacks that declare no template file.
pub const EMPTY_TEMPLATE: &str = "{}";

#[derive(Debug, Default, Clone)]
pub struct FileTemplateProvider;

impl FileTemplateProvider {
    pub fn new() -> Self {
        Self
    }

    fn variables(ctx: &RenderContext) -> VariableContext {
        let mut builder = VariableContextBuilder::new()
            .with_image(ctx.image.repository.clone(), ctx.image.tag.to_string())
            .with_run(ctx.run_id.to_string(), "build")
            .with_envs(ctx.variables.clone());
        if let Some(revision) = &ctx.revision {
            builder = builder.with_git_sha(revision.clone());
        }
        if let Some(branch) = &ctx.branch {
            builder = builder.with_git_branch(branch.clone());
        }
        builder.build()
    }
}

/// Template paths must stay inside the checkout.
fn check_relative(path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(Error::InvalidInput(format!(
            "template path {} leaves the source checkout",
            path.display()
        )));
    }
    Ok(())
}

#[async_trait]
impl TemplateProvider for FileTemplateProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn render(
        &self,
        stack: &StackDefinition,
        ctx: &RenderContext,
    ) -> Result<RenderedTemplate> {
        let variables = Self::variables(ctx);

        let body = match &stack.template {
            Some(template) => {
                let relative = Path::new(template);
                check_relative(relative)?;
                let path = ctx.workspace.join(relative);
                let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    Error::NotFound(format!(
                        "template {} for stack {}: {}",
                        path.display(),
                        stack.name,
                        e
                    ))
                })?;
                variables.interpolate(&raw)
            }
            None => EMPTY_TEMPLATE.to_string(),
        };

        let parameters: BTreeMap<String, String> = stack
            .parameters
            .iter()
            .map(|(key, value)| (key.clone(), variables.interpolate(value)))
            .collect();
        let outputs = stack.resource_outputs.keys().cloned().collect();

        let rendered = RenderedTemplate::new(stack.name.clone(), body, parameters, outputs);
        debug!(
            stack = %stack.name,
            checksum = %rendered.checksum,
            deferred = rendered.references().len(),
            "Rendered template"
        );
        Ok(rendered)
    }
}
