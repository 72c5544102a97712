//! Build executor.
//!
//! Runs the build phases of one pipeline execution, renders every stack's
//! template and pushes the image under `latest` and the revision tag. Only a
//! fully successful build stores its template and manifest artifacts.

use conveyor_config::{VariableContext, VariableContextBuilder};
use conveyor_core::artifact::{Artifact, ArtifactKey, ArtifactStore, get_json, put_json};
use conveyor_core::build::{
    BuildPhase, BuildSpec, IMAGE_REPOSITORY_ENV, IMAGE_TAG_ENV, IMAGE_URI_ENV, ImageReference,
    ImageTag, SOURCE_BRANCH_ENV, SOURCE_REVISION_ENV,
};
use conveyor_core::executor::{Executor, JobHandle, JobResult, JobSpec};
use conveyor_core::pipeline::{BUILD_STAGE, PipelineEvent, StageStatus, Trigger, TriggerKind};
use conveyor_core::registry::ContainerRegistry;
use conveyor_core::secret::{SecretStore, SecretValue};
use conveyor_core::source::SourceCheckout;
use conveyor_core::stack::{RenderedTemplate, StackDefinition};
use conveyor_core::template::{RenderContext, TemplateProvider};
use conveyor_core::ResourceId;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::EventBus;

/// Name of the manifest artifact the build stage produces.
pub const MANIFEST_ARTIFACT: &str = "manifest";

/// Artifact name of a stack's rendered template.
pub fn template_artifact_name(stack: &str) -> String {
    format!("template:{}", stack)
}

/// Event stage name of a build phase, e.g. `build:pre_build`.
pub fn phase_stage(phase: BuildPhase) -> String {
    format!("{}:{}", BUILD_STAGE, phase)
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("source artifact unavailable: {0}")]
    Source(#[source] conveyor_core::Error),

    #[error("secret '{name}' unavailable: {source}")]
    Secret {
        name: String,
        #[source]
        source: conveyor_core::Error,
    },

    #[error("command `{command}` in phase {phase} failed ({})", exit_status(.exit_code))]
    Command {
        phase: BuildPhase,
        command: String,
        exit_code: Option<i32>,
        /// Everything the build printed up to and including the failure.
        output: String,
    },

    #[error("push of tag '{tag}' failed: {output}")]
    Push { tag: String, output: String },

    #[error("rendering template for stack '{stack}' failed: {message}")]
    Render { stack: String, message: String },

    #[error("storing build artifacts failed: {0}")]
    Artifact(#[source] conveyor_core::Error),
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_string(),
    }
}

impl BuildError {
    /// Captured output for command and push failures.
    pub fn output(&self) -> Option<&str> {
        match self {
            BuildError::Command { output, .. } | BuildError::Push { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<BuildPhase> {
        match self {
            BuildError::Command { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// The build artifact's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    /// Image tagged with the revision tag.
    pub image: ImageReference,
    /// Every reference pushed (`latest` and the revision tag).
    pub pushed: Vec<ImageReference>,
    /// Rendered template artifact per stack.
    pub templates: BTreeMap<String, Artifact>,
}

/// A stored build manifest.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub artifact: Artifact,
    pub manifest: BuildManifest,
}

/// Everything one build needs.
pub struct BuildRequest<'a> {
    pub run_id: ResourceId,
    pub pipeline: &'a str,
    pub trigger: &'a Trigger,
    pub spec: &'a BuildSpec,
    /// Artifact holding the [`SourceCheckout`].
    pub source: &'a Artifact,
    pub stacks: &'a [StackDefinition],
    /// Caller environment; `SOURCE_REVISION` selects the image tag.
    pub env: &'a HashMap<String, String>,
}

/// Runs builds through the collaborator traits.
pub struct BuildRunner {
    executor: Arc<dyn Executor>,
    registry: Arc<dyn ContainerRegistry>,
    templates: Arc<dyn TemplateProvider>,
    secrets: Arc<dyn SecretStore>,
    artifacts: Arc<dyn ArtifactStore>,
    events: EventBus,
}

impl BuildRunner {
    pub fn new(
        executor: Arc<dyn Executor>,
        registry: Arc<dyn ContainerRegistry>,
        templates: Arc<dyn TemplateProvider>,
        secrets: Arc<dyn SecretStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            executor,
            registry,
            templates,
            secrets,
            artifacts,
            events: EventBus::default(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub async fn run_build(&self, req: BuildRequest<'_>) -> Result<BuildArtifact, BuildError> {
        let checkout: SourceCheckout = get_json(self.artifacts.as_ref(), req.source)
            .await
            .map_err(BuildError::Source)?;

        let revision = req
            .env
            .get(SOURCE_REVISION_ENV)
            .cloned()
            .or_else(|| checkout.revision.clone())
            .filter(|r| !r.trim().is_empty());
        let branch = req
            .env
            .get(SOURCE_BRANCH_ENV)
            .cloned()
            .or_else(|| checkout.branch.clone())
            .or_else(|| req.trigger.branch.clone());
        let image = ImageReference::new(
            req.spec.image_repository.clone(),
            ImageTag::from_revision(revision.as_deref()),
        );
        info!(run_id = %req.run_id, image = %image, "Starting build");

        let secrets = self.resolve_secrets(&req.spec.secrets).await?;
        let vars = variables(&req, &image, revision.as_deref(), branch.as_deref(), &secrets);

        // Pipeline env, caller env, build values, then secrets.
        let mut plain_env = vars.interpolate_map(&req.spec.env);
        plain_env.extend(req.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(revision) = &revision {
            plain_env.insert(SOURCE_REVISION_ENV.to_string(), revision.clone());
        }
        if let Some(branch) = &branch {
            plain_env.insert(SOURCE_BRANCH_ENV.to_string(), branch.clone());
        }
        plain_env.insert(IMAGE_REPOSITORY_ENV.to_string(), image.repository.clone());
        plain_env.insert(IMAGE_TAG_ENV.to_string(), image.tag.to_string());
        plain_env.insert(IMAGE_URI_ENV.to_string(), image.to_string());
        let mut job_env = plain_env.clone();
        job_env.extend(secrets);

        let mut transcript = String::new();
        for phase in BuildPhase::ALL {
            self.run_phase(&req, phase, &checkout.workspace, &job_env, &vars, &mut transcript)
                .await?;
        }

        let ctx = RenderContext {
            run_id: req.run_id,
            image: image.clone(),
            revision: revision.clone(),
            branch: branch.clone(),
            workspace: checkout.workspace.clone(),
            variables: plain_env,
        };
        let mut rendered: Vec<RenderedTemplate> = Vec::with_capacity(req.stacks.len());
        for stack in req.stacks {
            let template = self
                .templates
                .render(stack, &ctx)
                .await
                .map_err(|e| BuildError::Render {
                    stack: stack.name.clone(),
                    message: vars.mask(&e.to_string()),
                })?;
            rendered.push(template);
        }

        let pushed = self.push(&image, &vars).await?;

        let mut templates = BTreeMap::new();
        for template in &rendered {
            let key = ArtifactKey::new(
                req.run_id,
                BUILD_STAGE,
                template_artifact_name(&template.stack_name),
            );
            let artifact = put_json(self.artifacts.as_ref(), key, template)
                .await
                .map_err(BuildError::Artifact)?;
            templates.insert(template.stack_name.clone(), artifact);
        }

        let manifest = BuildManifest {
            image,
            pushed,
            templates,
        };
        let artifact = put_json(
            self.artifacts.as_ref(),
            ArtifactKey::new(req.run_id, BUILD_STAGE, MANIFEST_ARTIFACT),
            &manifest,
        )
        .await
        .map_err(BuildError::Artifact)?;

        info!(run_id = %req.run_id, image = %manifest.image, templates = manifest.templates.len(), "Build finished");
        Ok(BuildArtifact { artifact, manifest })
    }

    async fn resolve_secrets(&self, names: &[String]) -> Result<Vec<(String, String)>, BuildError> {
        let mut resolved = Vec::new();
        for name in names {
            let value = self
                .secrets
                .get(name)
                .await
                .map_err(|source| BuildError::Secret {
                    name: name.clone(),
                    source,
                })?;
            match value {
                SecretValue::String(value) => resolved.push((name.clone(), value)),
                SecretValue::Map(entries) => {
                    for (key, value) in entries {
                        resolved.push((format!("{}_{}", name, key.to_uppercase()), value));
                    }
                }
            }
        }
        Ok(resolved)
    }

    async fn run_phase(
        &self,
        req: &BuildRequest<'_>,
        phase: BuildPhase,
        workspace: &Path,
        env: &HashMap<String, String>,
        vars: &VariableContext,
        transcript: &mut String,
    ) -> Result<(), BuildError> {
        let commands = req.spec.commands(phase);
        if commands.is_empty() {
            return Ok(());
        }

        let stage = phase_stage(phase);
        self.events
            .emit(PipelineEvent::new(req.run_id, stage.as_str(), StageStatus::Started));
        let deadline = req.spec.timeout(phase).map(|limit| Instant::now() + limit);

        for command in commands {
            let command = vars.interpolate(command);
            let step = Step {
                phase,
                command: &command,
                image: req.spec.builder_image.as_deref(),
                workspace,
                env,
                deadline,
            };
            if let Err(e) = self.run_command(step, vars, transcript).await {
                self.events
                    .emit(PipelineEvent::failed(req.run_id, stage.as_str(), e.to_string()));
                return Err(e);
            }
        }

        self.events
            .emit(PipelineEvent::new(req.run_id, stage, StageStatus::Succeeded));
        Ok(())
    }

    async fn run_command(
        &self,
        step: Step<'_>,
        vars: &VariableContext,
        transcript: &mut String,
    ) -> Result<(), BuildError> {
        let shown = vars.mask(step.command);
        let failed = |exit_code: Option<i32>, transcript: &str| BuildError::Command {
            phase: step.phase,
            command: shown.clone(),
            exit_code,
            output: transcript.to_string(),
        };

        info!(phase = %step.phase, command = %shown, "Running command");
        transcript.push_str(&format!("$ {}\n", shown));

        let mut job = JobSpec::shell(step.command);
        job.image = step.image.map(str::to_string);
        job.working_dir = Some(step.workspace.to_path_buf());
        job.env = step.env.clone();

        let handle = match self.executor.spawn(job).await {
            Ok(handle) => handle,
            Err(e) => {
                transcript.push_str(&vars.mask(&e.to_string()));
                transcript.push('\n');
                return Err(failed(None, transcript));
            }
        };

        let finished = {
            let run = collect(self.executor.as_ref(), &handle, vars, step.phase, transcript);
            match step.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, run).await.ok(),
                None => Some(run.await),
            }
        };

        let Some(result) = finished else {
            warn!(phase = %step.phase, command = %shown, "Phase timed out, cancelling command");
            if let Err(e) = self.executor.cancel(&handle).await {
                warn!(error = %e, "Failed to cancel timed out command");
            }
            if let Err(e) = self.executor.wait(&handle).await {
                debug!(error = %e, "Wait after cancel failed");
            }
            transcript.push_str(&format!("phase {} timed out\n", step.phase));
            return Err(failed(None, transcript));
        };

        match result {
            Ok(result) if result.succeeded() => Ok(()),
            Ok(result) => {
                transcript.push_str(&format!("command exited ({})\n", exit_status(&result.exit_code)));
                Err(failed(result.exit_code, transcript))
            }
            Err(e) => {
                transcript.push_str(&vars.mask(&e.to_string()));
                transcript.push('\n');
                Err(failed(None, transcript))
            }
        }
    }

    /// Authenticate once, then push `latest` and the revision tag.
    async fn push(
        &self,
        image: &ImageReference,
        vars: &VariableContext,
    ) -> Result<Vec<ImageReference>, BuildError> {
        let mut tags = vec![ImageTag::latest()];
        if !image.tag.is_latest() {
            tags.push(image.tag.clone());
        }

        let credentials = self
            .registry
            .authenticate()
            .await
            .map_err(|e| BuildError::Push {
                tag: ImageTag::LATEST.to_string(),
                output: format!("authentication failed: {}", vars.mask(&e.to_string())),
            })?;

        let mut pushed = Vec::with_capacity(tags.len());
        for tag in &tags {
            info!(image = %image.repository, tag = %tag, registry = %self.registry.name(), "Pushing image");
            let reference = self
                .registry
                .push(image, tag, &credentials)
                .await
                .map_err(|e| BuildError::Push {
                    tag: tag.to_string(),
                    output: vars.mask(&e.to_string()),
                })?;
            pushed.push(reference);
        }
        Ok(pushed)
    }
}

struct Step<'a> {
    phase: BuildPhase,
    command: &'a str,
    image: Option<&'a str>,
    workspace: &'a Path,
    env: &'a HashMap<String, String>,
    deadline: Option<Instant>,
}

fn variables(
    req: &BuildRequest<'_>,
    image: &ImageReference,
    revision: Option<&str>,
    branch: Option<&str>,
    secrets: &[(String, String)],
) -> VariableContext {
    let trigger = match req.trigger.kind {
        TriggerKind::Push => "push",
        TriggerKind::Manual => "manual",
    };
    let mut builder = VariableContextBuilder::new()
        .with_pipeline(req.pipeline)
        .with_run(req.run_id.to_string(), trigger)
        .with_image(image.repository.clone(), image.tag.to_string())
        .with_envs(req.spec.env.clone())
        .with_envs(req.env.clone());
    if let Some(revision) = revision {
        builder = builder.with_git_sha(revision);
    }
    if let Some(branch) = branch {
        builder = builder.with_git_branch(branch);
    }
    for (name, value) in secrets {
        builder = builder.with_secret(name.clone(), value.clone());
    }
    builder.build()
}

/// Drain a job's logs into the transcript, then wait for it.
async fn collect(
    executor: &dyn Executor,
    handle: &JobHandle,
    vars: &VariableContext,
    phase: BuildPhase,
    transcript: &mut String,
) -> conveyor_core::Result<JobResult> {
    let mut logs = executor.logs(handle).await?;
    while let Some(line) = logs.next().await {
        let content = vars.mask(&line.content);
        debug!(phase = %phase, stream = ?line.stream, "{}", content);
        transcript.push_str(&content);
        transcript.push('\n');
    }
    executor.wait(handle).await
}
