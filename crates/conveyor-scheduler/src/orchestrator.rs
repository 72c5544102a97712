//! Pipeline orchestrator - runs Source, Build and the deploy stages of one
//! pipeline execution.

use chrono::{DateTime, Utc};
use conveyor_core::artifact::{ArtifactKey, ArtifactStore, put_json};
use conveyor_core::build::ImageReference;
use conveyor_core::deployer::DeploymentAction;
use conveyor_core::graph::{GraphError, resolve_order, waves};
use conveyor_core::pipeline::{
    BUILD_STAGE, DeployMode, ExecutionPlan, PipelineDefinition, PipelineEvent, PipelineStage,
    PlanError, RUN_EVENT_STAGE, RunState, SOURCE_STAGE, StageStatus, Trigger,
};
use conveyor_core::source::SourceProvider;
use conveyor_core::stack::{DeploymentOutputs, StackDefinition};
use conveyor_core::ResourceId;
use conveyor_deployer::{DeployError, StackDeployer};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

use crate::build::{BuildError, BuildManifest, BuildRequest, BuildRunner};
use crate::events::EventBus;

/// Name of the source checkout artifact.
pub const CHECKOUT_ARTIFACT: &str = "checkout";

/// Stage recorded when the deploy order cannot be planned.
pub const PLAN_STAGE: &str = "plan";

/// Cooperative cancellation, observed at stage boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("source unavailable: {0}")]
    Source(#[source] conveyor_core::Error),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid execution plan: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("artifact store: {0}")]
    Artifact(#[source] conveyor_core::Error),

    #[error("cancelled before stage {0}")]
    Cancelled(String),
}

impl RunError {
    pub fn output(&self) -> Option<&str> {
        match self {
            RunError::Build(e) => e.output(),
            _ => None,
        }
    }
}

/// Outcome of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: ResourceId,
    pub pipeline: String,
    pub trigger: Trigger,
    pub state: RunState,
    pub revision: Option<String>,
    pub image: Option<ImageReference>,
    /// Stacks in resolved deploy order, once planned.
    pub stack_order: Vec<String>,
    /// Stacks deployed by this run, in completion order.
    pub deployed: Vec<String>,
    pub failed_stacks: Vec<String>,
    /// Stacks never attempted because the run stopped first.
    pub skipped: Vec<String>,
    pub outputs: BTreeMap<String, DeploymentOutputs>,
    pub error: Option<String>,
    /// Captured build output when a build command or push failed.
    pub output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub(crate) fn new(run_id: ResourceId, pipeline: &str, trigger: Trigger) -> Self {
        Self {
            run_id,
            pipeline: pipeline.to_string(),
            trigger,
            state: RunState::Idle,
            revision: None,
            image: None,
            stack_order: Vec::new(),
            deployed: Vec::new(),
            failed_stacks: Vec::new(),
            skipped: Vec::new(),
            outputs: BTreeMap::new(),
            error: None,
            output: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Per-run bookkeeping threaded through the stages.
struct RunContext<'a> {
    run_id: ResourceId,
    cancel: &'a CancelSignal,
    /// Stage currently executing.
    stage: String,
    report: RunReport,
}

/// Orchestrates pipeline executions against one pipeline definition.
pub struct PipelineOrchestrator {
    pipeline: PipelineDefinition,
    source: Arc<dyn SourceProvider>,
    builder: BuildRunner,
    deployer: StackDeployer,
    artifacts: Arc<dyn ArtifactStore>,
    events: EventBus,
    env: HashMap<String, String>,
}

impl PipelineOrchestrator {
    pub fn new(
        pipeline: PipelineDefinition,
        source: Arc<dyn SourceProvider>,
        builder: BuildRunner,
        deployer: StackDeployer,
        artifacts: Arc<dyn ArtifactStore>,
        events: EventBus,
    ) -> Self {
        Self {
            pipeline,
            source,
            builder: builder.with_events(events.clone()),
            deployer,
            artifacts,
            events,
            env: HashMap::new(),
        }
    }

    /// Environment handed to every build, e.g. `SOURCE_REVISION`.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run the pipeline once for `trigger`. Never fails; the outcome is in
    /// the report.
    pub async fn execute(
        &self,
        run_id: ResourceId,
        trigger: Trigger,
        cancel: CancelSignal,
    ) -> RunReport {
        info!(run_id = %run_id, pipeline = %self.pipeline.name, trigger = ?trigger.kind, revision = ?trigger.revision, "Starting run");
        self.events
            .emit(PipelineEvent::new(run_id, RUN_EVENT_STAGE, StageStatus::Started));
        self.events.set_state(run_id, RunState::Idle);

        let mut ctx = RunContext {
            run_id,
            cancel: &cancel,
            stage: SOURCE_STAGE.to_string(),
            report: RunReport::new(run_id, &self.pipeline.name, trigger),
        };
        let result = self.run_stages(&mut ctx).await;
        self.finish(ctx, result).await
    }

    async fn run_stages(&self, ctx: &mut RunContext<'_>) -> Result<(), RunError> {
        let run_id = ctx.run_id;

        self.begin(ctx, SOURCE_STAGE)?;
        let checkout = self
            .source
            .fetch(&run_id, &ctx.report.trigger)
            .await
            .map_err(RunError::Source)?;
        ctx.report.revision = checkout.revision.clone();
        let source = put_json(
            self.artifacts.as_ref(),
            ArtifactKey::new(run_id, SOURCE_STAGE, CHECKOUT_ARTIFACT),
            &checkout,
        )
        .await
        .map_err(RunError::Artifact)?;
        self.succeed(run_id, SOURCE_STAGE);
        self.events.set_state(run_id, RunState::SourceFetched);

        self.begin(ctx, BUILD_STAGE)?;
        let build = self
            .builder
            .run_build(BuildRequest {
                run_id,
                pipeline: &self.pipeline.name,
                trigger: &ctx.report.trigger,
                spec: &self.pipeline.build,
                source: &source,
                stacks: &self.pipeline.stacks,
                env: &self.env,
            })
            .await?;
        ctx.report.image = Some(build.manifest.image.clone());
        self.succeed(run_id, BUILD_STAGE);
        self.events.set_state(run_id, RunState::Built);

        ctx.stage = PLAN_STAGE.to_string();
        let order = resolve_order(&self.pipeline.stacks)?;
        let plan = ExecutionPlan::for_stacks(&order);
        plan.validate()?;
        ctx.report.stack_order = plan.stack_order().into_iter().map(str::to_string).collect();
        info!(run_id = %run_id, order = ?ctx.report.stack_order, mode = ?self.pipeline.deploy.mode, "Planned deployment");

        match self.pipeline.deploy.mode {
            DeployMode::Sequential => {
                self.deploy_sequential(ctx, &order, &build.manifest).await
            }
            DeployMode::Waves => {
                self.deploy_waves(ctx, &order, &build.manifest).await
            }
        }
    }

    /// One stack at a time; the first failure stops the run.
    async fn deploy_sequential(
        &self,
        ctx: &mut RunContext<'_>,
        order: &[StackDefinition],
        manifest: &BuildManifest,
    ) -> Result<(), RunError> {
        let mut upstream: HashMap<String, DeploymentOutputs> = HashMap::new();
        for (index, stack) in order.iter().enumerate() {
            self.begin(ctx, &PipelineStage::deploy_name(&stack.name))?;
            self.events.set_state(
                ctx.run_id,
                RunState::Deploying {
                    index,
                    stack: stack.name.clone(),
                },
            );

            match self.deploy_stack(ctx.run_id, stack, manifest, &upstream).await {
                Ok(outputs) => {
                    ctx.report.deployed.push(stack.name.clone());
                    ctx.report.outputs.insert(stack.name.clone(), outputs.clone());
                    upstream.insert(stack.name.clone(), outputs);
                }
                Err(e) => {
                    ctx.report.failed_stacks.push(stack.name.clone());
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Stacks of equal depth concurrently. A failed wave ends the run once
    /// its in-flight siblings settle.
    async fn deploy_waves(
        &self,
        ctx: &mut RunContext<'_>,
        order: &[StackDefinition],
        manifest: &BuildManifest,
    ) -> Result<(), RunError> {
        let run_id = ctx.run_id;
        let mut upstream: HashMap<String, DeploymentOutputs> = HashMap::new();
        let mut index = 0;
        for wave in waves(order) {
            let names: Vec<&str> = wave.iter().map(|s| s.name.as_str()).collect();
            self.begin(ctx, &PipelineStage::deploy_name(&names.join(",")))?;
            self.events.set_state(
                run_id,
                RunState::Deploying {
                    index,
                    stack: names.join(","),
                },
            );
            index += wave.len();

            let results = join_all(
                wave.iter()
                    .map(|stack| self.deploy_stack(run_id, stack, manifest, &upstream)),
            )
            .await;

            let mut first_error = None;
            for (stack, result) in wave.iter().zip(results) {
                match result {
                    Ok(outputs) => {
                        ctx.report.deployed.push(stack.name.clone());
                        ctx.report.outputs.insert(stack.name.clone(), outputs.clone());
                        upstream.insert(stack.name.clone(), outputs);
                    }
                    Err(e) => {
                        ctx.report.failed_stacks.push(stack.name.clone());
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn deploy_stack(
        &self,
        run_id: ResourceId,
        stack: &StackDefinition,
        manifest: &BuildManifest,
        upstream: &HashMap<String, DeploymentOutputs>,
    ) -> Result<DeploymentOutputs, RunError> {
        let stage = PipelineStage::deploy_name(&stack.name);
        self.events
            .emit(PipelineEvent::new(run_id, stage.as_str(), StageStatus::Started));

        let result = async {
            let template = manifest.templates.get(&stack.name).cloned().ok_or_else(|| {
                RunError::Artifact(conveyor_core::Error::NotFound(format!(
                    "template artifact of stack {}",
                    stack.name
                )))
            })?;
            let action = DeploymentAction::new(
                run_id,
                stack.name.as_str(),
                template,
                self.pipeline.deploy.environment.as_str(),
            );
            info!(run_id = %run_id, stack = %stack.name, environment = %action.target_environment, target = %self.deployer.target_name(), "Deploying stack");
            let outputs = self.deployer.deploy(&action, upstream).await?;
            put_json(
                self.artifacts.as_ref(),
                ArtifactKey::new(run_id, stage.as_str(), PipelineStage::outputs_name(&stack.name)),
                &outputs,
            )
            .await
            .map_err(RunError::Artifact)?;
            Ok::<_, RunError>(outputs)
        }
        .await;

        match &result {
            Ok(_) => self.succeed(run_id, &stage),
            Err(e) => self
                .events
                .emit(PipelineEvent::failed(run_id, stage.as_str(), e.to_string())),
        }
        result
    }

    /// Enter a stage unless the run was cancelled.
    fn begin(&self, ctx: &mut RunContext<'_>, stage: &str) -> Result<(), RunError> {
        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled(stage.to_string()));
        }
        ctx.stage = stage.to_string();
        if !stage.starts_with("deploy:") {
            self.events
                .emit(PipelineEvent::new(ctx.run_id, stage, StageStatus::Started));
        }
        Ok(())
    }

    fn succeed(&self, run_id: ResourceId, stage: &str) {
        self.events
            .emit(PipelineEvent::new(run_id, stage, StageStatus::Succeeded));
    }

    async fn finish(&self, ctx: RunContext<'_>, result: Result<(), RunError>) -> RunReport {
        let RunContext {
            run_id,
            stage,
            mut report,
            ..
        } = ctx;

        report.skipped = report
            .stack_order
            .iter()
            .filter(|s| !report.deployed.contains(s) && !report.failed_stacks.contains(s))
            .cloned()
            .collect();
        if result.is_err() && report.stack_order.is_empty() {
            report.skipped = self.pipeline.stacks.iter().map(|s| s.name.clone()).collect();
        }

        let (state, run_event) = match result {
            Ok(()) => (
                RunState::Completed,
                PipelineEvent::new(run_id, RUN_EVENT_STAGE, StageStatus::Succeeded),
            ),
            Err(RunError::Cancelled(at)) => {
                warn!(run_id = %run_id, stage = %at, "Run cancelled");
                report.error = Some(format!("cancelled before stage {}", at));
                (
                    RunState::Cancelled,
                    PipelineEvent::new(run_id, RUN_EVENT_STAGE, StageStatus::Cancelled),
                )
            }
            Err(e) => {
                // deploy stages report their own failure
                let failed_stage = match report.failed_stacks.first() {
                    Some(stack) => PipelineStage::deploy_name(stack),
                    None => {
                        self.events.emit(PipelineEvent::failed(
                            run_id,
                            stage.as_str(),
                            e.to_string(),
                        ));
                        stage
                    }
                };
                report.error = Some(e.to_string());
                report.output = e.output().map(str::to_string);
                (
                    RunState::Failed {
                        stage: failed_stage,
                    },
                    PipelineEvent::failed(run_id, RUN_EVENT_STAGE, e.to_string()),
                )
            }
        };

        for stack in &report.skipped {
            self.events.emit(PipelineEvent::new(
                run_id,
                PipelineStage::deploy_name(stack),
                StageStatus::Skipped,
            ));
        }

        self.events.set_state(run_id, state.clone());
        report.state = state;
        report.finished_at = Some(Utc::now());
        self.events.emit(run_event);

        match self.artifacts.release_run(&run_id).await {
            Ok(stats) => info!(
                run_id = %run_id,
                artifacts = stats.artifacts_deleted,
                bytes = stats.bytes_freed,
                "Released run artifacts"
            ),
            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to release run artifacts"),
        }
        self.events.clear(&run_id);

        info!(
            run_id = %run_id,
            state = %report.state,
            deployed = report.deployed.len(),
            "Run finished"
        );
        report
    }
}
