//! Pipeline definition, execution plans, triggers and run events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::ResourceId;
use crate::build::BuildSpec;
use crate::stack::StackDefinition;

/// Name of the source stage and of the artifact it produces.
pub const SOURCE_STAGE: &str = "source";
/// Name of the build stage and of the artifact it produces.
pub const BUILD_STAGE: &str = "build";

/// A parsed pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub source: SourceSettings,
    pub build: BuildSpec,
    /// Registered stacks in declaration order.
    pub stacks: Vec<StackDefinition>,
    pub deploy: DeploySettings,
}

impl PipelineDefinition {
    pub fn stack(&self, name: &str) -> Option<&StackDefinition> {
        self.stacks.iter().find(|s| s.name == name)
    }
}

/// Where source comes from and which branch is tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Repository URL or local path. `None` uses the caller's checkout.
    pub repository: Option<String>,
    /// Branch whose pushes trigger a run.
    pub branch: String,
    /// Secret holding the source-control access token.
    pub token_secret: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            repository: None,
            branch: "main".to_string(),
            token_secret: None,
        }
    }
}

/// How deploy stages run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// One stack at a time in resolved order.
    #[default]
    Sequential,
    /// Independent stacks of the same depth concurrently.
    Waves,
}

impl std::str::FromStr for DeployMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(DeployMode::Sequential),
            "waves" => Ok(DeployMode::Waves),
            _ => Err(format!("unknown deploy mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    /// Target environment name handed to the deploy target.
    pub environment: String,
    /// Timeout for a single stack deployment.
    pub timeout: Option<Duration>,
    pub mode: DeployMode,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            timeout: None,
            mode: DeployMode::Sequential,
        }
    }
}

/// Kind of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Source,
    Build,
    Deploy,
}

/// One stage of an execution plan. Inputs and outputs name artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    pub kind: StageKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Stack deployed by a deploy stage.
    pub stack: Option<String>,
}

impl PipelineStage {
    /// Stage name for a stack's deploy stage.
    pub fn deploy_name(stack: &str) -> String {
        format!("deploy:{}", stack)
    }

    /// Name of the outputs artifact a deploy stage produces.
    pub fn outputs_name(stack: &str) -> String {
        format!("outputs:{}", stack)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("execution plan has no stages")]
    Empty,

    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    #[error("stage '{stage}' consumes '{input}' before any earlier stage produces it")]
    MissingInput { stage: String, input: String },

    #[error("artifact '{artifact}' is produced by more than one stage")]
    DuplicateOutput { artifact: String },
}

/// Ordered stages of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<PipelineStage>,
}

impl ExecutionPlan {
    /// Source, Build, then one deploy stage per stack in `order`.
    ///
    /// Deploy stages consume the build artifact and the outputs of the
    /// stacks they depend on.
    pub fn for_stacks(order: &[StackDefinition]) -> Self {
        let mut stages = vec![
            PipelineStage {
                name: SOURCE_STAGE.to_string(),
                kind: StageKind::Source,
                inputs: Vec::new(),
                outputs: vec![SOURCE_STAGE.to_string()],
                stack: None,
            },
            PipelineStage {
                name: BUILD_STAGE.to_string(),
                kind: StageKind::Build,
                inputs: vec![SOURCE_STAGE.to_string()],
                outputs: vec![BUILD_STAGE.to_string()],
                stack: None,
            },
        ];

        for stack in order {
            let mut inputs = vec![BUILD_STAGE.to_string()];
            inputs.extend(stack.depends_on.iter().map(|d| PipelineStage::outputs_name(d)));
            stages.push(PipelineStage {
                name: PipelineStage::deploy_name(&stack.name),
                kind: StageKind::Deploy,
                inputs,
                outputs: vec![PipelineStage::outputs_name(&stack.name)],
                stack: Some(stack.name.clone()),
            });
        }

        Self { stages }
    }

    /// Check that every stage's inputs are produced by an earlier stage.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.stages.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut names = HashSet::new();
        let mut produced: HashSet<&str> = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PlanError::DuplicateStage(stage.name.clone()));
            }
            for input in &stage.inputs {
                if !produced.contains(input.as_str()) {
                    return Err(PlanError::MissingInput {
                        stage: stage.name.clone(),
                        input: input.clone(),
                    });
                }
            }
            for output in &stage.outputs {
                if !produced.insert(output.as_str()) {
                    return Err(PlanError::DuplicateOutput {
                        artifact: output.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn deploy_stages(&self) -> impl Iterator<Item = &PipelineStage> {
        self.stages.iter().filter(|s| s.kind == StageKind::Deploy)
    }

    /// Stacks in deploy order.
    pub fn stack_order(&self) -> Vec<&str> {
        self.deploy_stages()
            .filter_map(|s| s.stack.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Push,
    Manual,
}

/// A request to run the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: ResourceId,
    pub kind: TriggerKind,
    /// Commit to build. `None` means the branch head at fetch time.
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub actor: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Trigger {
    pub fn push(revision: impl Into<String>, branch: impl Into<String>, actor: Option<String>) -> Self {
        Self {
            id: ResourceId::new(),
            kind: TriggerKind::Push,
            revision: Some(revision.into()),
            branch: Some(branch.into()),
            actor,
            received_at: Utc::now(),
        }
    }

    pub fn manual(revision: Option<String>, branch: Option<String>) -> Self {
        Self {
            id: ResourceId::new(),
            kind: TriggerKind::Manual,
            revision,
            branch,
            actor: None,
            received_at: Utc::now(),
        }
    }

    /// Whether both triggers name the same resolved revision.
    pub fn same_revision(&self, other: &Trigger) -> bool {
        match (&self.revision, &other.revision) {
            (Some(a), Some(b)) => a == b && self.branch == other.branch,
            _ => false,
        }
    }
}

/// State of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    SourceFetched,
    Built,
    Deploying { index: usize, stack: String },
    Completed,
    Failed { stage: String },
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed { .. } | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::SourceFetched => write!(f, "source_fetched"),
            RunState::Built => write!(f, "built"),
            RunState::Deploying { index, stack } => write!(f, "deploying({}: {})", index, stack),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed { stage } => write!(f, "failed at {}", stage),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status carried by a [`PipelineEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Stage name used for events describing the run as a whole.
pub const RUN_EVENT_STAGE: &str = "run";

/// Structured event for every stage transition and terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub run_id: ResourceId,
    pub stage: String,
    pub status: StageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineEvent {
    pub fn new(run_id: ResourceId, stage: impl Into<String>, status: StageStatus) -> Self {
        Self {
            run_id,
            stage: stage.into(),
            status,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failed(run_id: ResourceId, stage: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(run_id, stage, StageStatus::Failed)
        }
    }

    pub fn is_run_terminal(&self) -> bool {
        self.stage == RUN_EVENT_STAGE && self.status != StageStatus::Started
    }
}
