//! Wiring of collaborators from system configuration.

use conveyor_config::SystemConfig;
use conveyor_config::system::{ExecutorConfig, RegistryConfig, TargetConfig};
use conveyor_core::Result;
use conveyor_core::deployer::DeployTarget;
use conveyor_core::executor::Executor;
use conveyor_core::pipeline::PipelineDefinition;
use conveyor_core::registry::ContainerRegistry;
use conveyor_core::secret::SecretStore;
use conveyor_core::source::SourceProvider;
use conveyor_deployer::{CommandDeployTarget, InMemoryDeployTarget, StackDeployer};
use conveyor_executor::{
    DockerExecutor, DockerRegistry, EnvSecretStore, FileTemplateProvider, GitSourceProvider,
    InMemoryRegistry, LocalProcessExecutor, LocalSourceProvider,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::artifacts::InMemoryArtifactStore;
use crate::build::BuildRunner;
use crate::events::EventBus;
use crate::orchestrator::PipelineOrchestrator;

/// Per-invocation overrides of the system configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Build from this directory instead of fetching the repository.
    pub source_dir: Option<PathBuf>,
    pub target: Option<TargetConfig>,
    /// Caller environment handed to every build.
    pub env: HashMap<String, String>,
}

fn executor(config: &ExecutorConfig) -> Result<Arc<dyn Executor>> {
    let executor: Arc<dyn Executor> = match config {
        ExecutorConfig::Local => Arc::new(LocalProcessExecutor::new()),
        ExecutorConfig::Docker { network } => Arc::new(DockerExecutor::new(network.clone())?),
    };
    Ok(executor)
}

fn registry(
    config: &RegistryConfig,
    secrets: Arc<dyn SecretStore>,
) -> Result<Arc<dyn ContainerRegistry>> {
    let registry: Arc<dyn ContainerRegistry> = match config {
        RegistryConfig::Memory => Arc::new(InMemoryRegistry::new()),
        RegistryConfig::Docker {
            server,
            username_secret,
            password_secret,
        } => Arc::new(DockerRegistry::new(
            secrets,
            server.clone(),
            username_secret.clone(),
            password_secret.clone(),
        )?),
    };
    Ok(registry)
}

fn target(config: &TargetConfig, work_dir: &Path) -> Arc<dyn DeployTarget> {
    match config {
        TargetConfig::Memory => Arc::new(InMemoryDeployTarget::new()),
        TargetConfig::Command { apply, describe } => Arc::new(CommandDeployTarget::new(
            apply.clone(),
            describe.clone(),
            work_dir,
        )),
    }
}

fn source(
    pipeline: &PipelineDefinition,
    overrides: &RunOverrides,
    work_dir: &Path,
    secrets: Arc<dyn SecretStore>,
) -> Result<Arc<dyn SourceProvider>> {
    let source: Arc<dyn SourceProvider> = match (&overrides.source_dir, &pipeline.source.repository) {
        (Some(dir), _) => Arc::new(LocalSourceProvider::new(dir.clone())),
        (None, Some(repository)) if Path::new(repository).is_dir() => {
            Arc::new(LocalSourceProvider::new(repository.clone()))
        }
        (None, Some(repository)) => Arc::new(GitSourceProvider::new(
            repository.clone(),
            work_dir,
            secrets,
            pipeline.source.token_secret.clone(),
        )),
        (None, None) => Arc::new(LocalSourceProvider::new(std::env::current_dir()?)),
    };
    Ok(source)
}

/// Build an orchestrator for `pipeline` from the configured backends.
pub fn build_orchestrator(
    pipeline: PipelineDefinition,
    config: &SystemConfig,
    overrides: RunOverrides,
    events: EventBus,
) -> Result<PipelineOrchestrator> {
    let secrets: Arc<dyn SecretStore> =
        Arc::new(EnvSecretStore::from_env(config.secrets.prefix.clone()));
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let target_config = overrides.target.as_ref().unwrap_or(&config.target);

    let executor = executor(&config.executor)?;
    let registry = registry(&config.registry, secrets.clone())?;
    let target = target(target_config, &config.work_dir);
    let source = source(&pipeline, &overrides, &config.work_dir, secrets.clone())?;
    info!(
        pipeline = %pipeline.name,
        executor = %executor.name(),
        registry = %registry.name(),
        target = %target.name(),
        source = %source.name(),
        "Wiring orchestrator"
    );

    let builder = BuildRunner::new(
        executor,
        registry,
        Arc::new(FileTemplateProvider::new()),
        secrets,
        artifacts.clone(),
    );
    let deployer =
        StackDeployer::new(target, artifacts.clone()).with_timeout(pipeline.deploy.timeout);

    Ok(
        PipelineOrchestrator::new(pipeline, source, builder, deployer, artifacts, events)
            .with_env(overrides.env),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::CancelSignal;
    use conveyor_config::parse_pipeline;
    use conveyor_core::ResourceId;
    use conveyor_core::pipeline::{RunState, Trigger};

    const PIPELINE: &str = r#"
pipeline "shop"
build {
    image-repository "registry.local/shop"
    build {
        run "echo $IMAGE_TAG > image-tag.txt"
    }
}
stack "auth" {
    output "UserPoolId"
}
stack "api" needs="auth" {
    parameter "UserPool" "${stacks.auth.UserPoolId}"
}
deploy {
    environment "staging"
}
"#;

    #[tokio::test]
    async fn test_local_run_with_defaults() {
        let dir = std::env::temp_dir().join(format!("conveyor-bootstrap-{}", ResourceId::new()));
        std::fs::create_dir_all(&dir).unwrap();

        let config = SystemConfig {
            work_dir: dir.join("work"),
            ..Default::default()
        };
        let overrides = RunOverrides {
            source_dir: Some(dir.clone()),
            ..Default::default()
        };
        let pipeline = parse_pipeline(PIPELINE).unwrap();
        let orchestrator =
            build_orchestrator(pipeline, &config, overrides, EventBus::default()).unwrap();

        let report = orchestrator
            .execute(
                ResourceId::new(),
                Trigger::manual(Some("9f8e7d6c5b4a".to_string()), Some("main".to_string())),
                CancelSignal::new(),
            )
            .await;

        assert_eq!(report.state, RunState::Completed, "error: {:?}", report.error);
        assert_eq!(report.deployed, vec!["auth", "api"]);
        assert_eq!(
            std::fs::read_to_string(dir.join("image-tag.txt")).unwrap().trim(),
            "9f8e7d6"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_command_target_override() {
        let dir = std::env::temp_dir().join(format!("conveyor-bootstrap-{}", ResourceId::new()));
        std::fs::create_dir_all(&dir).unwrap();

        let config = SystemConfig {
            work_dir: dir.join("work"),
            ..Default::default()
        };
        let overrides = RunOverrides {
            source_dir: Some(dir.clone()),
            target: Some(TargetConfig::Command {
                apply: r#"printf '{"UserPoolId": "pool-%s"}' {environment}"#.to_string(),
                describe: None,
            }),
            ..Default::default()
        };
        let pipeline = parse_pipeline(PIPELINE).unwrap();
        let orchestrator =
            build_orchestrator(pipeline, &config, overrides, EventBus::default()).unwrap();

        let report = orchestrator
            .execute(ResourceId::new(), Trigger::manual(None, None), CancelSignal::new())
            .await;

        assert_eq!(report.state, RunState::Completed, "error: {:?}", report.error);
        assert_eq!(report.outputs["auth"]["UserPoolId"], "pool-staging");
        let parameters =
            std::fs::read_to_string(dir.join("work/deploy/staging/api.parameters.json")).unwrap();
        assert!(parameters.contains("pool-staging"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
