//! Docker executor implementation.
//!
//! Each job runs in a fresh container of the builder image with the source
//! checkout bind-mounted at [`WORKSPACE_MOUNT`].

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use conveyor_core::executor::*;
use conveyor_core::{Error, ResourceId, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

/// Path the job's working directory is mounted at inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Executor running jobs as Docker containers.
pub struct DockerExecutor {
    docker: Docker,
    network: Option<String>,
}

impl DockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new(network: Option<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker, network })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            network: None,
        }
    }

    fn container_name(job_id: &ResourceId) -> String {
        format!("conveyor-job-{}", job_id)
    }

    fn container_config(&self, spec: &JobSpec, image: &str) -> Config<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds = spec
            .working_dir
            .as_ref()
            .map(|dir| vec![format!("{}:{}:rw", dir.display(), WORKSPACE_MOUNT)]);

        let host_config = HostConfig {
            binds,
            network_mode: self.network.clone(),
            ..Default::default()
        };

        Config {
            image: Some(image.to_string()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            working_dir: spec
                .working_dir
                .as_ref()
                .map(|_| WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn pull(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&Self::container_name(&handle.id), Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))
    }
}

fn parse_docker_time(value: Option<String>) -> Option<chrono::DateTime<Utc>> {
    value
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let image = spec
            .image
            .clone()
            .ok_or_else(|| Error::InvalidInput("docker jobs need a builder image".to_string()))?;
        if spec.command.is_empty() {
            return Err(Error::InvalidInput("job has no command".to_string()));
        }

        self.pull(&image).await;

        let container_name = Self::container_name(&spec.id);
        let config = self.container_config(&spec, &image);
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(&container_name, Some(options));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    let content = String::from_utf8_lossy(&message).trim_end().to_string();
                    Some(LogLine::new(stream, content))
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("No state".to_string()))?;

        let started_at = parse_docker_time(state.started_at);
        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: started_at.unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false) {
            JobStatus::Pending
        } else {
            let exit_code = state.exit_code.map(|c| c as i32);
            let finished_at = parse_docker_time(state.finished_at).unwrap_or_else(Utc::now);

            if exit_code == Some(0) {
                JobStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: state.error.unwrap_or_default(),
                }
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.id);

        if !self.status(handle).await?.is_terminal() {
            let options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut stream = self.docker.wait_container(&container_name, Some(options));
            if let Some(Err(e)) = stream.next().await {
                // Non-zero exits surface as errors here; the status below
                // carries the exit code.
                debug!(error = %e, "Wait returned error");
            }
        }

        let status = self.status(handle).await?;
        let exit_code = match &status {
            JobStatus::Succeeded { .. } => Some(0),
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        };

        if let Err(e) = self.remove(handle).await {
            warn!(container = %container_name, error = %e, "Cleanup failed");
        }

        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);
        info!(container = %container_name, "Cancelling container");

        self.docker
            .stop_container(&container_name, None)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to stop container: {}", e)))?;

        self.remove(handle).await
    }
}


/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;

    fn alpine(script: &str) -> JobSpec {
        let mut spec = JobSpec::shell(script);
        spec.image = Some("alpine:latest".to_string());
        spec
    }

    #[test]
    #[ignore]
    fn test_container_config_mounts_workspace() {
        let executor = DockerExecutor::new(Some("host".to_string())).unwrap();
        let mut spec = alpine("ls");
        spec.working_dir = Some("/tmp/checkout".into());
        spec.env.insert("FOO".to_string(), "bar".to_string());

        let config = executor.container_config(&spec, "alpine:latest");
        assert_eq!(config.working_dir.as_deref(), Some(WORKSPACE_MOUNT));
        assert_eq!(config.env, Some(vec!["FOO=bar".to_string()]));
        let host = config.host_config.unwrap();
        assert_eq!(host.binds, Some(vec!["/tmp/checkout:/workspace:rw".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("host"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_job_lifecycle() {
        let executor = DockerExecutor::new(None).unwrap();
        let handle = executor.spawn(alpine("echo 'Hello from Docker!'")).await.unwrap();
        assert_eq!(handle.executor_name, "docker");

        let logs: Vec<LogLine> = executor.logs(&handle).await.unwrap().collect().await;
        let result = executor.wait(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert!(logs.iter().any(|l| l.content.contains("Hello from Docker!")));
        // wait() removed the container
        assert!(executor.status(&handle).await.is_err());
    }

    #[tokio::test]
    #[ignore]
    async fn test_failing_job() {
        let executor = DockerExecutor::new(None).unwrap();
        let handle = executor.spawn(alpine("exit 42")).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(42));
        assert!(matches!(
            result.status,
            JobStatus::Failed {
                exit_code: Some(42),
                ..
            }
        ));
    }

    #[tokio::test]
    #[ignore]
    async fn test_job_cancellation() {
        let executor = DockerExecutor::new(None).unwrap();
        let handle = executor.spawn(alpine("sleep 300")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        assert!(matches!(
            executor.status(&handle).await.unwrap(),
            JobStatus::Running { .. }
        ));
        executor.cancel(&handle).await.unwrap();
        assert!(executor.status(&handle).await.is_err());
    }

    #[tokio::test]
    #[ignore]
    async fn test_docker_requires_image() {
        let executor = DockerExecutor::new(None).unwrap();
        let result = executor.spawn(JobSpec::shell("true")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
