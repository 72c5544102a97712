//! Executor trait and job types.
//!
//! Executors run build commands in isolated environments (local processes,
//! containers). Each command of a build phase is one job. Timeouts are
//! enforced by the caller, which cancels the job once they elapse.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{ResourceId, Result};

/// Specification for a job to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier for this job.
    pub id: ResourceId,
    /// Container image to run in. Ignored by process executors.
    pub image: Option<String>,
    /// Command to execute.
    pub command: Vec<String>,
    /// Host directory the job works in (the source checkout).
    pub working_dir: Option<PathBuf>,
    /// Environment variables.
    pub env: HashMap<String, String>,
}

impl JobSpec {
    /// A job running `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            image: None,
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.into()],
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    /// The job ID.
    pub id: ResourceId,
    /// Executor-specific identifier (e.g., process id, container ID).
    pub executor_id: String,
    /// Name of the executor running this job.
    pub executor_name: String,
}

/// Status of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is waiting to start.
    Pending,
    /// Job is currently running.
    Running { started_at: DateTime<Utc> },
    /// Job completed successfully.
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// Job failed.
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    /// Job was cancelled.
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Final status.
    pub status: JobStatus,
    /// Exit code if available.
    pub exit_code: Option<i32>,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded { .. }) && self.exit_code.unwrap_or(0) == 0
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Spawn a new job.
    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Get a stream of log lines from a job. The stream ends once the job's
    /// output is closed.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Get the current status of a job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Wait for a job to complete. Resources held for the job are released
    /// once it has finished.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Cancel a running job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;
}
