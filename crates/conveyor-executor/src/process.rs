//! Local process executor.
//!
//! Runs each job as a child process of the current host. Used for local runs
//! and for hosts where the builder image is the host itself.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::executor::*;
use conveyor_core::{Error, ResourceId, Result};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

struct ProcessJob {
    status: watch::Receiver<JobStatus>,
    cancel: Arc<Notify>,
    logs: Mutex<Option<mpsc::UnboundedReceiver<LogLine>>>,
}

/// Executor running jobs as host processes.
#[derive(Default)]
pub struct LocalProcessExecutor {
    jobs: Mutex<HashMap<ResourceId, Arc<ProcessJob>>>,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn job(&self, handle: &JobHandle) -> Result<Arc<ProcessJob>> {
        self.jobs
            .lock()
            .map_err(|_| Error::Internal("job table poisoned".to_string()))?
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))
    }

    fn forget(&self, id: &ResourceId) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(id);
        }
    }
}

fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<LogLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(LogLine::new(stream, line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Log read error");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("job has no command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start {}: {}", program, e)))?;
        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        info!(job_id = %spec.id, pid = %pid, "Started process");

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, LogStream::Stdout, log_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, LogStream::Stderr, log_tx);
        }

        let started_at = Utc::now();
        let (status_tx, status_rx) = watch::channel(JobStatus::Running { started_at });
        let cancel = Arc::new(Notify::new());
        let cancelled = cancel.clone();
        let job_id = spec.id;

        tokio::spawn(async move {
            let final_status = tokio::select! {
                exit = child.wait() => match exit {
                    Ok(status) if status.success() => JobStatus::Succeeded {
                        started_at,
                        finished_at: Utc::now(),
                    },
                    Ok(status) => JobStatus::Failed {
                        started_at: Some(started_at),
                        finished_at: Utc::now(),
                        exit_code: status.code(),
                        message: format!("process {}", status),
                    },
                    Err(e) => JobStatus::Failed {
                        started_at: Some(started_at),
                        finished_at: Utc::now(),
                        exit_code: None,
                        message: e.to_string(),
                    },
                },
                _ = cancelled.notified() => {
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job_id, error = %e, "Failed to kill process");
                    }
                    JobStatus::Cancelled {
                        started_at: Some(started_at),
                        cancelled_at: Utc::now(),
                    }
                }
            };
            debug!(job_id = %job_id, status = ?final_status, "Process finished");
            let _ = status_tx.send(final_status);
        });

        let job = Arc::new(ProcessJob {
            status: status_rx,
            cancel,
            logs: Mutex::new(Some(log_rx)),
        });
        self.jobs
            .lock()
            .map_err(|_| Error::Internal("job table poisoned".to_string()))?
            .insert(spec.id, job);

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let job = self.job(handle)?;
        let rx = job
            .logs
            .lock()
            .map_err(|_| Error::Internal("log table poisoned".to_string()))?
            .take()
            .ok_or_else(|| Error::Conflict(format!("logs of job {} already taken", handle.id)))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let job = self.job(handle)?;
        let status = job.status.borrow().clone();
        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let job = self.job(handle)?;
        let mut rx = job.status.clone();
        let status = rx
            .wait_for(JobStatus::is_terminal)
            .await
            .map_err(|_| Error::Internal(format!("job {} lost its status", handle.id)))?
            .clone();

        let exit_code = match &status {
            JobStatus::Succeeded { .. } => Some(0),
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        };

        let logs_taken = job.logs.lock().map(|l| l.is_none()).unwrap_or(true);
        if logs_taken {
            self.forget(&handle.id);
        }

        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let job = self.job(handle)?;
        if !job.status.borrow().is_terminal() {
            info!(job_id = %handle.id, "Cancelling process");
            job.cancel.notify_one();
        }
        Ok(())
    }
}
