//! Worker that runs claimed triggers through the orchestrator.

use crate::orchestrator::{PipelineOrchestrator, RunReport};
use crate::queue::{ClaimedRun, TriggerQueue};
use std::sync::Arc;
use tracing::{info, warn};

/// Claims pending triggers and executes them one at a time.
pub struct Worker {
    id: String,
    queue: Arc<TriggerQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<TriggerQueue>,
        orchestrator: Arc<PipelineOrchestrator>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            orchestrator,
        }
    }

    /// Execute the pending trigger, if one can be claimed now.
    pub async fn run_next(&self) -> Option<RunReport> {
        let claimed = self.queue.claim()?;
        Some(self.execute(claimed).await)
    }

    /// Run the worker loop.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "Starting worker");

        loop {
            let claimed = self.queue.next().await;
            let report = self.execute(claimed).await;
            if !report.succeeded() {
                warn!(worker_id = %self.id, run_id = %report.run_id, state = %report.state, "Run did not complete");
            }
        }
    }

    async fn execute(&self, claimed: ClaimedRun) -> RunReport {
        info!(worker_id = %self.id, run_id = %claimed.run_id, "Claimed run");
        let report = self
            .orchestrator
            .execute(claimed.run_id, claimed.trigger, claimed.cancel)
            .await;
        self.queue.finish(report.clone());
        report
    }
}
