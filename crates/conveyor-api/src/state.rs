//! Application state.

use conveyor_core::pipeline::PipelineDefinition;
use conveyor_scheduler::{EventBus, PipelineOrchestrator, TriggerQueue};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub queue: Arc<TriggerQueue>,
    /// HMAC key for GitHub webhook signatures. Unsigned webhooks are
    /// accepted when unset.
    pub webhook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, queue: Arc<TriggerQueue>) -> Self {
        Self {
            orchestrator,
            queue,
            webhook_secret: None,
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<Arc<str>>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        self.orchestrator.pipeline()
    }

    pub fn events(&self) -> &EventBus {
        self.orchestrator.events()
    }
}
