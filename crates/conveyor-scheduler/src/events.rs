//! Run event broadcasting and live run state.

use conveyor_core::ResourceId;
use conveyor_core::pipeline::{PipelineEvent, RunState, StageStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info};

const DEFAULT_CAPACITY: usize = 256;

struct Shared {
    sender: broadcast::Sender<PipelineEvent>,
    states: Mutex<HashMap<ResourceId, RunState>>,
}

/// Fan-out of [`PipelineEvent`]s plus the current state of each live run.
///
/// Every event is also written to the tracing log, so runs stay observable
/// without subscribers.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            shared: Arc::new(Shared {
                sender,
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.sender.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        match event.status {
            StageStatus::Failed => error!(
                run_id = %event.run_id,
                stage = %event.stage,
                error = event.error.as_deref().unwrap_or_default(),
                "Stage failed"
            ),
            status => info!(run_id = %event.run_id, stage = %event.stage, status = ?status, "Stage event"),
        }
        // No subscribers is fine.
        let _ = self.shared.sender.send(event);
    }

    pub fn set_state(&self, run_id: ResourceId, state: RunState) {
        info!(run_id = %run_id, state = %state, "Run state changed");
        if let Ok(mut states) = self.shared.states.lock() {
            states.insert(run_id, state);
        }
    }

    pub fn state(&self, run_id: &ResourceId) -> Option<RunState> {
        self.shared.states.lock().ok()?.get(run_id).cloned()
    }

    /// Forget a finished run's live state.
    pub fn clear(&self, run_id: &ResourceId) {
        if let Ok(mut states) = self.shared.states.lock() {
            states.remove(run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run_id = ResourceId::new();

        bus.emit(PipelineEvent::new(run_id, "source", StageStatus::Started));
        bus.emit(PipelineEvent::failed(run_id, "source", "repository not found"));

        assert_eq!(rx.recv().await.unwrap().status, StageStatus::Started);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("repository not found"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(PipelineEvent::new(ResourceId::new(), "run", StageStatus::Started));
    }

    #[test]
    fn test_run_state_tracking() {
        let bus = EventBus::default();
        let run_id = ResourceId::new();
        assert_eq!(bus.state(&run_id), None);

        bus.set_state(run_id, RunState::SourceFetched);
        bus.set_state(run_id, RunState::Built);
        assert_eq!(bus.state(&run_id), Some(RunState::Built));

        bus.clear(&run_id);
        assert_eq!(bus.state(&run_id), None);
    }
}
