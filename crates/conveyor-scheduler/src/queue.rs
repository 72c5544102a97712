//! Trigger queue.
//!
//! At most one run is active. Triggers arriving meanwhile wait in a single
//! pending slot where the newest trigger replaces an older one. A trigger for
//! the revision already pending is coalesced into that run, as is one for the
//! active revision while the active run is still the newest and not cancelling.

use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::pipeline::Trigger;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::info;

use crate::orchestrator::{CancelSignal, RunReport};

/// Result of submitting a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// The trigger holds the pending slot.
    Queued {
        run_id: ResourceId,
        /// Pending run dropped in favor of this one.
        superseded: Option<ResourceId>,
        /// Active run asked to stop at its next stage boundary.
        cancelled: Option<ResourceId>,
    },
    /// An active or pending run already covers this revision.
    Coalesced { run_id: ResourceId },
}

impl SubmitOutcome {
    pub fn run_id(&self) -> ResourceId {
        match self {
            SubmitOutcome::Queued { run_id, .. } | SubmitOutcome::Coalesced { run_id } => *run_id,
        }
    }
}

/// The run currently executing.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub run_id: ResourceId,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancelSignal,
}

impl ActiveRun {
    pub fn is_cancelling(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A trigger waiting for the active run to finish.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRun {
    pub run_id: ResourceId,
    pub trigger: Trigger,
    pub queued_at: DateTime<Utc>,
}

/// A run handed to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run_id: ResourceId,
    pub trigger: Trigger,
    pub cancel: CancelSignal,
}

#[derive(Default)]
struct QueueState {
    active: Option<ActiveRun>,
    pending: Option<PendingRun>,
    /// Finished runs, newest first.
    history: VecDeque<RunReport>,
}

pub struct TriggerQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    history_limit: usize,
    supersede_in_flight: bool,
}

impl TriggerQueue {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            history_limit,
            supersede_in_flight: false,
        }
    }

    /// Cancel the active run whenever a newer trigger is queued.
    pub fn with_supersede_in_flight(mut self, enabled: bool) -> Self {
        self.supersede_in_flight = enabled;
        self
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit(&self, trigger: Trigger) -> SubmitOutcome {
        let mut state = self.state();

        // The active run absorbs a repeat of its revision only while nothing
        // newer is pending and it is not being cancelled.
        let active_is_latest = state.pending.is_none();
        if let Some(active) = state
            .active
            .as_ref()
            .filter(|a| active_is_latest && !a.is_cancelling() && a.trigger.same_revision(&trigger))
        {
            info!(run_id = %active.run_id, revision = ?trigger.revision, "Trigger coalesced into active run");
            return SubmitOutcome::Coalesced {
                run_id: active.run_id,
            };
        }
        if let Some(pending) = state.pending.as_ref().filter(|p| p.trigger.same_revision(&trigger)) {
            info!(run_id = %pending.run_id, revision = ?trigger.revision, "Trigger coalesced into pending run");
            return SubmitOutcome::Coalesced {
                run_id: pending.run_id,
            };
        }

        let run_id = ResourceId::new();
        let superseded = state.pending.take().map(|p| {
            info!(run_id = %p.run_id, superseded_by = %run_id, "Dropping superseded pending trigger");
            p.run_id
        });
        let cancelled = match &state.active {
            Some(active) if self.supersede_in_flight => {
                info!(run_id = %active.run_id, superseded_by = %run_id, "Cancelling in-flight run");
                active.cancel.cancel();
                Some(active.run_id)
            }
            _ => None,
        };

        info!(run_id = %run_id, kind = ?trigger.kind, revision = ?trigger.revision, "Trigger queued");
        state.pending = Some(PendingRun {
            run_id,
            trigger,
            queued_at: Utc::now(),
        });
        drop(state);

        self.notify.notify_one();
        SubmitOutcome::Queued {
            run_id,
            superseded,
            cancelled,
        }
    }

    /// Take the pending trigger if no run is active.
    pub fn claim(&self) -> Option<ClaimedRun> {
        let mut state = self.state();
        if state.active.is_some() {
            return None;
        }
        let pending = state.pending.take()?;
        let cancel = CancelSignal::new();
        state.active = Some(ActiveRun {
            run_id: pending.run_id,
            trigger: pending.trigger.clone(),
            started_at: Utc::now(),
            cancel: cancel.clone(),
        });
        Some(ClaimedRun {
            run_id: pending.run_id,
            trigger: pending.trigger,
            cancel,
        })
    }

    /// Wait until a trigger can be claimed.
    pub async fn next(&self) -> ClaimedRun {
        loop {
            if let Some(claimed) = self.claim() {
                return claimed;
            }
            self.notify.notified().await;
        }
    }

    /// Record a finished run and free the active slot.
    pub fn finish(&self, report: RunReport) {
        let mut state = self.state();
        if state.active.as_ref().is_some_and(|a| a.run_id == report.run_id) {
            state.active = None;
        }
        state.history.push_front(report);
        state.history.truncate(self.history_limit);
        let wake = state.pending.is_some();
        drop(state);

        if wake {
            self.notify.notify_one();
        }
    }

    /// Ask the active run to stop at its next stage boundary.
    pub fn cancel_active(&self) -> Option<ResourceId> {
        let state = self.state();
        let active = state.active.as_ref()?;
        info!(run_id = %active.run_id, "Cancelling active run");
        active.cancel.cancel();
        Some(active.run_id)
    }

    pub fn current(&self) -> Option<ActiveRun> {
        self.state().active.clone()
    }

    pub fn pending(&self) -> Option<PendingRun> {
        self.state().pending.clone()
    }

    /// Finished runs, newest first.
    pub fn history(&self) -> Vec<RunReport> {
        self.state().history.iter().cloned().collect()
    }

    pub fn get(&self, run_id: &ResourceId) -> Option<RunReport> {
        self.state()
            .history
            .iter()
            .find(|r| r.run_id == *run_id)
            .cloned()
    }
}
