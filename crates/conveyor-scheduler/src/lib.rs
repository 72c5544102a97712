//! Pipeline scheduling for Conveyor.
//!
//! Runs one pipeline execution at a time: Source, Build, then one deploy
//! stage per stack in dependency order. Triggers arriving while a run is
//! active wait in a single pending slot where the newest one wins.

pub mod artifacts;
pub mod bootstrap;
pub mod build;
pub mod events;
pub mod orchestrator;
pub mod queue;
pub mod worker;

pub use artifacts::InMemoryArtifactStore;
pub use bootstrap::{RunOverrides, build_orchestrator};
pub use build::{BuildArtifact, BuildError, BuildManifest, BuildRequest, BuildRunner};
pub use events::EventBus;
pub use orchestrator::{CancelSignal, PipelineOrchestrator, RunError, RunReport};
pub use queue::{ActiveRun, ClaimedRun, SubmitOutcome, TriggerQueue};
pub use worker::Worker;
