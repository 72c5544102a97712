//! Execution backends for Conveyor.
//!
//! Provides implementations of the collaborator traits from
//! `conveyor-core`:
//! - Executors: local processes and Docker containers
//! - Container registries: Docker daemon push and an in-memory recorder
//! - Source providers: git clone and an existing local checkout
//! - Secret stores: process environment and in-memory
//! - Template provider: template files from the source checkout

pub mod docker;
pub mod process;
pub mod registry;
pub mod secrets;
pub mod source;
pub mod template;

pub use conveyor_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};
pub use docker::DockerExecutor;
pub use process::LocalProcessExecutor;
pub use registry::{DockerRegistry, InMemoryRegistry};
pub use secrets::{EnvSecretStore, InMemorySecretStore};
pub use source::{GitSourceProvider, LocalSourceProvider};
pub use template::FileTemplateProvider;
