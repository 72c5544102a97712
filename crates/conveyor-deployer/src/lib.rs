//! Deployment executor for Conveyor.
//!
//! [`StackDeployer`] applies one stack's rendered template to the target
//! environment, binding deferred `${stacks.<stack>.<output>}` references
//! at apply time. Deploy target backends:
//! - Command-driven (external tooling via shell commands)
//! - In-memory (dry runs and tests)

pub mod command;
pub mod deployer;
pub mod memory;

pub use command::CommandDeployTarget;
pub use conveyor_core::deployer::{DeployTarget, DeploymentAction};
pub use deployer::{DeployCause, DeployError, StackDeployer};
pub use memory::InMemoryDeployTarget;
