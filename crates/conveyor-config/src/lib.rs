//! KDL configuration parsing for Conveyor.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (conveyor.kdl)
//! - System configuration (executor, registry, deploy target, server)
//! - Variable interpolation

pub mod duration;
pub mod error;
mod kdl_util;
pub mod pipeline;
pub mod system;
pub mod variables;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use system::{SystemConfig, load_system_config, parse_system_config};
pub use variables::{VariableContext, VariableContextBuilder};

/// Default pipeline file name.
pub const DEFAULT_PIPELINE_FILE: &str = "conveyor.kdl";
