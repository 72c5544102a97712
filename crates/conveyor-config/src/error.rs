//! Configuration parsing errors.

use conveyor_core::graph::GraphError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("cycle detected in dependencies: {0}")]
    CycleDetected(String),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<GraphError> for ConfigError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Cycle { .. } => ConfigError::CycleDetected(err.to_string()),
            GraphError::UnresolvedDependency { .. } => {
                ConfigError::InvalidReference(err.to_string())
            }
            GraphError::DuplicateStack(name) => ConfigError::Duplicate(format!("stack '{}'", name)),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
