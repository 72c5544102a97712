//! System configuration parsing.
//!
//! ```kdl
//! executor "docker" {
//!     network "host"
//! }
//! registry "docker" {
//!     server "123456789012.dkr.ecr.us-east-1.amazonaws.com"
//!     username-secret "REGISTRY_USERNAME"
//!     password-secret "REGISTRY_PASSWORD"
//! }
//! target "command" {
//!     apply "deploy-stack --name {stack} --template {template} --env {environment}"
//!     describe "describe-stack --name {stack} --env {environment}"
//! }
//! secrets {
//!     prefix "CONVEYOR_SECRET_"
//! }
//! server {
//!     bind "0.0.0.0:8080"
//!     webhook-secret "GITHUB_WEBHOOK_SECRET"
//! }
//! work-dir "/var/lib/conveyor"
//! log-format "json"
//! history-limit 50
//! supersede-in-flight #true
//! ```

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::kdl_util::{child_string, first_bool_arg, first_int_arg, first_string_arg};
use crate::{ConfigError, ConfigResult};

/// Environment variable naming the work directory.
pub const WORK_DIR_ENV: &str = "CONVEYOR_WORK_DIR";
/// Environment variable overriding the server bind address.
pub const BIND_ENV: &str = "CONVEYOR_BIND";
/// Environment variable overriding the log format.
pub const LOG_FORMAT_ENV: &str = "CONVEYOR_LOG_FORMAT";

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub executor: ExecutorConfig,
    pub registry: RegistryConfig,
    pub target: TargetConfig,
    pub secrets: SecretStoreConfig,
    pub server: ServerConfig,
    /// Root for run workspaces.
    pub work_dir: PathBuf,
    pub log_format: LogFormat,
    /// Number of finished runs kept in history.
    pub history_limit: usize,
    /// Cancel the active run (at its next stage boundary) when a newer
    /// trigger arrives.
    pub supersede_in_flight: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::Local,
            registry: RegistryConfig::Memory,
            target: TargetConfig::Memory,
            secrets: SecretStoreConfig::default(),
            server: ServerConfig::default(),
            work_dir: std::env::temp_dir().join("conveyor"),
            log_format: LogFormat::Pretty,
            history_limit: 50,
            supersede_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutorConfig {
    /// Commands run as host processes.
    Local,
    /// Commands run in containers of the builder image.
    Docker { network: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryConfig {
    /// Records pushes without contacting a registry.
    Memory,
    /// Tags and pushes through the Docker daemon.
    Docker {
        server: Option<String>,
        username_secret: Option<String>,
        password_secret: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetConfig {
    /// Records applied templates in memory.
    Memory,
    /// Runs shell commands with `{stack}`, `{template}`, `{parameters}` and `{environment}`
    /// placeholders.
    Command {
        apply: String,
        describe: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretStoreConfig {
    /// Secrets are read from environment variables with this prefix.
    pub prefix: String,
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            prefix: "CONVEYOR_SECRET_".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    /// Name of the secret holding the webhook HMAC key.
    pub webhook_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue {
                field: "log-format".to_string(),
                message: format!("unknown log format: {}", other),
            }),
        }
    }
}

/// Read a system file, then apply `CONVEYOR_*` environment overrides.
/// A missing path yields the defaults.
pub fn load_system_config(path: Option<&Path>) -> ConfigResult<SystemConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            parse_system_config(&text)?
        }
        None => SystemConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}

impl SystemConfig {
    /// Apply overrides looked up by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(WORK_DIR_ENV) {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(bind) = lookup(BIND_ENV) {
            self.server.bind = bind;
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            self.log_format = format.parse()?;
        }
        Ok(())
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "executor" => config.executor = parse_executor(node)?,
            "registry" => config.registry = parse_registry(node)?,
            "target" => config.target = parse_target(node)?,
            "secrets" => {
                if let Some(prefix) = child_string(node, "prefix") {
                    config.secrets.prefix = prefix;
                }
            }
            "server" => {
                if let Some(bind) = child_string(node, "bind") {
                    config.server.bind = bind;
                }
                config.server.webhook_secret = child_string(node, "webhook-secret");
            }
            "work-dir" => {
                config.work_dir = first_string_arg(node)
                    .map(PathBuf::from)
                    .ok_or_else(|| ConfigError::MissingField("work-dir path".to_string()))?;
            }
            "log-format" => {
                config.log_format = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("log-format value".to_string()))?
                    .parse()?;
            }
            "history-limit" => {
                let limit = first_int_arg(node).ok_or_else(|| {
                    ConfigError::MissingField("history-limit value".to_string())
                })?;
                config.history_limit =
                    usize::try_from(limit).map_err(|_| ConfigError::InvalidValue {
                        field: "history-limit".to_string(),
                        message: format!("{} is out of range", limit),
                    })?;
            }
            "supersede-in-flight" => {
                config.supersede_in_flight = first_bool_arg(node).unwrap_or(true);
            }
            _ => {}
        }
    }

    Ok(config)
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorConfig> {
    match first_string_arg(node).as_deref() {
        Some("local") | None => Ok(ExecutorConfig::Local),
        Some("docker") => Ok(ExecutorConfig::Docker {
            network: child_string(node, "network"),
        }),
        Some(other) => Err(ConfigError::InvalidValue {
            field: "executor".to_string(),
            message: format!("unknown executor: {}", other),
        }),
    }
}

fn parse_registry(node: &KdlNode) -> ConfigResult<RegistryConfig> {
    match first_string_arg(node).as_deref() {
        Some("memory") | None => Ok(RegistryConfig::Memory),
        Some("docker") => Ok(RegistryConfig::Docker {
            server: child_string(node, "server"),
            username_secret: child_string(node, "username-secret"),
            password_secret: child_string(node, "password-secret"),
        }),
        Some(other) => Err(ConfigError::InvalidValue {
            field: "registry".to_string(),
            message: format!("unknown registry: {}", other),
        }),
    }
}

fn parse_target(node: &KdlNode) -> ConfigResult<TargetConfig> {
    match first_string_arg(node).as_deref() {
        Some("memory") | None => Ok(TargetConfig::Memory),
        Some("command") => Ok(TargetConfig::Command {
            apply: child_string(node, "apply")
                .ok_or_else(|| ConfigError::MissingField("target apply command".to_string()))?,
            describe: child_string(node, "describe"),
        }),
        Some(other) => Err(ConfigError::InvalidValue {
            field: "target".to_string(),
            message: format!("unknown deploy target: {}", other),
        }),
    }
}
