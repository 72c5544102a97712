//! Deploy target that shells out to external tooling.
//!
//! The apply command receives the bound template through files written
//! under the work directory. Placeholders expanded in the commands, each
//! substituted as a single-quoted shell word:
//! - `{stack}` - stack name
//! - `{environment}` - target environment
//! - `{template}` - path of the file holding the template body
//! - `{parameters}` - path of a JSON object with the template parameters
//!
//! The same values are exported as `CONVEYOR_STACK`, `CONVEYOR_ENVIRONMENT`,
//! `CONVEYOR_TEMPLATE` and `CONVEYOR_PARAMETERS`. Outputs are read from the
//! command's stdout as a JSON object; empty output or `null` means none.

use async_trait::async_trait;
use conveyor_core::deployer::DeployTarget;
use conveyor_core::stack::{DeploymentOutputs, RenderedTemplate};
use conveyor_core::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

pub struct CommandDeployTarget {
    apply: String,
    describe: Option<String>,
    work_dir: PathBuf,
}

struct Invocation<'a> {
    stack: &'a str,
    environment: &'a str,
    template: PathBuf,
    parameters: PathBuf,
}

impl Invocation<'_> {
    fn expand(&self, command: &str) -> String {
        command
            .replace("{stack}", &shell_quote(self.stack))
            .replace("{environment}", &shell_quote(self.environment))
            .replace("{template}", &shell_quote(&self.template.to_string_lossy()))
            .replace("{parameters}", &shell_quote(&self.parameters.to_string_lossy()))
    }
}

/// Quote `value` as one POSIX shell word.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

impl CommandDeployTarget {
    pub fn new(
        apply: impl Into<String>,
        describe: Option<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            apply: apply.into(),
            describe,
            work_dir: work_dir.into(),
        }
    }

    fn invocation<'a>(&self, environment: &'a str, stack: &'a str) -> Invocation<'a> {
        let dir = self.work_dir.join("deploy").join(environment);
        Invocation {
            stack,
            environment,
            template: dir.join(format!("{}.template", stack)),
            parameters: dir.join(format!("{}.parameters.json", stack)),
        }
    }

    async fn run(&self, command: &str, invocation: &Invocation<'_>) -> Result<String> {
        let script = invocation.expand(command);
        debug!(stack = %invocation.stack, command = %script, "Running deploy command");

        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&script)
            .env("CONVEYOR_STACK", invocation.stack)
            .env("CONVEYOR_ENVIRONMENT", invocation.environment)
            .env("CONVEYOR_TEMPLATE", &invocation.template)
            .env("CONVEYOR_PARAMETERS", &invocation.parameters)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("failed to start `{}`: {}", script, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::DeploymentFailed(format!(
                "`{}` exited with {}: {}",
                script,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

/// Parse a JSON object of outputs. Non-string values keep their JSON text.
fn parse_outputs(stdout: &str) -> Result<Option<DeploymentOutputs>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match serde_json::from_str::<Value>(trimmed)? {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(
            map.into_iter()
                .map(|(key, value)| match value {
                    Value::String(s) => (key, s),
                    other => (key, other.to_string()),
                })
                .collect(),
        )),
        other => Err(Error::DeploymentFailed(format!(
            "deploy command printed {} instead of an outputs object",
            other
        ))),
    }
}

#[async_trait]
impl DeployTarget for CommandDeployTarget {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn create_or_update(
        &self,
        environment: &str,
        template: &RenderedTemplate,
    ) -> Result<DeploymentOutputs> {
        let invocation = self.invocation(environment, &template.stack_name);
        write_file(&invocation.template, template.body.as_bytes()).await?;
        write_file(
            &invocation.parameters,
            &serde_json::to_vec_pretty(&template.parameters)?,
        )
        .await?;

        info!(stack = %template.stack_name, environment = %environment, "Running apply command");
        let stdout = self.run(&self.apply, &invocation).await?;
        Ok(parse_outputs(&stdout)?.unwrap_or_default())
    }

    async fn describe(
        &self,
        environment: &str,
        stack_name: &str,
    ) -> Result<Option<DeploymentOutputs>> {
        let Some(describe) = &self.describe else {
            return Ok(None);
        };
        let invocation = self.invocation(environment, stack_name);
        let stdout = self.run(describe, &invocation).await?;
        parse_outputs(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn work_dir() -> PathBuf {
        std::env::temp_dir().join(format!("conveyor-deploy-{}", conveyor_core::ResourceId::new()))
    }

    fn template() -> RenderedTemplate {
        let mut params = BTreeMap::new();
        params.insert("UserPoolId".to_string(), "us-east-1_abc".to_string());
        RenderedTemplate::new("api", r#"{"kind": "graphql"}"#, params, vec!["Url".to_string()])
    }

    #[test]
    fn test_parse_outputs() {
        let outputs = parse_outputs(r#"{"Url": "https://api", "Port": 8080}"#)
            .unwrap()
            .unwrap();
        assert_eq!(outputs["Url"], "https://api");
        assert_eq!(outputs["Port"], "8080");
        assert_eq!(parse_outputs("  \n").unwrap(), None);
        assert_eq!(parse_outputs("null").unwrap(), None);
        assert!(parse_outputs("[1, 2]").is_err());
    }

    #[tokio::test]
    async fn test_apply_expands_placeholders_and_reads_outputs() {
        let dir = work_dir();
        let target = CommandDeployTarget::new(
            r#"test -f {template} && grep -q us-east-1_abc {parameters} && printf '{"Url": "https://%s.%s"}' {stack} {environment}"#,
            None,
            &dir,
        );

        let outputs = target.create_or_update("prod", &template()).await.unwrap();
        assert_eq!(outputs["Url"], "https://api.prod");

        let body = std::fs::read_to_string(dir.join("deploy/prod/api.template")).unwrap();
        assert_eq!(body, r#"{"kind": "graphql"}"#);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("prod"), "'prod'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_placeholders_cannot_inject_commands() {
        let dir = work_dir();
        let target = CommandDeployTarget::new(
            "true",
            Some(r#"printf '{"Name": "%s", "Env": "%s"}' {stack} {environment}"#.to_string()),
            &dir,
        );

        let outputs = target
            .describe("prod$(echo x)", "api; echo injected")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outputs["Name"], "api; echo injected");
        assert_eq!(outputs["Env"], "prod$(echo x)");
    }

    #[tokio::test]
    async fn test_apply_failure() {
        let dir = work_dir();
        let target = CommandDeployTarget::new("echo boom >&2; exit 3", None, &dir);
        let err = target.create_or_update("prod", &template()).await.unwrap_err();
        match err {
            Error::DeploymentFailed(message) => assert!(message.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_describe() {
        let dir = work_dir();
        let without = CommandDeployTarget::new("true", None, &dir);
        assert_eq!(without.describe("prod", "auth").await.unwrap(), None);

        let with = CommandDeployTarget::new(
            "true",
            Some(r#"echo "{\"UserPoolId\": \"$CONVEYOR_ENVIRONMENT-pool\"}""#.to_string()),
            &dir,
        );
        let outputs = with.describe("prod", "auth").await.unwrap().unwrap();
        assert_eq!(outputs["UserPoolId"], "prod-pool");
    }
}
