//! Pipeline configuration parsing.

use conveyor_core::build::{BuildPhase, BuildSpec};
use conveyor_core::graph::{self, dependents_of};
use conveyor_core::pipeline::{DeployMode, DeploySettings, PipelineDefinition, SourceSettings};
use conveyor_core::stack::StackDefinition;
use kdl::{KdlDocument, KdlNode};
use std::path::Path;

use crate::kdl_util::{
    child_nodes, child_string, duration_child, duration_prop, first_string_arg, string_args,
    string_list_prop, string_pairs, string_prop,
};
use crate::{ConfigError, ConfigResult};

/// Read and parse a pipeline file.
pub fn load_pipeline(path: impl AsRef<Path>) -> ConfigResult<PipelineDefinition> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_pipeline(&text)
}

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut source = SourceSettings::default();
    let mut build = None;
    let mut stacks: Vec<StackDefinition> = Vec::new();
    let mut deploy = DeploySettings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "source" => source = parse_source(node)?,
            "build" => build = Some(parse_build(node)?),
            "stack" => {
                let stack = parse_stack(node)?;
                if stacks.iter().any(|s| s.name == stack.name) {
                    return Err(ConfigError::Duplicate(format!("stack '{}'", stack.name)));
                }
                stacks.push(stack);
            }
            "deploy" => deploy = parse_deploy(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    let build = build.ok_or_else(|| ConfigError::MissingField("build".to_string()))?;

    // Unknown dependencies and cycles
    graph::resolve_order(&stacks)?;
    validate_output_references(&stacks)?;

    Ok(PipelineDefinition {
        name,
        source,
        build,
        stacks,
        deploy,
    })
}

fn parse_source(node: &KdlNode) -> ConfigResult<SourceSettings> {
    let defaults = SourceSettings::default();
    Ok(SourceSettings {
        repository: child_string(node, "repository"),
        branch: child_string(node, "branch").unwrap_or(defaults.branch),
        token_secret: child_string(node, "token-secret"),
    })
}

fn parse_build(node: &KdlNode) -> ConfigResult<BuildSpec> {
    let mut spec = BuildSpec::default();

    for child in child_nodes(node) {
        let key = child.name().value();
        if let Ok(phase) = key.parse::<BuildPhase>() {
            for cmd in child_nodes(child) {
                if cmd.name().value() == "run" {
                    let command = first_string_arg(cmd).ok_or_else(|| {
                        ConfigError::MissingField(format!("command for run in {}", phase))
                    })?;
                    spec.commands_mut(phase).push(command);
                }
            }
            if let Some(timeout) = duration_prop(child, "timeout")? {
                spec.timeouts.insert(phase, timeout);
            }
            continue;
        }

        match key {
            "image-repository" => spec.image_repository = first_string_arg(child).unwrap_or_default(),
            "builder-image" => spec.builder_image = first_string_arg(child),
            "env" => spec.env.extend(string_pairs(child)),
            "secrets" => spec.secrets.extend(string_args(child)),
            _ => {}
        }
    }

    if spec.image_repository.is_empty() {
        return Err(ConfigError::MissingField("build image-repository".to_string()));
    }

    Ok(spec)
}

fn parse_stack(node: &KdlNode) -> ConfigResult<StackDefinition> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;

    let mut stack = StackDefinition::new(name);
    for dep in string_list_prop(node, "needs") {
        stack = stack.with_dependency(dep);
    }
    if let Some(template) = string_prop(node, "template") {
        stack = stack.with_template(template);
    }

    for child in child_nodes(node) {
        match child.name().value() {
            "output" => {
                let args = string_args(child);
                let output = args.first().cloned().ok_or_else(|| {
                    ConfigError::MissingField(format!("output name in stack '{}'", stack.name))
                })?;
                let description = args.get(1).cloned().unwrap_or_default();
                stack = stack.with_output(output, description);
            }
            "parameter" => {
                let args = string_args(child);
                match args.as_slice() {
                    [key, value] => stack = stack.with_parameter(key, value),
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            field: format!("parameter in stack '{}'", stack.name),
                            message: "expected a key and a value".to_string(),
                        });
                    }
                }
            }
            "template" => {
                if let Some(template) = first_string_arg(child) {
                    stack = stack.with_template(template);
                }
            }
            _ => {}
        }
    }

    Ok(stack)
}

fn parse_deploy(node: &KdlNode) -> ConfigResult<DeploySettings> {
    let defaults = DeploySettings::default();
    let mode = match child_string(node, "mode") {
        Some(mode) => mode.parse::<DeployMode>().map_err(|message| ConfigError::InvalidValue {
            field: "deploy mode".to_string(),
            message,
        })?,
        None => defaults.mode,
    };

    Ok(DeploySettings {
        environment: child_string(node, "environment").unwrap_or(defaults.environment),
        timeout: duration_child(node, "timeout")?,
        mode,
    })
}

/// Deferred references must name a stack deployed earlier (a direct or
/// transitive dependency) and an output that stack declares.
fn validate_output_references(stacks: &[StackDefinition]) -> ConfigResult<()> {
    for stack in stacks {
        for reference in stack.output_references() {
            let Some(target) = stacks.iter().find(|s| s.name == reference.stack) else {
                return Err(ConfigError::InvalidReference(format!(
                    "stack '{}' references unknown stack in {}",
                    stack.name, reference
                )));
            };
            if !dependents_of(stacks, &target.name).contains(&stack.name.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "stack '{}' uses {} but does not depend on '{}'",
                    stack.name, reference, target.name
                )));
            }
            if !target.resource_outputs.contains_key(&reference.output) {
                return Err(ConfigError::InvalidReference(format!(
                    "stack '{}' does not declare output '{}'",
                    target.name, reference.output
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SHOP: &str = r#"
        pipeline "shop"

        source {
            repository "https://github.com/acme/shop.git"
            branch "release"
            token-secret "GITHUB_TOKEN"
        }

        build {
            image-repository "123456789012.dkr.ecr.us-east-1.amazonaws.com/frontend-app"
            builder-image "node:20"
            secrets "NPM_TOKEN"
            env {
                NODE_ENV "production"
            }
            install timeout="10m" {
                run "npm ci"
            }
            pre_build {
                run "npm test"
            }
            build {
                run "docker build -t ${build.image} ."
            }
            post_build {
                run "echo built ${build.image_tag}"
            }
        }

        stack "AuthenticationStack" template="infra/auth.json" {
            output "UserPoolId" "Cognito user pool id"
        }

        stack "StorageStack" template="infra/storage.json" {
            output "TableName"
        }

        stack "ApiStack" needs="AuthenticationStack" needs="StorageStack" template="infra/api.json" {
            output "GraphQLUrl"
            parameter "UserPoolId" "${stacks.AuthenticationStack.UserPoolId}"
            parameter "Table" "${stacks.StorageStack.TableName}"
        }

        stack "FrontendStack" needs="ApiStack" template="infra/frontend.json" {
            parameter "ApiUrl" "${stacks.ApiStack.GraphQLUrl}"
            parameter "PoolId" "${stacks.AuthenticationStack.UserPoolId}"
        }

        deploy {
            environment "production"
            timeout "30m"
            mode "waves"
        }
    "#;

    #[test]
    fn test_parse_full_pipeline() {
        let pipeline = parse_pipeline(SHOP).unwrap();
        assert_eq!(pipeline.name, "shop");
        assert_eq!(pipeline.source.branch, "release");
        assert_eq!(pipeline.source.token_secret.as_deref(), Some("GITHUB_TOKEN"));

        let build = &pipeline.build;
        assert_eq!(build.builder_image.as_deref(), Some("node:20"));
        assert_eq!(build.install, vec!["npm ci"]);
        assert_eq!(build.pre_build, vec!["npm test"]);
        assert_eq!(build.build, vec!["docker build -t ${build.image} ."]);
        assert_eq!(build.post_build.len(), 1);
        assert_eq!(build.env["NODE_ENV"], "production");
        assert_eq!(build.secrets, vec!["NPM_TOKEN"]);
        assert_eq!(
            build.timeout(BuildPhase::Install),
            Some(Duration::from_secs(600))
        );
        assert_eq!(build.timeout(BuildPhase::Build), None);

        assert_eq!(pipeline.stacks.len(), 4);
        let api = pipeline.stack("ApiStack").unwrap();
        assert_eq!(api.depends_on, vec!["AuthenticationStack", "StorageStack"]);
        assert_eq!(api.template.as_deref(), Some("infra/api.json"));
        assert_eq!(api.output_references().len(), 2);

        assert_eq!(pipeline.deploy.environment, "production");
        assert_eq!(pipeline.deploy.timeout, Some(Duration::from_secs(1800)));
        assert_eq!(pipeline.deploy.mode, DeployMode::Waves);
    }

    #[test]
    fn test_defaults() {
        let kdl = r#"
            pipeline "minimal"
            build {
                image-repository "registry.local/app"
            }
        "#;
        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.source.branch, "main");
        assert!(pipeline.stacks.is_empty());
        assert_eq!(pipeline.deploy.mode, DeployMode::Sequential);
        assert_eq!(pipeline.build.command_count(), 0);
    }

    #[test]
    fn test_missing_build() {
        let result = parse_pipeline(r#"pipeline "nobuild""#);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_detect_missing_dependency() {
        let kdl = r#"
            pipeline "bad-deps"
            build { image-repository "r/app"; }
            stack "ApiStack" needs="AuthenticationStack"
        "#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_detect_cycle() {
        let kdl = r#"
            pipeline "cyclic"
            build { image-repository "r/app"; }
            stack "a" needs="b"
            stack "b" needs="a"
        "#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_duplicate_stack() {
        let kdl = r#"
            pipeline "dup"
            build { image-repository "r/app"; }
            stack "a"
            stack "a"
        "#;
        assert!(matches!(parse_pipeline(kdl), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_reference_requires_dependency() {
        let kdl = r#"
            pipeline "undeclared"
            build { image-repository "r/app"; }
            stack "auth" {
                output "PoolId"
            }
            stack "api" {
                parameter "Pool" "${stacks.auth.PoolId}"
            }
        "#;
        let err = parse_pipeline(kdl).unwrap_err();
        assert!(err.to_string().contains("does not depend on 'auth'"));
    }

    #[test]
    fn test_reference_requires_declared_output() {
        let kdl = r#"
            pipeline "undeclared-output"
            build { image-repository "r/app"; }
            stack "auth"
            stack "api" needs="auth" {
                parameter "Pool" "${stacks.auth.PoolId}"
            }
        "#;
        let err = parse_pipeline(kdl).unwrap_err();
        assert!(err.to_string().contains("does not declare output 'PoolId'"));
    }

    #[test]
    fn test_invalid_deploy_mode() {
        let kdl = r#"
            pipeline "bad-mode"
            build { image-repository "r/app"; }
            deploy {
                mode "parallel"
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
