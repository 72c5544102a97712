//! Stack definitions, rendered templates and deferred output references.
//!
//! A stack is an opaque, independently deployable unit of infrastructure.
//! Values produced by one stack's deployment (a user pool id, an API url)
//! are referenced from a dependent stack as `${stacks.<stack>.<output>}`.
//! Those references are left untouched when templates are rendered during
//! the build and are bound by the deployment executor at apply time.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::artifact::content_digest;

/// Outputs reported by a deployed stack, keyed by output name.
pub type DeploymentOutputs = BTreeMap<String, String>;

/// A named infrastructure unit with declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDefinition {
    /// Stack name (e.g., "AuthenticationStack").
    pub name: String,
    /// Names of stacks that must be deployed first, in declaration order.
    pub depends_on: Vec<String>,
    /// Declared resource outputs, name -> description.
    pub resource_outputs: BTreeMap<String, String>,
    /// Template source handed to the template provider (usually a path
    /// relative to the source checkout).
    pub template: Option<String>,
    /// Template parameters. Values may contain deferred references.
    pub parameters: BTreeMap<String, String>,
}

impl StackDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            resource_outputs: BTreeMap::new(),
            template: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, stack: impl Into<String>) -> Self {
        let stack = stack.into();
        if !self.depends_on.contains(&stack) {
            self.depends_on.push(stack);
        }
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.resource_outputs.insert(name.into(), description.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(&self, stack: &str) -> bool {
        self.depends_on.iter().any(|d| d == stack)
    }

    /// Deferred references used by this stack's parameters.
    pub fn output_references(&self) -> Vec<StackOutputRef> {
        let mut refs = Vec::new();
        for value in self.parameters.values() {
            for r in find_output_refs(value) {
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
        }
        refs
    }
}

/// A deferred reference to another stack's deployment output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackOutputRef {
    pub stack: String,
    pub output: String,
}

impl fmt::Display for StackOutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{stacks.{}.{}}}", self.stack, self.output)
    }
}

static OUTPUT_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{stacks\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\}").unwrap()
});

/// Find every `${stacks.<stack>.<output>}` reference in a string.
pub fn find_output_refs(input: &str) -> Vec<StackOutputRef> {
    OUTPUT_REF_REGEX
        .captures_iter(input)
        .map(|caps| StackOutputRef {
            stack: caps[1].to_string(),
            output: caps[2].to_string(),
        })
        .collect()
}

/// Replace every deferred reference in `input` using `resolve`.
/// Returns the first reference that could not be resolved.
pub fn bind_output_refs<F>(input: &str, resolve: &F) -> Result<String, StackOutputRef>
where
    F: Fn(&StackOutputRef) -> Option<String>,
{
    let mut unresolved = None;
    let bound = OUTPUT_REF_REGEX.replace_all(input, |caps: &regex::Captures| {
        let reference = StackOutputRef {
            stack: caps[1].to_string(),
            output: caps[2].to_string(),
        };
        match resolve(&reference) {
            Some(value) => value,
            None => {
                let text = reference.to_string();
                unresolved.get_or_insert(reference);
                text
            }
        }
    });

    match unresolved {
        Some(reference) => Err(reference),
        None => Ok(bound.into_owned()),
    }
}

/// A stack template rendered by the template provider, ready to deploy once
/// its deferred references are bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplate {
    /// Stack this template deploys.
    pub stack_name: String,
    /// Template document handed to the deploy target.
    pub body: String,
    /// Parameters passed alongside the body.
    pub parameters: BTreeMap<String, String>,
    /// Outputs the deployment must report.
    pub outputs: Vec<String>,
    /// Digest over body and parameters.
    pub checksum: String,
}

impl RenderedTemplate {
    pub fn new(
        stack_name: impl Into<String>,
        body: impl Into<String>,
        parameters: BTreeMap<String, String>,
        outputs: Vec<String>,
    ) -> Self {
        let body = body.into();
        let checksum = Self::compute_checksum(&body, &parameters);
        Self {
            stack_name: stack_name.into(),
            body,
            parameters,
            outputs,
            checksum,
        }
    }

    fn compute_checksum(body: &str, parameters: &BTreeMap<String, String>) -> String {
        let mut material = String::with_capacity(body.len() + 64);
        material.push_str(body);
        for (key, value) in parameters {
            material.push('\0');
            material.push_str(key);
            material.push('=');
            material.push_str(value);
        }
        content_digest(material.as_bytes())
    }

    /// Deferred references in the body and parameters.
    pub fn references(&self) -> Vec<StackOutputRef> {
        let mut refs: Vec<StackOutputRef> = Vec::new();
        let sources = std::iter::once(&self.body).chain(self.parameters.values());
        for text in sources {
            for r in find_output_refs(text) {
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
        }
        refs
    }

    pub fn is_bound(&self) -> bool {
        self.references().is_empty()
    }

    /// Produce a copy with every deferred reference substituted.
    pub fn bind<F>(&self, resolve: F) -> Result<RenderedTemplate, StackOutputRef>
    where
        F: Fn(&StackOutputRef) -> Option<String>,
    {
        let body = bind_output_refs(&self.body, &resolve)?;
        let mut parameters = BTreeMap::new();
        for (key, value) in &self.parameters {
            parameters.insert(key.clone(), bind_output_refs(value, &resolve)?);
        }
        Ok(RenderedTemplate::new(
            self.stack_name.clone(),
            body,
            parameters,
            self.outputs.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_output_refs() {
        let refs = find_output_refs(
            r#"{"pool": "${stacks.AuthenticationStack.UserPoolId}", "sha": "${git.sha}"}"#,
        );
        assert_eq!(
            refs,
            vec![StackOutputRef {
                stack: "AuthenticationStack".to_string(),
                output: "UserPoolId".to_string(),
            }]
        );
    }

    #[test]
    fn test_bind_output_refs() {
        let bound = bind_output_refs("pool=${stacks.auth.PoolId}", &|r: &StackOutputRef| {
            (r.stack == "auth" && r.output == "PoolId").then(|| "us-east-1_abc".to_string())
        })
        .unwrap();
        assert_eq!(bound, "pool=us-east-1_abc");
    }

    #[test]
    fn test_bind_reports_unresolved_reference() {
        let err = bind_output_refs("${stacks.auth.PoolId} ${stacks.db.TableName}", &|r: &StackOutputRef| {
            (r.stack == "auth").then(|| "x".to_string())
        })
        .unwrap_err();
        assert_eq!(err.stack, "db");
        assert_eq!(err.output, "TableName");
    }

    #[test]
    fn test_template_bind_changes_checksum() {
        let mut params = BTreeMap::new();
        params.insert("UserPoolId".to_string(), "${stacks.auth.PoolId}".to_string());
        let template = RenderedTemplate::new("api", "{}", params, vec!["ApiUrl".to_string()]);
        assert!(!template.is_bound());

        let bound = template.bind(|_| Some("pool-1".to_string())).unwrap();
        assert!(bound.is_bound());
        assert_eq!(bound.parameters["UserPoolId"], "pool-1");
        assert_ne!(bound.checksum, template.checksum);

        let again = template.bind(|_| Some("pool-1".to_string())).unwrap();
        assert_eq!(again.checksum, bound.checksum);
    }

    #[test]
    fn test_stack_output_references() {
        let stack = StackDefinition::new("api")
            .with_dependency("auth")
            .with_dependency("auth")
            .with_parameter("Pool", "${stacks.auth.PoolId}")
            .with_parameter("Region", "us-east-1");
        assert_eq!(stack.depends_on, vec!["auth"]);
        assert_eq!(stack.output_references().len(), 1);
        assert_eq!(
            stack.output_references()[0].to_string(),
            "${stacks.auth.PoolId}"
        );
    }
}
