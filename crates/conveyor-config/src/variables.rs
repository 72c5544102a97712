//! Variable interpolation for pipeline configurations.
//!
//! Supports variables like:
//! - `${git.sha}` - Full commit SHA of the source revision
//! - `${git.short_sha}` - Short (7 char) commit SHA
//! - `${git.branch}` - Branch the run was triggered for
//! - `${build.image}` - `repository:tag` of the image being built
//! - `${build.image_tag}` - Tag computed from the source revision
//! - `${build.repository}` - Image repository
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${run.trigger}` - What triggered the run (push, manual)
//! - `${env.VAR_NAME}` - Pipeline or process environment variable
//! - `${secrets.SECRET_NAME}` - Secret value
//!
//! Unknown variables are left in place. Deferred stack output references
//! (`${stacks.<stack>.<output>}`) never match and survive interpolation
//! untouched.

use conveyor_core::secret::mask_secrets;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub build: BuildContext,
    pub pipeline_name: String,
    pub run: RunContext,
    pub env: HashMap<String, String>,
    /// Secrets (masked in logs)
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub repository: String,
    pub image_tag: String,
}

impl BuildContext {
    pub fn image(&self) -> String {
        format!("{}:{}", self.repository, self.image_tag)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub trigger: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),

            ["build", "image"] => Some(self.build.image()),
            ["build", "image_tag"] => Some(self.build.image_tag.clone()),
            ["build", "repository"] => Some(self.build.repository.clone()),

            ["pipeline", "name"] => Some(self.pipeline_name.clone()),

            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "trigger"] => Some(self.run.trigger.clone()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Names of the secrets a string refers to.
    pub fn find_secrets_in_string(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .filter_map(|caps| caps[1].strip_prefix("secrets.").map(str::to_string))
            .collect()
    }

    /// All secret values that should be masked in logs.
    pub fn secret_values(&self) -> Vec<&str> {
        self.secrets.values().map(|s| s.as_str()).collect()
    }

    /// `text` with every secret value replaced by `***`.
    pub fn mask(&self, text: &str) -> String {
        mask_secrets(text, self.secret_values())
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.git.branch = branch.into();
        self
    }

    pub fn with_image(mut self, repository: impl Into<String>, tag: impl Into<String>) -> Self {
        self.ctx.build.repository = repository.into();
        self.ctx.build.image_tag = tag.into();
        self
    }

    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.ctx.pipeline_name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>, trigger: impl Into<String>) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.trigger = trigger.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.ctx
            .env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
