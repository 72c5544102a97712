//! Build specification and image tagging.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Environment variable carrying the source revision into a build.
pub const SOURCE_REVISION_ENV: &str = "SOURCE_REVISION";
/// Environment variable carrying the source branch into a build.
pub const SOURCE_BRANCH_ENV: &str = "SOURCE_BRANCH";
/// Environment variable exposing the computed image tag to build phases.
pub const IMAGE_TAG_ENV: &str = "IMAGE_TAG";
/// Environment variable exposing the image repository to build phases.
pub const IMAGE_REPOSITORY_ENV: &str = "IMAGE_REPOSITORY";
/// Environment variable exposing `repository:tag` to build phases.
pub const IMAGE_URI_ENV: &str = "IMAGE_URI";

/// A build phase. Phases always run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Install,
    PreBuild,
    Build,
    PostBuild,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 4] = [
        BuildPhase::Install,
        BuildPhase::PreBuild,
        BuildPhase::Build,
        BuildPhase::PostBuild,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Install => "install",
            BuildPhase::PreBuild => "pre_build",
            BuildPhase::Build => "build",
            BuildPhase::PostBuild => "post_build",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(BuildPhase::Install),
            "pre_build" | "pre-build" => Ok(BuildPhase::PreBuild),
            "build" => Ok(BuildPhase::Build),
            "post_build" | "post-build" => Ok(BuildPhase::PostBuild),
            _ => Err(format!("unknown build phase: {}", s)),
        }
    }
}

/// What the build executor runs for one pipeline execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Image repository pushed on success (e.g., an ECR repository URI).
    pub image_repository: String,
    /// Image the phase commands run in, for container executors.
    pub builder_image: Option<String>,
    pub install: Vec<String>,
    pub pre_build: Vec<String>,
    pub build: Vec<String>,
    pub post_build: Vec<String>,
    /// Environment for every phase.
    pub env: HashMap<String, String>,
    /// Secrets exposed to the phases as environment variables.
    pub secrets: Vec<String>,
    /// Optional per-phase timeouts.
    pub timeouts: HashMap<BuildPhase, Duration>,
}

impl BuildSpec {
    pub fn commands(&self, phase: BuildPhase) -> &[String] {
        match phase {
            BuildPhase::Install => &self.install,
            BuildPhase::PreBuild => &self.pre_build,
            BuildPhase::Build => &self.build,
            BuildPhase::PostBuild => &self.post_build,
        }
    }

    pub fn commands_mut(&mut self, phase: BuildPhase) -> &mut Vec<String> {
        match phase {
            BuildPhase::Install => &mut self.install,
            BuildPhase::PreBuild => &mut self.pre_build,
            BuildPhase::Build => &mut self.build,
            BuildPhase::PostBuild => &mut self.post_build,
        }
    }

    pub fn timeout(&self, phase: BuildPhase) -> Option<Duration> {
        self.timeouts.get(&phase).copied()
    }

    /// Total number of commands across all phases.
    pub fn command_count(&self) -> usize {
        BuildPhase::ALL
            .iter()
            .map(|p| self.commands(*p).len())
            .sum()
    }
}

/// Tag applied to the pushed image.
///
/// Derived from the source revision so that re-running the same revision
/// produces the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ImageTag(String);

impl ImageTag {
    pub const LATEST: &'static str = "latest";
    const REVISION_PREFIX_LEN: usize = 7;

    /// First seven characters of the revision, or `latest` when the
    /// revision is unresolved.
    pub fn from_revision(revision: Option<&str>) -> Self {
        match revision.map(str::trim) {
            Some(rev) if !rev.is_empty() => {
                Self(rev.chars().take(Self::REVISION_PREFIX_LEN).collect())
            }
            _ => Self::latest(),
        }
    }

    pub fn latest() -> Self {
        Self(Self::LATEST.to_string())
    }

    pub fn is_latest(&self) -> bool {
        self.0 == Self::LATEST
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A pushed image, `repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[display("{repository}:{tag}")]
pub struct ImageReference {
    pub repository: String,
    pub tag: ImageTag,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: ImageTag) -> Self {
        Self {
            repository: repository.into(),
            tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_from_revision() {
        let tag = ImageTag::from_revision(Some("abcdef1234567"));
        assert_eq!(tag.as_str(), "abcdef1");
    }

    #[test]
    fn test_image_tag_is_deterministic() {
        let rev = Some("0123456789abcdef0123456789abcdef01234567");
        assert_eq!(ImageTag::from_revision(rev), ImageTag::from_revision(rev));
    }

    #[test]
    fn test_image_tag_defaults_to_latest() {
        assert!(ImageTag::from_revision(None).is_latest());
        assert!(ImageTag::from_revision(Some("")).is_latest());
        assert!(ImageTag::from_revision(Some("   ")).is_latest());
    }

    #[test]
    fn test_short_revision_kept_whole() {
        assert_eq!(ImageTag::from_revision(Some("abc")).as_str(), "abc");
    }

    #[test]
    fn test_image_reference_display() {
        let image = ImageReference::new("registry.local/frontend-app", ImageTag::latest());
        assert_eq!(image.to_string(), "registry.local/frontend-app:latest");
    }

    #[test]
    fn test_phase_order_and_parse() {
        let names: Vec<_> = BuildPhase::ALL.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["install", "pre_build", "build", "post_build"]);
        assert_eq!("pre-build".parse::<BuildPhase>().unwrap(), BuildPhase::PreBuild);
        assert!("deploy".parse::<BuildPhase>().is_err());
    }
}
