//! Source retrieval collaborator and push-event parsing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::pipeline::Trigger;
use crate::{ResourceId, Result};

/// The source artifact: a checked-out tree at a resolved revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheckout {
    /// Resolved commit. `None` when the provider cannot tell (plain
    /// directories), in which case the image tag falls back to `latest`.
    pub revision: Option<String>,
    pub branch: Option<String>,
    /// Directory holding the checked-out tree.
    pub workspace: PathBuf,
    pub fetched_at: DateTime<Utc>,
}

/// Fetches source for a run.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch the tree named by `trigger` into a run-scoped workspace.
    /// Failures surface as `Error::SourceUnavailable`.
    async fn fetch(&self, run_id: &ResourceId, trigger: &Trigger) -> Result<SourceCheckout>;
}

/// Parsed push event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    pub before: String,
    pub after: String,
    pub repository_full_name: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub head_commit: Option<CommitInfo>,
    pub pusher: String,
}

/// Commit information from a push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl PushEvent {
    /// Parse a GitHub push webhook payload.
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let before = payload.get("before")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let repository_full_name = payload
            .get("repository")?
            .get("full_name")?
            .as_str()?
            .to_string();

        let branch = r#ref.strip_prefix("refs/heads/").map(str::to_string);
        let tag = r#ref.strip_prefix("refs/tags/").map(str::to_string);

        let head_commit = payload
            .get("head_commit")
            .and_then(CommitInfo::from_github_commit);

        let pusher = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(PushEvent {
            r#ref,
            before,
            after,
            repository_full_name,
            branch,
            tag,
            head_commit,
            pusher,
        })
    }

    /// Branch deletions carry an all-zero `after` revision.
    pub fn is_deletion(&self) -> bool {
        self.after.chars().all(|c| c == '0')
    }

    /// Trigger for this push, if it updates `tracked_branch`.
    pub fn to_trigger(&self, tracked_branch: &str) -> Option<Trigger> {
        match &self.branch {
            Some(branch) if branch == tracked_branch && !self.is_deletion() => Some(
                Trigger::push(self.after.clone(), branch.clone(), Some(self.pusher.clone())),
            ),
            _ => None,
        }
    }
}

impl CommitInfo {
    fn from_github_commit(value: &serde_json::Value) -> Option<Self> {
        Some(CommitInfo {
            sha: value.get("id")?.as_str()?.to_string(),
            message: value.get("message")?.as_str()?.to_string(),
            author: value
                .get("author")
                .and_then(|a| a.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string(),
            timestamp: value
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TriggerKind;

    fn payload(r#ref: &str, after: &str) -> serde_json::Value {
        serde_json::json!({
            "ref": r#ref,
            "before": "1111111111111111111111111111111111111111",
            "after": after,
            "repository": { "full_name": "acme/shop" },
            "pusher": { "name": "octocat" },
            "head_commit": {
                "id": after,
                "message": "Add login page",
                "author": { "name": "Octo Cat", "email": "octo@example.com" },
                "timestamp": "2024-05-01T12:00:00Z"
            }
        })
    }

    #[test]
    fn test_parse_branch_push() {
        let event = PushEvent::from_github_payload(&payload(
            "refs/heads/main",
            "abcdef1234567890abcdef1234567890abcdef12",
        ))
        .unwrap();
        assert_eq!(event.branch.as_deref(), Some("main"));
        assert!(event.tag.is_none());
        assert_eq!(event.repository_full_name, "acme/shop");
        assert_eq!(event.head_commit.as_ref().unwrap().author, "Octo Cat");
        assert!(event.head_commit.unwrap().timestamp.is_some());
    }

    #[test]
    fn test_trigger_only_for_tracked_branch() {
        let rev = "abcdef1234567890abcdef1234567890abcdef12";
        let event = PushEvent::from_github_payload(&payload("refs/heads/main", rev)).unwrap();
        let trigger = event.to_trigger("main").unwrap();
        assert_eq!(trigger.kind, TriggerKind::Push);
        assert_eq!(trigger.revision.as_deref(), Some(rev));
        assert_eq!(trigger.actor.as_deref(), Some("octocat"));
        assert!(event.to_trigger("release").is_none());

        let tag = PushEvent::from_github_payload(&payload("refs/tags/v1.0.0", rev)).unwrap();
        assert_eq!(tag.tag.as_deref(), Some("v1.0.0"));
        assert!(tag.to_trigger("main").is_none());
    }

    #[test]
    fn test_branch_deletion_is_ignored() {
        let event = PushEvent::from_github_payload(&payload(
            "refs/heads/main",
            "0000000000000000000000000000000000000000",
        ))
        .unwrap();
        assert!(event.is_deletion());
        assert!(event.to_trigger("main").is_none());
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(PushEvent::from_github_payload(&serde_json::json!({"zen": "hi"})).is_none());
    }
}
