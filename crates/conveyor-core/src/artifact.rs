//! Artifact storage abstraction.
//!
//! Artifacts are the immutable outputs one pipeline stage hands to a later
//! one (the source checkout manifest, rendered templates, the build
//! manifest). They are content addressed and consumed by reference.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ResourceId, Result};

/// Key for storing an artifact within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// Pipeline run ID.
    pub run_id: ResourceId,
    /// Stage that produced the artifact.
    pub stage: String,
    /// Artifact name within the stage.
    pub name: String,
}

impl ArtifactKey {
    pub fn new(run_id: ResourceId, stage: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run_id,
            stage: stage.into(),
            name: name.into(),
        }
    }
}

/// Handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Content address (sha256, hex).
    pub id: String,
    /// Storage key.
    pub key: ArtifactKey,
    /// Size in bytes.
    pub size: u64,
    /// When the artifact was stored.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn produced_by_stage(&self) -> &str {
        &self.key.stage
    }
}

/// Statistics from releasing a run's artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub artifacts_deleted: u64,
    pub bytes_freed: u64,
}

/// Hex-encoded sha256 of `data`.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact. Fails with `Error::Conflict` if the key is taken.
    async fn put(&self, key: ArtifactKey, data: Bytes) -> Result<Artifact>;

    /// Retrieve an artifact's content.
    async fn get(&self, artifact: &Artifact) -> Result<Bytes>;

    /// List artifacts produced by a run.
    async fn list(&self, run_id: &ResourceId) -> Result<Vec<Artifact>>;

    /// Drop every artifact produced by a run.
    async fn release_run(&self, run_id: &ResourceId) -> Result<PruneStats>;
}

/// Serialize `value` as JSON and store it.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn ArtifactStore,
    key: ArtifactKey,
    value: &T,
) -> Result<Artifact> {
    let data = serde_json::to_vec(value)?;
    store.put(key, Bytes::from(data)).await
}

/// Fetch an artifact and deserialize it from JSON.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    artifact: &Artifact,
) -> Result<T> {
    let data = store.get(artifact).await?;
    Ok(serde_json::from_slice(&data)?)
}
