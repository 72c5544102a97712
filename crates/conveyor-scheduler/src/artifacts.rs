//! In-memory artifact store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use conveyor_core::artifact::{Artifact, ArtifactKey, ArtifactStore, PruneStats, content_digest};
use conveyor_core::{Error, ResourceId, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Contents {
    artifacts: HashMap<ArtifactKey, Artifact>,
    /// Content by digest; shared between keys holding identical bytes.
    blobs: HashMap<String, Bytes>,
}

/// Content-addressed artifact store held in memory for the lifetime of the
/// process.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    contents: RwLock<Contents>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn blob_count(&self) -> usize {
        self.contents.read().map(|c| c.blobs.len()).unwrap_or_default()
    }
}

fn poisoned() -> Error {
    Error::Internal("artifact store poisoned".to_string())
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: ArtifactKey, data: Bytes) -> Result<Artifact> {
        let mut contents = self.contents.write().map_err(|_| poisoned())?;
        if contents.artifacts.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "artifact {}/{} already exists for run {}",
                key.stage, key.name, key.run_id
            )));
        }

        let artifact = Artifact {
            id: content_digest(&data),
            key: key.clone(),
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        debug!(run_id = %key.run_id, stage = %key.stage, name = %key.name, id = %artifact.id, "Stored artifact");
        contents.blobs.entry(artifact.id.clone()).or_insert(data);
        contents.artifacts.insert(key, artifact.clone());
        Ok(artifact)
    }

    async fn get(&self, artifact: &Artifact) -> Result<Bytes> {
        let contents = self.contents.read().map_err(|_| poisoned())?;
        let stored = contents
            .artifacts
            .get(&artifact.key)
            .filter(|stored| stored.id == artifact.id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "artifact {}/{} of run {}",
                    artifact.key.stage, artifact.key.name, artifact.key.run_id
                ))
            })?;
        contents
            .blobs
            .get(&stored.id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("blob {} missing", stored.id)))
    }

    async fn list(&self, run_id: &ResourceId) -> Result<Vec<Artifact>> {
        let contents = self.contents.read().map_err(|_| poisoned())?;
        let mut artifacts: Vec<Artifact> = contents
            .artifacts
            .values()
            .filter(|a| a.key.run_id == *run_id)
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key.name.cmp(&b.key.name))
        });
        Ok(artifacts)
    }

    async fn release_run(&self, run_id: &ResourceId) -> Result<PruneStats> {
        let mut contents = self.contents.write().map_err(|_| poisoned())?;
        let released: Vec<ArtifactKey> = contents
            .artifacts
            .keys()
            .filter(|k| k.run_id == *run_id)
            .cloned()
            .collect();

        let mut stats = PruneStats::default();
        for key in released {
            let Some(artifact) = contents.artifacts.remove(&key) else {
                continue;
            };
            stats.artifacts_deleted += 1;
            let shared = contents.artifacts.values().any(|a| a.id == artifact.id);
            if !shared && contents.blobs.remove(&artifact.id).is_some() {
                stats.bytes_freed += artifact.size;
            }
        }

        debug!(run_id = %run_id, deleted = stats.artifacts_deleted, bytes = stats.bytes_freed, "Released run artifacts");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = InMemoryArtifactStore::new();
        let run = ResourceId::new();
        let artifact = store
            .put(ArtifactKey::new(run, "source", "checkout"), Bytes::from_static(b"tree"))
            .await
            .unwrap();

        assert_eq!(artifact.id, content_digest(b"tree"));
        assert_eq!(artifact.size, 4);
        assert_eq!(artifact.produced_by_stage(), "source");
        assert_eq!(store.get(&artifact).await.unwrap(), Bytes::from_static(b"tree"));
        assert_eq!(store.list(&run).await.unwrap(), vec![artifact]);
        assert!(store.list(&ResourceId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_artifacts_are_immutable() {
        let store = InMemoryArtifactStore::new();
        let key = ArtifactKey::new(ResourceId::new(), "build", "manifest");
        store.put(key.clone(), Bytes::from_static(b"v1")).await.unwrap();

        let err = store.put(key, Bytes::from_static(b"v2")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_release_run_keeps_shared_blobs() {
        let store = InMemoryArtifactStore::new();
        let first = ResourceId::new();
        let second = ResourceId::new();

        let a = store
            .put(ArtifactKey::new(first, "build", "template:auth"), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        store
            .put(ArtifactKey::new(first, "build", "manifest"), Bytes::from_static(b"manifest-1"))
            .await
            .unwrap();
        let b = store
            .put(ArtifactKey::new(second, "build", "template:auth"), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(store.blob_count(), 2);

        let stats = store.release_run(&first).await.unwrap();
        assert_eq!(stats.artifacts_deleted, 2);
        assert_eq!(stats.bytes_freed, 10);
        assert!(store.get(&a).await.is_err());
        assert_eq!(store.get(&b).await.unwrap(), Bytes::from_static(b"{}"));

        let stats = store.release_run(&second).await.unwrap();
        assert_eq!(stats.bytes_freed, 2);
        assert_eq!(store.blob_count(), 0);
    }
}
