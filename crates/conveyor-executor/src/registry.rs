//! Container registry backends.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::image::{PushImageOptions, TagImageOptions};
use conveyor_core::build::{ImageReference, ImageTag};
use conveyor_core::registry::{ContainerRegistry, RegistryCredentials};
use conveyor_core::secret::SecretStore;
use conveyor_core::{Error, Result};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Pushes images through the local Docker daemon.
pub struct DockerRegistry {
    docker: Docker,
    secrets: Arc<dyn SecretStore>,
    server: Option<String>,
    username_secret: Option<String>,
    password_secret: Option<String>,
}

impl DockerRegistry {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        server: Option<String>,
        username_secret: Option<String>,
        password_secret: Option<String>,
    ) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            docker,
            secrets,
            server,
            username_secret,
            password_secret,
        })
    }

    async fn secret(&self, name: &Option<String>) -> Result<Option<String>> {
        match name {
            Some(name) => {
                let value = self.secrets.get(name).await?;
                let plain = value
                    .as_string()
                    .ok_or_else(|| Error::InvalidInput(format!("secret {} is not a string", name)))?;
                Ok(Some(plain.to_string()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ContainerRegistry for DockerRegistry {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn authenticate(&self) -> Result<RegistryCredentials> {
        let credentials = RegistryCredentials {
            username: self.secret(&self.username_secret).await?,
            password: self.secret(&self.password_secret).await?,
            server_address: self.server.clone(),
        };
        debug!(credentials = ?credentials, "Resolved registry credentials");
        Ok(credentials)
    }

    async fn push(
        &self,
        image: &ImageReference,
        tag: &ImageTag,
        credentials: &RegistryCredentials,
    ) -> Result<ImageReference> {
        let target = ImageReference::new(image.repository.clone(), tag.clone());

        if image.tag != *tag {
            let options = TagImageOptions {
                repo: target.repository.clone(),
                tag: tag.to_string(),
            };
            self.docker
                .tag_image(&image.to_string(), Some(options))
                .await
                .map_err(|e| Error::Registry(format!("Failed to tag {}: {}", target, e)))?;
        }

        info!(image = %target, "Pushing image");
        let auth = DockerCredentials {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            serveraddress: credentials.server_address.clone(),
            ..Default::default()
        };
        let options = PushImageOptions {
            tag: tag.to_string(),
        };

        let mut stream = self
            .docker
            .push_image(&target.repository, Some(options), Some(auth));
        while let Some(progress) = stream.next().await {
            let info = progress
                .map_err(|e| Error::Registry(format!("Failed to push {}: {}", target, e)))?;
            if let Some(error) = info.error {
                return Err(Error::Registry(format!("Failed to push {}: {}", target, error)));
            }
            if let Some(status) = info.status {
                debug!(image = %target, status = %status, "Push progress");
            }
        }

        Ok(target)
    }
}

/// Records pushes without talking to a registry. Used for dry runs and tests.
#[derive(Default)]
pub struct InMemoryRegistry {
    pushed: Mutex<Vec<ImageReference>>,
    rejected_tags: Vec<String>,
    authentications: Mutex<usize>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that rejects pushes of the given tag.
    pub fn rejecting(tag: impl Into<String>) -> Self {
        Self {
            rejected_tags: vec![tag.into()],
            ..Self::default()
        }
    }

    pub fn pushed(&self) -> Vec<ImageReference> {
        self.pushed.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn authentications(&self) -> usize {
        self.authentications.lock().map(|a| *a).unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRegistry for InMemoryRegistry {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn authenticate(&self) -> Result<RegistryCredentials> {
        if let Ok(mut count) = self.authentications.lock() {
            *count += 1;
        }
        Ok(RegistryCredentials::default())
    }

    async fn push(
        &self,
        image: &ImageReference,
        tag: &ImageTag,
        _credentials: &RegistryCredentials,
    ) -> Result<ImageReference> {
        if self.rejected_tags.iter().any(|t| t == tag.as_str()) {
            return Err(Error::Registry(format!(
                "push of {}:{} rejected",
                image.repository, tag
            )));
        }
        let target = ImageReference::new(image.repository.clone(), tag.clone());
        self.pushed
            .lock()
            .map_err(|_| Error::Internal("push log poisoned".to_string()))?
            .push(target.clone());
        Ok(target)
    }
}
