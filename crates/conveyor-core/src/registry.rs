//! Container registry collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Result;
use crate::build::{ImageReference, ImageTag};

/// Credentials returned by [`ContainerRegistry::authenticate`].
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub server_address: Option<String>,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("server_address", &self.server_address)
            .finish()
    }
}

/// Trait for container registries.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Name of this registry backend.
    fn name(&self) -> &'static str;

    /// Obtain credentials for pushing.
    async fn authenticate(&self) -> Result<RegistryCredentials>;

    /// Tag the locally built `image` as `tag` in the same repository and
    /// push it.
    async fn push(
        &self,
        image: &ImageReference,
        tag: &ImageTag,
        credentials: &RegistryCredentials,
    ) -> Result<ImageReference>;
}
