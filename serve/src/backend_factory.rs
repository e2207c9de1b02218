//! [`BackendFactory`] implementation wiring a template's [`BackendConfig`]
//! into a concrete sandbox, grounded on the `LocalFactory` test helper in
//! `warden::agentloop::runtime` and `warden::instance`.

use std::sync::Arc;

use async_trait::async_trait;
use warden::error::WardenError;
use warden::instance::{BackendConfig, BackendFactory};
use warden::sandbox::{DockerBackend, LocalBackend, SandboxBackend};
use warden::trace::EventBus;

pub struct WardenBackendFactory {
    events: Arc<EventBus>,
}

impl WardenBackendFactory {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl BackendFactory for WardenBackendFactory {
    async fn build(&self, cfg: &BackendConfig, username: &str) -> Result<Arc<dyn SandboxBackend>, WardenError> {
        match cfg {
            BackendConfig::Local { root } => Ok(Arc::new(LocalBackend::new(root, username).await?)),
            BackendConfig::Docker { container_name, workdir, docker_host, image } => Ok(Arc::new(DockerBackend::new(
                container_name.clone(),
                workdir.clone(),
                docker_host.clone(),
                image.clone(),
                username,
                self.events.clone(),
            ))),
        }
    }
}
