//! Repository provider registry
//!
//! Repository plugins register a provider per source-control host.
//! Registration happens synchronously under the write lock; lookups take
//! the read lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;
use tonic::transport::Channel;

use kiln_domain::{DomainError, DomainResult, Repository};
use kiln_ports::ContentProvider;
use kiln_proto::{ContentInitContainerRequest, GetJobSpecRequest, RepositoryPluginServiceClient};

/// Supplies job specs and checkout steps for a source-control host.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Fetches the job spec file; an empty path selects the repository
    /// default.
    async fn job_spec(&self, repo: &Repository, path: &str) -> DomainResult<Vec<u8>>;

    /// Produces a content provider populating /workspace with a checkout.
    async fn content_provider(&self, repo: &Repository) -> DomainResult<Box<dyn ContentProvider>>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<HashMap<String, Arc<dyn RepositoryProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: &str, provider: Arc<dyn RepositoryProvider>) {
        self.inner
            .write()
            .expect("provider registry lock poisoned")
            .insert(host.to_string(), provider);
    }

    pub fn get(&self, host: &str) -> Option<Arc<dyn RepositoryProvider>> {
        self.inner
            .read()
            .expect("provider registry lock poisoned")
            .get(host)
            .cloned()
    }
}

/// Repository provider backed by a plugin process over its Unix socket.
pub struct GrpcRepositoryProvider {
    client: RepositoryPluginServiceClient<Channel>,
}

impl GrpcRepositoryProvider {
    pub fn new(client: RepositoryPluginServiceClient<Channel>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RepositoryProvider for GrpcRepositoryProvider {
    async fn job_spec(&self, repo: &Repository, path: &str) -> DomainResult<Vec<u8>> {
        let mut client = self.client.clone();
        let response = client
            .get_job_spec(GetJobSpecRequest {
                repository: Some(repo_to_pb(repo)),
                path: path.to_string(),
            })
            .await
            .map_err(|e| DomainError::TransientInfra(format!("repository plugin: {e}")))?;
        Ok(response.into_inner().job_yaml)
    }

    async fn content_provider(&self, repo: &Repository) -> DomainResult<Box<dyn ContentProvider>> {
        let mut client = self.client.clone();
        let response = client
            .content_init_container(ContentInitContainerRequest {
                repository: Some(repo_to_pb(repo)),
            })
            .await
            .map_err(|e| DomainError::TransientInfra(format!("repository plugin: {e}")))?;
        let container: Container = serde_json::from_slice(&response.into_inner().container_json)
            .map_err(|e| {
                DomainError::InvalidSpec(format!("plugin returned an invalid init container: {e}"))
            })?;
        Ok(Box::new(PluginContent { container }))
    }
}

/// Content provider wrapping a plugin-supplied init container. The plugin
/// owns content serving; `serve` is a no-op here.
struct PluginContent {
    container: Container,
}

#[async_trait]
impl ContentProvider for PluginContent {
    async fn init_container(&self) -> DomainResult<Container> {
        Ok(self.container.clone())
    }

    async fn serve(&self, _job_name: &str) -> DomainResult<()> {
        Ok(())
    }
}

fn repo_to_pb(repo: &Repository) -> kiln_proto::Repository {
    kiln_proto::Repository {
        host: repo.host.clone(),
        owner: repo.owner.clone(),
        repo: repo.repo.clone(),
        r#ref: repo.ref_.clone(),
        revision: repo.revision.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[async_trait]
    impl RepositoryProvider for Dummy {
        async fn job_spec(&self, _repo: &Repository, _path: &str) -> DomainResult<Vec<u8>> {
            Ok(b"pod: {}".to_vec())
        }

        async fn content_provider(
            &self,
            _repo: &Repository,
        ) -> DomainResult<Box<dyn ContentProvider>> {
            Err(DomainError::NotFound("dummy".to_string()))
        }
    }

    #[test]
    fn registration_is_per_host() {
        let registry = ProviderRegistry::new();
        registry.register("github.com", Arc::new(Dummy));
        assert!(registry.get("github.com").is_some());
        assert!(registry.get("gitlab.com").is_none());
    }
}
