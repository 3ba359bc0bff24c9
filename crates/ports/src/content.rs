//! Content provider seam
//!
//! Source-control ingestion is a collaborator: whoever triggers a job
//! supplies the init step that populates /workspace before the user's
//! containers run.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;

use kiln_domain::DomainResult;

#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Produces the checkout init container. The service renames it,
    /// mounts the workspace volume and prepends it to the workload spec.
    async fn init_container(&self) -> DomainResult<Container>;

    /// Prepares the remote content for the init step, e.g. by exposing it
    /// on an HTTP endpoint. Called once the job name is final.
    async fn serve(&self, job_name: &str) -> DomainResult<()>;
}
