//! Status reporter seam
//!
//! Called after every non-cleanup status update, e.g. to push commit
//! statuses back to the source-control provider. Reporters are expected
//! to be idempotent per (name, phase, success); the core does not
//! deduplicate.

use async_trait::async_trait;

use kiln_domain::{DomainResult, JobStatus};

#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, status: &JobStatus) -> DomainResult<()>;
}
