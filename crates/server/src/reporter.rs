//! Status reporter wiring
//!
//! Commit-status reporting lives in plugins; the server itself ships a
//! logging reporter so every update is visible in the server logs.

use async_trait::async_trait;
use tracing::info;

use kiln_domain::{DomainResult, JobStatus};
use kiln_ports::StatusReporter;

pub struct LoggingStatusReporter;

#[async_trait]
impl StatusReporter for LoggingStatusReporter {
    async fn report(&self, status: &JobStatus) -> DomainResult<()> {
        info!(
            job = %status.name,
            phase = %status.phase,
            success = status.conditions.success,
            "job status update"
        );
        Ok(())
    }
}
