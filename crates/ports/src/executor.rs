//! Executor seam
//!
//! The service drives workloads exclusively through [`WorkloadExecutor`]
//! and receives lifecycle updates through [`ExecutorSink`]. The Kubernetes
//! implementation lives in kiln-executor; tests substitute fakes.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodSpec};

use kiln_domain::{DomainError, DomainResult, JobMetadata, JobResult, JobStatus};

use crate::stores::LogReader;

/// Per-start configuration. Mirrors the submit-time decorations the
/// executor applies to the workload object.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Job name; a random one is generated when absent.
    pub name: Option<String>,
    /// User annotations, stored under the userdata namespace.
    pub annotations: Vec<(String, String)>,
    /// Max times the workload may fail before the job is marked failed.
    pub failure_limit: Option<u32>,
    /// Marks the job replayable in its computed status.
    pub can_replay: bool,
}

impl StartOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.push((key.into(), value.into()));
        self
    }

    pub fn with_failure_limit(mut self, limit: u32) -> Self {
        self.failure_limit = Some(limit);
        self
    }

    pub fn with_can_replay(mut self, can_replay: bool) -> Self {
        self.can_replay = can_replay;
        self
    }
}

/// Submits workloads to the orchestrator and observes them.
#[async_trait]
pub trait WorkloadExecutor: Send + Sync {
    /// Submits a workload. Returns the status computed from the freshly
    /// submitted (pending) workload.
    async fn start(
        &self,
        spec: PodSpec,
        metadata: JobMetadata,
        opts: StartOptions,
    ) -> DomainResult<JobStatus>;

    /// Marks the job failed with the given reason; the state machine
    /// moves it to DONE on the next status recomputation.
    async fn stop(&self, name: &str, reason: &str) -> DomainResult<()>;

    /// Records a structured result on the workload. Idempotent per
    /// (type, payload).
    async fn register_result(&self, name: &str, result: &JobResult) -> DomainResult<()>;

    /// Attaches to the workload's combined container logs. The reader
    /// reconnects internally on transient failures and ends when the
    /// workload terminates.
    async fn logs(&self, name: &str) -> DomainResult<LogReader>;
}

/// Receives lifecycle updates from the executor. Implemented by the
/// embedding service; updates for one job arrive in observation order and
/// may repeat.
#[async_trait]
pub trait ExecutorSink: Send + Sync {
    async fn on_update(&self, workload: &Pod, status: &JobStatus);

    async fn on_error(&self, err: &DomainError);
}
