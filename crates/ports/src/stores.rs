//! Durable state ports
//!
//! The core owns no storage itself. Jobs, log blobs, name counters and
//! user tokens live behind these traits.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use kiln_domain::{DomainResult, FilterExpression, JobStatus, OrderExpression};

/// Writer handle into a job's log stream. Dropping the handle does not
/// close the log; closing is explicit via [`LogStore::close`].
pub type LogWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader over a job's log stream.
pub type LogReader = Box<dyn AsyncRead + Send + Unpin>;

/// Persistence for job statuses and replayable job specs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores (inserts or replaces) a job status keyed by name.
    async fn store(&self, status: &JobStatus) -> DomainResult<()>;

    async fn get(&self, name: &str) -> DomainResult<Option<JobStatus>>;

    /// Saves the raw job YAML so the job can be replayed later.
    async fn store_job_spec(&self, name: &str, spec: Vec<u8>) -> DomainResult<()>;

    async fn get_job_spec(&self, name: &str) -> DomainResult<Option<Vec<u8>>>;

    /// Queries stored jobs. Returns the matching page and the total number
    /// of matches.
    async fn find(
        &self,
        filter: &[FilterExpression],
        order: &[OrderExpression],
        start: i64,
        limit: i64,
    ) -> DomainResult<(Vec<JobStatus>, i64)>;
}

/// Append-only log streams keyed by job name. Implementations serialize
/// writes per name; the core never locks across log I/O.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Creates the log for a job if absent and opens it for appending.
    /// Reopening an existing log resumes where it left off.
    async fn open(&self, name: &str) -> DomainResult<LogWriter>;

    /// Returns another writer into an already-open log.
    async fn append(&self, name: &str) -> DomainResult<LogWriter>;

    /// Reads a log from the beginning. While the log is open the reader
    /// follows live appends; it sees EOF once the log is closed.
    async fn read(&self, name: &str) -> DomainResult<LogReader>;

    /// Closes the log; followers receive EOF.
    async fn close(&self, name: &str) -> DomainResult<()>;
}

/// Monotonic counters used to mint sequential job names per group.
#[async_trait]
pub trait NumberGroup: Send + Sync {
    /// Returns the next number in the group, starting at 0.
    async fn next(&self, group: &str) -> DomainResult<i64>;
}

/// API token persistence.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Stores a token for a user. A user may hold several tokens.
    async fn store(&self, token: &str, user: &str) -> DomainResult<()>;

    /// Resolves a token to its user; None on unknown tokens.
    async fn get(&self, token: &str) -> DomainResult<Option<String>>;

    /// Removes all tokens older than the given age.
    async fn prune(&self, max_age: chrono::Duration) -> DomainResult<()>;
}
