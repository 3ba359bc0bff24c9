//! Port traits of the kiln core
//!
//! Every seam between the job-execution core and the outside world is an
//! async trait defined here: the durable stores, the workload executor,
//! and the collaborators the service composes (content provider, status
//! reporter).

pub mod content;
pub mod executor;
pub mod reporter;
pub mod stores;

pub use content::ContentProvider;
pub use executor::{ExecutorSink, StartOptions, WorkloadExecutor};
pub use reporter::StatusReporter;
pub use stores::{JobStore, LogReader, LogStore, LogWriter, NumberGroup, TokenStore};
