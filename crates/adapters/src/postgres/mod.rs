//! PostgreSQL-backed stores
//!
//! Production persistence for job statuses, replay specs, user tokens and
//! the name counters.

mod jobs;
mod numbers;
mod tokens;

pub use jobs::PostgresJobStore;
pub use numbers::PostgresNumberGroup;
pub use tokens::PostgresTokenStore;
