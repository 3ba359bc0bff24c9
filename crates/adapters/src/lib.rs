//! Adapters binding the kiln core to its infrastructure
//!
//! Postgres-backed job/token/counter stores, the filesystem log store,
//! and the YAML configuration.

pub mod config;
pub mod logs;
pub mod postgres;

pub use config::{Config, ConfigError, KDuration};
pub use logs::FileLogStore;
pub use postgres::{PostgresJobStore, PostgresNumberGroup, PostgresTokenStore};
