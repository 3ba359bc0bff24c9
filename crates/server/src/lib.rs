//! kiln server internals
//!
//! Bootstrap, the gRPC surface, authentication, the plugin host and the
//! web surface. The binary lives in main.rs.

pub mod auth;
pub mod content;
pub mod grpc;
pub mod plugins;
pub mod providers;
pub mod reporter;
pub mod web;
