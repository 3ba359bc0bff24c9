//! Service layer of the kiln CI engine
//!
//! Ties the executor, the stores, the log cutter and the event bus
//! together into the RunJob/StopJob/Listen/Subscribe surface the RPC
//! layer exposes.

pub mod events;
pub mod service;
pub mod template;

pub use events::EventBus;
pub use service::{
    ListenEvent, LogListenMode, Service, ServiceConfig, ServiceSink, CLEANUP_ANNOTATION,
};
pub use template::TemplateContext;
