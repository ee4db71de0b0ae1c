//! Collaborator traits
//!
//! The core depends on three seams:
//!
//! - [`EventSource`]: produces container lifecycle events from a runtime
//! - [`RegistryClient`]: executes register/deregister/list/delete against one registry
//! - [`Backend`]: the per-registry lifecycle (purge, refresh, event loop)

pub mod backend;
pub mod event_source;
pub mod registry_client;

pub use backend::{Backend, BackendFactory, RunSummary, StartupPlan};
pub use event_source::{EventSource, EventSourceFactory, EventStream};
pub use registry_client::{Registration, RegistryClient, RegistryRecord};
