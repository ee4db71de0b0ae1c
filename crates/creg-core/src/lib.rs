// # creg-core
//
// Core library for creg, the container service registrator.
//
// ## Architecture Overview
//
// - **EventSource**: Container runtime events, normalized and eligibility-filtered
// - **EventMultiplexer**: Fans events out to named backends by routing label
// - **Backend**: Per-registry lifecycle (purge, refresh, event loop)
// - **RegistryBackend**: Label-to-registration driver shared by all registries
// - **RegistryClient**: Thin request/response surface of one registry
// - **PluginRegistry**: Name-keyed factories for sources and backends
//
// Registries are the only durable state. Nothing about what was registered
// is remembered in process; deregistration recomputes from labels.

pub mod config;
pub mod driver;
pub mod error;
pub mod labels;
pub mod multiplexer;
pub mod registry;
pub mod traits;
pub mod types;

// Re-export core types for convenience
pub use config::{BackendConfig, CregConfig, EngineConfig, SourceConfig};
pub use driver::{BackendSettings, DebugBackend, KeyScheme, RegistryBackend};
pub use error::{Error, Result};
pub use labels::{Eligibility, LabelSchema, Routing};
pub use multiplexer::{EventMultiplexer, MultiplexerHandle};
pub use registry::PluginRegistry;
pub use traits::{
    Backend, BackendFactory, EventSource, EventSourceFactory, EventStream, Registration,
    RegistryClient, RegistryRecord, RunSummary, StartupPlan,
};
pub use types::{ContainerAction, ContainerEvent, ContainerInfo, Port, PortBinding, ServiceSpec};
