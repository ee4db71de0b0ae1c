//! Configuration types for creg
//!
//! This module defines all configuration structures used throughout the
//! workspace. The daemon builds a [`CregConfig`] from environment variables
//! or a JSON file; library users construct it directly.

use crate::labels::LabelSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default Podman API socket
pub const DEFAULT_PODMAN_SOCKET: &str = "/run/podman/podman.sock";

/// Default namespace stamped on registrations
pub const DEFAULT_NAMESPACE: &str = "creg";

/// Main creg configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CregConfig {
    /// Instance id; scopes containers through the instance label
    pub instance_id: String,

    /// Address advertised for every registered service
    pub forward_address: String,

    /// Tags appended to every registration, in order
    #[serde(default)]
    pub static_tags: Vec<String>,

    /// Namespace identifying records owned by creg
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Recognized label keys
    #[serde(default)]
    pub labels: LabelSchema,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Container runtimes to watch
    pub sources: Vec<SourceConfig>,

    /// Registries to keep in sync
    pub backends: Vec<BackendConfig>,
}

impl CregConfig {
    /// Create a configuration with defaults and no sources or backends
    pub fn new(instance_id: impl Into<String>, forward_address: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            forward_address: forward_address.into(),
            static_tags: Vec::new(),
            namespace: default_namespace(),
            labels: LabelSchema::default(),
            engine: EngineConfig::default(),
            sources: Vec::new(),
            backends: Vec::new(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.instance_id.trim().is_empty() {
            return Err(crate::Error::config("Instance id cannot be empty"));
        }

        if self.forward_address.trim().is_empty() {
            return Err(crate::Error::config("Forward address cannot be empty"));
        }

        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(crate::Error::config(format!(
                "Invalid namespace '{}': must be non-empty and contain no '/'",
                self.namespace
            )));
        }

        if self.sources.is_empty() {
            return Err(crate::Error::config("No event sources configured"));
        }

        if self.backends.is_empty() {
            return Err(crate::Error::config("No backends configured"));
        }

        if self.labels.port_prefix.is_empty() {
            return Err(crate::Error::config("Port label prefix cannot be empty"));
        }

        for source in &self.sources {
            source.validate()?;
        }

        let mut names = std::collections::HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !names.insert(backend.name()) {
                return Err(crate::Error::config(format!(
                    "Duplicate backend name: {}",
                    backend.name()
                )));
            }
        }

        self.engine.validate()
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of each backend's event channel
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,

    /// Deadline for a single registry call, in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Purge owned registrations before the first refresh
    #[serde(default)]
    pub purge_on_start: bool,

    /// Register running containers before processing live events
    #[serde(default = "default_refresh_on_start")]
    pub refresh_on_start: bool,

    /// Advertise runtime-published host ports instead of container ports
    #[serde(default)]
    pub use_host_ports: bool,

    /// How long shutdown waits for backends to stop, in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl EngineConfig {
    /// Deadline for a single registry call
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Shutdown grace period
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.output_buffer == 0 {
            return Err(crate::Error::config("Output buffer must be > 0"));
        }
        if self.call_timeout_secs == 0 {
            return Err(crate::Error::config("Call timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_buffer: default_output_buffer(),
            call_timeout_secs: default_call_timeout_secs(),
            purge_on_start: false,
            refresh_on_start: default_refresh_on_start(),
            use_host_ports: false,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_output_buffer() -> usize {
    16
}

fn default_call_timeout_secs() -> u64 {
    5
}

fn default_refresh_on_start() -> bool {
    true
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// Event source configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Docker Engine API
    Docker {
        /// Unix socket path; the client's local defaults when absent
        socket: Option<String>,
    },

    /// Podman Docker-compatible API
    Podman {
        /// Unix socket path
        #[serde(default = "default_podman_socket")]
        socket: String,
    },
}

impl SourceConfig {
    /// Validate the source configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            SourceConfig::Docker { socket: Some(socket) } if socket.is_empty() => {
                Err(crate::Error::config("Docker socket path cannot be empty"))
            }
            SourceConfig::Podman { socket } if socket.is_empty() => {
                Err(crate::Error::config("Podman socket path cannot be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Get the source type name
    pub fn type_name(&self) -> &str {
        match self {
            SourceConfig::Docker { .. } => "docker",
            SourceConfig::Podman { .. } => "podman",
        }
    }
}

fn default_podman_socket() -> String {
    DEFAULT_PODMAN_SOCKET.to_string()
}

/// Backend configuration
///
/// `name` overrides the routing name; it defaults to the type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Consul agent service catalog
    Consul {
        /// Agent HTTP address, e.g. `http://127.0.0.1:8500`
        address: String,
        /// ACL token
        #[serde(default)]
        token: Option<String>,
        /// Routing name override
        #[serde(default)]
        name: Option<String>,
    },

    /// etcd v3 key/value store
    Etcd {
        /// HTTP gateway endpoint, e.g. `http://127.0.0.1:2379`
        endpoint: String,
        /// Key namespace
        #[serde(default = "default_namespace")]
        namespace: String,
        /// Routing name override
        #[serde(default)]
        name: Option<String>,
    },

    /// AdGuardHome DNS rewrites
    #[serde(rename = "adguardhome")]
    AdGuardHome {
        /// Web API address, e.g. `http://127.0.0.1:3000`
        address: String,
        /// Basic auth credentials, `user:password`
        #[serde(default)]
        auth: Option<String>,
        /// Suffix appended to service names to form domains
        domain_suffix: String,
        /// Routing name override
        #[serde(default)]
        name: Option<String>,
    },

    /// Logs every operation, touches nothing
    Debug {
        /// Routing name override
        #[serde(default)]
        name: Option<String>,
    },
}

impl BackendConfig {
    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            BackendConfig::Consul { address, .. } => {
                if address.is_empty() {
                    return Err(crate::Error::config("Consul address cannot be empty"));
                }
                validate_url("Consul address", address)
            }
            BackendConfig::Etcd {
                endpoint,
                namespace,
                ..
            } => {
                if endpoint.is_empty() {
                    return Err(crate::Error::config("etcd endpoint cannot be empty"));
                }
                if namespace.is_empty() || namespace.contains('/') {
                    return Err(crate::Error::config(format!(
                        "Invalid etcd namespace '{}'",
                        namespace
                    )));
                }
                validate_url("etcd endpoint", endpoint)
            }
            BackendConfig::AdGuardHome {
                address,
                auth,
                domain_suffix,
                ..
            } => {
                if address.is_empty() {
                    return Err(crate::Error::config("AdGuardHome address cannot be empty"));
                }
                if let Some(auth) = auth {
                    if !auth.contains(':') {
                        return Err(crate::Error::config(
                            "AdGuardHome auth must be 'user:password'",
                        ));
                    }
                }
                if domain_suffix.is_empty() {
                    return Err(crate::Error::config(
                        "AdGuardHome domain suffix cannot be empty",
                    ));
                }
                validate_url("AdGuardHome address", address)
            }
            BackendConfig::Debug { .. } => Ok(()),
        }
    }

    /// Get the backend type name
    pub fn type_name(&self) -> &str {
        match self {
            BackendConfig::Consul { .. } => "consul",
            BackendConfig::Etcd { .. } => "etcd",
            BackendConfig::AdGuardHome { .. } => "adguardhome",
            BackendConfig::Debug { .. } => "debug",
        }
    }

    /// Routing name: the override if set, the type name otherwise
    pub fn name(&self) -> &str {
        let name = match self {
            BackendConfig::Consul { name, .. }
            | BackendConfig::Etcd { name, .. }
            | BackendConfig::AdGuardHome { name, .. }
            | BackendConfig::Debug { name } => name.as_deref(),
        };
        name.unwrap_or_else(|| self.type_name())
    }
}

/// Endpoints must be absolute http(s) URLs with a host
fn validate_url(what: &str, url: &str) -> Result<(), crate::Error> {
    let host = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));

    match host {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(crate::Error::config(format!(
            "{} must be an http:// or https:// URL. Got: {}",
            what, url
        ))),
    }
}
