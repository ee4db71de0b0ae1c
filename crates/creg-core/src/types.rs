//! Data model shared by event sources, the multiplexer and backends
//!
//! Events and container snapshots are created by an event source per runtime
//! notification and are never mutated afterwards. Nothing here is retained:
//! the registry is the only durable state.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle action reported by a container runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerAction {
    /// Container started
    Start,
    /// Container stopped
    Stop,
    /// Container killed
    Kill,
    /// Any other runtime action, carried verbatim
    Other(String),
}

impl ContainerAction {
    /// Parse a runtime action string
    pub fn parse(action: &str) -> Self {
        match action {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "kill" => Self::Kill,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the action ends a container's registrations
    pub fn is_teardown(&self) -> bool {
        matches!(self, Self::Stop | Self::Kill)
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
            Self::Kill => f.write_str("kill"),
            Self::Other(action) => f.write_str(action),
        }
    }
}

/// A container port token, `"<number>/<proto>"`
///
/// The protocol defaults to `tcp` when absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    number: u16,
    proto: String,
}

impl Port {
    /// Create a port from its parts
    pub fn new(number: u16, proto: impl Into<String>) -> Self {
        Self {
            number,
            proto: proto.into(),
        }
    }

    /// Parse a port token such as `80/tcp`, `53/udp` or `8080`
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        let (number, proto) = match token.split_once('/') {
            Some((number, proto)) => (number, proto),
            None => (token, ""),
        };

        if number.is_empty() {
            return Err(Error::label(format!("empty port number in '{}'", token)));
        }

        let number = number
            .parse::<u16>()
            .map_err(|e| Error::label(format!("invalid port number in '{}': {}", token, e)))?;

        let proto = if proto.is_empty() { "tcp" } else { proto };

        Ok(Self::new(number, proto))
    }

    /// Port number
    pub fn number(&self) -> u16 {
        self.number
    }

    /// Protocol (`tcp`, `udp`, ...)
    pub fn proto(&self) -> &str {
        &self.proto
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.proto)
    }
}

impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Runtime-assigned external binding for a container port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBinding {
    /// Host IP the port is bound on
    pub host_ip: String,
    /// Host port number, as reported by the runtime
    pub host_port: String,
}

impl PortBinding {
    /// Create a new binding
    pub fn new(host_ip: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            host_port: host_port.into(),
        }
    }
}

/// Snapshot of a container as seen by an event source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Runtime-assigned id, stable for the container's lifetime
    pub id: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Published port bindings keyed by container port
    pub ports: HashMap<Port, Vec<PortBinding>>,
}

impl ContainerInfo {
    /// Create an empty container snapshot
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a port binding
    pub fn with_binding(mut self, port: Port, binding: PortBinding) -> Self {
        self.ports.entry(port).or_default().push(binding);
        self
    }

    /// Label value, if present
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A container lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    /// What happened
    pub action: ContainerAction,
    /// The container it happened to
    pub container: ContainerInfo,
}

impl ContainerEvent {
    /// Create a new event
    pub fn new(action: ContainerAction, container: ContainerInfo) -> Self {
        Self { action, container }
    }

    /// Shorthand for a `start` event
    pub fn start(container: ContainerInfo) -> Self {
        Self::new(ContainerAction::Start, container)
    }

    /// Shorthand for a `stop` event
    pub fn stop(container: ContainerInfo) -> Self {
        Self::new(ContainerAction::Stop, container)
    }
}

/// A resolved unit to register: one service name plus its tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service name
    pub name: String,
    /// Ordered `key=value` tags
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_to_tcp() {
        assert_eq!(Port::parse("8080").unwrap(), Port::new(8080, "tcp"));
        assert_eq!(Port::parse("8080/").unwrap(), Port::new(8080, "tcp"));
        assert_eq!(Port::parse("53/udp").unwrap().proto(), "udp");
    }

    #[test]
    fn port_rejects_garbage() {
        assert!(Port::parse("").is_err());
        assert!(Port::parse("/tcp").is_err());
        assert!(Port::parse("http/tcp").is_err());
        assert!(Port::parse("70000/tcp").is_err());
    }

    #[test]
    fn port_displays_as_token() {
        assert_eq!(Port::new(443, "tcp").to_string(), "443/tcp");
    }

    #[test]
    fn action_round_trips_through_strings() {
        assert_eq!(ContainerAction::parse("kill"), ContainerAction::Kill);
        assert_eq!(
            ContainerAction::parse("die"),
            ContainerAction::Other("die".to_string())
        );
        assert_eq!(ContainerAction::Stop.to_string(), "stop");
        assert!(ContainerAction::Kill.is_teardown());
        assert!(!ContainerAction::Start.is_teardown());
    }
}
