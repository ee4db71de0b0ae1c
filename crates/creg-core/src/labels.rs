//! Label mapper
//!
//! Turns a container's label set into the services to register, decides
//! whether a container is eligible at all, and which backends its events are
//! routed to. Everything here is pure: no I/O, no shared state.
//!
//! ## Recognized labels
//!
//! | label | default key | meaning |
//! |-------|-------------|---------|
//! | enable | `creg` | must be `"true"` for the container to be tracked |
//! | port prefix | `creg.port` | `<port/proto>:<service>` pairs, comma-separated |
//! | routing | `creg.backends` | backend names or `all`, comma-separated |
//! | instance | `creg.id` | must match the running instance id when present |
//! | dns | `creg.dns` | `<domain>,<answer>` rewrites, `;`-separated |
//!
//! Labels outside this schema are ignored, never rejected.

use crate::types::{Port, PortBinding, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Sentinel routing entry that accepts every backend
pub const ROUTE_ALL: &str = "all";

/// Label keys recognized by creg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSchema {
    /// Eligibility label; empty disables eligibility filtering
    #[serde(default = "default_enable_label")]
    pub enable: String,

    /// Prefix of port-mapping labels
    #[serde(default = "default_port_prefix")]
    pub port_prefix: String,

    /// Routing label
    #[serde(default = "default_backends_label")]
    pub backends: String,

    /// Instance-scoping label
    #[serde(default = "default_instance_label")]
    pub instance: String,

    /// Explicit DNS rewrite label
    #[serde(default = "default_dns_label")]
    pub dns: String,
}

impl Default for LabelSchema {
    fn default() -> Self {
        Self {
            enable: default_enable_label(),
            port_prefix: default_port_prefix(),
            backends: default_backends_label(),
            instance: default_instance_label(),
            dns: default_dns_label(),
        }
    }
}

fn default_enable_label() -> String {
    "creg".to_string()
}

fn default_port_prefix() -> String {
    "creg.port".to_string()
}

fn default_backends_label() -> String {
    "creg.backends".to_string()
}

fn default_instance_label() -> String {
    "creg.id".to_string()
}

fn default_dns_label() -> String {
    "creg.dns".to_string()
}

/// Appends tags for one service, given the container's labels and the
/// service name. Filters must only append.
pub type TagFilter = fn(&mut Vec<String>, &HashMap<String, String>, &str);

/// Collect `port -> service` pairs from every label whose key starts with
/// `prefix`.
///
/// Quote characters are stripped. A pair without exactly one `:` is skipped
/// with a warning.
pub fn extract_ports(labels: &HashMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    let mut ports = BTreeMap::new();

    let mut keys: Vec<&String> = labels.keys().filter(|k| k.starts_with(prefix)).collect();
    keys.sort();

    for key in keys {
        let value: String = labels[key.as_str()]
            .chars()
            .filter(|c| *c != '\'' && *c != '"')
            .collect();

        for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parts: Vec<&str> = pair.split(':').collect();
            if parts.len() != 2 {
                warn!(label = %key, pair = %pair, "Ignoring malformed port mapping");
                continue;
            }

            ports.insert(parts[0].trim().to_string(), parts[1].trim().to_string());
        }
    }

    ports
}

/// Resolve every extracted port into a [`ServiceSpec`].
///
/// Each service starts from its own copy of `static_tags`; filters run in
/// order and can only append to that copy.
pub fn map_services(
    ports: &BTreeMap<String, String>,
    container_labels: &HashMap<String, String>,
    static_tags: &[String],
    filters: &[TagFilter],
) -> BTreeMap<String, ServiceSpec> {
    let mut services = BTreeMap::new();

    for (port, service) in ports {
        let mut tags = static_tags.to_vec();

        for filter in filters {
            filter(&mut tags, container_labels, service);
        }

        services.insert(
            port.clone(),
            ServiceSpec {
                name: service.clone(),
                tags,
            },
        );
    }

    services
}

/// Forward reverse-proxy labels to the registry's tag system.
///
/// Copies every container label whose key contains `.<service>` or
/// `traefik.` as `key=value`, in key order.
pub fn proxy_label_filter(tags: &mut Vec<String>, labels: &HashMap<String, String>, service: &str) {
    let needle = format!(".{}", service);

    let mut matching: Vec<(&String, &String)> = labels
        .iter()
        .filter(|(k, _)| k.contains(&needle) || k.contains("traefik."))
        .collect();
    matching.sort();

    tags.extend(matching.into_iter().map(|(k, v)| format!("{}={}", k, v)));
}

/// Replace container port tokens with their published host port.
///
/// Tokens without a binding, or that do not parse, are kept as-is.
pub fn resolve_host_ports(
    ports: BTreeMap<String, String>,
    bindings: &HashMap<Port, Vec<PortBinding>>,
) -> BTreeMap<String, String> {
    ports
        .into_iter()
        .map(|(token, service)| {
            let published = Port::parse(&token).ok().and_then(|port| {
                bindings
                    .get(&port)
                    .and_then(|b| b.first())
                    .filter(|b| !b.host_port.is_empty())
                    .map(|b| format!("{}/{}", b.host_port, port.proto()))
            });

            (published.unwrap_or(token), service)
        })
        .collect()
}

/// An explicit DNS rewrite requested through the dns label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRewrite {
    /// Domain to answer for
    pub domain: String,
    /// Answer (IP or CNAME target)
    pub answer: String,
}

/// Parse `<domain>,<answer>[;<domain>,<answer>...]` from the dns label
pub fn extract_dns_rewrites(labels: &HashMap<String, String>, key: &str) -> Vec<DnsRewrite> {
    let Some(value) = labels.get(key) else {
        return Vec::new();
    };

    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once(',') {
            Some((domain, answer)) if !domain.trim().is_empty() && !answer.trim().is_empty() => {
                Some(DnsRewrite {
                    domain: domain.trim().to_string(),
                    answer: answer.trim().to_string(),
                })
            }
            _ => {
                warn!(label = %key, entry = %entry, "Ignoring malformed dns rewrite");
                None
            }
        })
        .collect()
}

/// Decides whether a container is tracked by this instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    /// Label that must equal `"true"`; empty tracks every container
    pub enable_label: String,
    /// Label that, when present, must equal `instance_id`
    pub instance_label: String,
    /// This instance's id
    pub instance_id: String,
}

impl Eligibility {
    /// Build eligibility rules from the label schema
    pub fn new(schema: &LabelSchema, instance_id: impl Into<String>) -> Self {
        Self {
            enable_label: schema.enable.clone(),
            instance_label: schema.instance.clone(),
            instance_id: instance_id.into(),
        }
    }

    /// Whether a container with these labels should be tracked
    pub fn is_eligible(&self, labels: &HashMap<String, String>) -> bool {
        if self.enable_label.is_empty() {
            return true;
        }

        if labels.get(&self.enable_label).map(String::as_str) != Some("true") {
            return false;
        }

        match labels.get(&self.instance_label) {
            Some(id) => *id == self.instance_id,
            None => true,
        }
    }
}

/// Which backends receive a container's events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// No routing label: every backend
    Broadcast,
    /// Routing label present: only the listed backends (or `all`)
    AllowList(Vec<String>),
}

impl Routing {
    /// Read the routing label
    pub fn from_labels(labels: &HashMap<String, String>, key: &str) -> Self {
        match labels.get(key) {
            None => Self::Broadcast,
            Some(value) => Self::AllowList(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        }
    }

    /// Whether the backend registered as `name` receives the event
    pub fn accepts(&self, name: &str) -> bool {
        match self {
            Self::Broadcast => true,
            Self::AllowList(names) => names.iter().any(|n| n == name || n == ROUTE_ALL),
        }
    }
}
