//! Environment configuration
//!
//! Builds a [`CregConfig`] from `CREG_*` variables, or from the JSON file
//! named by `CREG_CONFIG_FILE`. Parsing goes through a lookup function so it
//! can be exercised without touching the process environment.

use anyhow::{Context, Result};
use creg_core::config::{BackendConfig, CregConfig, DEFAULT_NAMESPACE, DEFAULT_PODMAN_SOCKET, SourceConfig};
use tracing::Level;

/// Everything the daemon needs to start
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub creg: CregConfig,
    pub log_level: String,
}

impl DaemonConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("CREG_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let creg = match lookup("CREG_CONFIG_FILE").filter(|p| !p.is_empty()) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read CREG_CONFIG_FILE {}", path))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse CREG_CONFIG_FILE {}", path))?
            }
            None => creg_from_lookup(&lookup)?,
        };

        Ok(Self { creg, log_level })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.creg.validate()?;

        if parse_level(&self.log_level).is_none() {
            anyhow::bail!(
                "CREG_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            );
        }

        Ok(())
    }

    /// Tracing level; info when unset or invalid
    pub fn level(&self) -> Level {
        parse_level(&self.log_level).unwrap_or(Level::INFO)
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

fn list(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("{} must be a boolean (true/false). Got: {}", key, other),
        },
    }
}

fn number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a number. Got: {}", key, value)),
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str, needed_by: &str) -> Result<String> {
    match lookup(key).filter(|v| !v.is_empty()) {
        Some(value) => Ok(value),
        None => anyhow::bail!(
            "{} is required when {} is enabled. Set it via: export {}=...",
            key,
            needed_by,
            key
        ),
    }
}

fn creg_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<CregConfig> {
    let instance_id = lookup("CREG_ID")
        .or_else(|| lookup("HOSTNAME"))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "creg".to_string());

    let forward_address = lookup("CREG_ADDRESS").unwrap_or_default();
    if forward_address.is_empty() {
        anyhow::bail!(
            "CREG_ADDRESS is required. \
            Set it via: export CREG_ADDRESS=10.0.0.5"
        );
    }

    let mut config = CregConfig::new(instance_id, forward_address);
    config.static_tags = list(lookup("CREG_TAGS"));
    if let Some(namespace) = lookup("CREG_NAMESPACE").filter(|n| !n.is_empty()) {
        config.namespace = namespace;
    }

    if let Some(label) = lookup("CREG_ENABLE_LABEL") {
        config.labels.enable = label.trim().to_string();
    }

    let engine = &mut config.engine;
    engine.purge_on_start = flag(lookup, "CREG_PURGE_ON_START", engine.purge_on_start)?;
    engine.refresh_on_start = flag(lookup, "CREG_REFRESH_ON_START", engine.refresh_on_start)?;
    engine.use_host_ports = flag(lookup, "CREG_USE_HOST_PORTS", engine.use_host_ports)?;
    engine.call_timeout_secs = number(lookup, "CREG_CALL_TIMEOUT_SECS", engine.call_timeout_secs)?;
    engine.output_buffer = number(lookup, "CREG_OUTPUT_BUFFER", engine.output_buffer)?;
    engine.shutdown_timeout_secs =
        number(lookup, "CREG_SHUTDOWN_TIMEOUT_SECS", engine.shutdown_timeout_secs)?;

    let mut sources = list(lookup("CREG_SOURCES"));
    if sources.is_empty() {
        sources.push("docker".to_string());
    }
    for source in sources {
        config.sources.push(match source.as_str() {
            "docker" => SourceConfig::Docker {
                socket: lookup("CREG_DOCKER_SOCKET").filter(|s| !s.is_empty()),
            },
            "podman" => SourceConfig::Podman {
                socket: lookup("CREG_PODMAN_SOCKET")
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_PODMAN_SOCKET.to_string()),
            },
            other => anyhow::bail!(
                "CREG_SOURCES entry '{}' is not supported. \
                Supported sources: docker, podman",
                other
            ),
        });
    }

    let backends = list(lookup("CREG_BACKENDS"));
    if backends.is_empty() {
        anyhow::bail!(
            "CREG_BACKENDS must name at least one backend. \
            Set it via: export CREG_BACKENDS=consul,etcd"
        );
    }
    for backend in backends {
        config.backends.push(match backend.as_str() {
            "consul" => BackendConfig::Consul {
                address: required(lookup, "CREG_CONSUL_ADDRESS", "consul")?,
                token: lookup("CREG_CONSUL_TOKEN").filter(|t| !t.is_empty()),
                name: None,
            },
            "etcd" => BackendConfig::Etcd {
                endpoint: required(lookup, "CREG_ETCD_ENDPOINT", "etcd")?,
                namespace: lookup("CREG_ETCD_NAMESPACE")
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                name: None,
            },
            "adguardhome" => BackendConfig::AdGuardHome {
                address: required(lookup, "CREG_ADGUARD_ADDRESS", "adguardhome")?,
                auth: lookup("CREG_ADGUARD_AUTH").filter(|a| !a.is_empty()),
                domain_suffix: required(lookup, "CREG_ADGUARD_DOMAIN_SUFFIX", "adguardhome")?,
                name: None,
            },
            "debug" => BackendConfig::Debug { name: None },
            other => anyhow::bail!(
                "CREG_BACKENDS entry '{}' is not supported. \
                Supported backends: consul, etcd, adguardhome, debug",
                other
            ),
        });
    }

    Ok(config)
}
