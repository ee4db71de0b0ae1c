//! Logging-only backend
//!
//! Useful to see what creg would register without touching a registry.

use crate::error::Result;
use crate::labels::{LabelSchema, extract_ports, map_services};
use crate::traits::Backend;
use crate::types::{ContainerEvent, ContainerInfo};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Backend that logs every lifecycle call and event
pub struct DebugBackend {
    name: String,
    labels: LabelSchema,
}

impl DebugBackend {
    /// Create a debug backend routed as `name`
    pub fn new(name: impl Into<String>, labels: LabelSchema) -> Self {
        Self {
            name: name.into(),
            labels,
        }
    }
}

#[async_trait]
impl Backend for DebugBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purge(&self, _shutdown: &CancellationToken) -> Result<()> {
        info!(backend = %self.name, "Purge requested");
        Ok(())
    }

    async fn refresh(&self, containers: &[ContainerInfo], _shutdown: &CancellationToken) -> Result<()> {
        for container in containers {
            info!(backend = %self.name, container = %container.id, "Refresh");
        }
        Ok(())
    }

    async fn handle_event(&self, event: &ContainerEvent, _shutdown: &CancellationToken) {
        let ports = extract_ports(&event.container.labels, &self.labels.port_prefix);
        let services = map_services(&ports, &event.container.labels, &[], &[]);
        let names: Vec<&str> = services.values().map(|s| s.name.as_str()).collect();

        info!(
            backend = %self.name,
            container = %event.container.id,
            action = %event.action,
            services = ?names,
            "Event"
        );
    }
}
