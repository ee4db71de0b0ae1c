//! Backend lifecycle driver
//!
//! [`RegistryBackend`] implements [`Backend`] once for every registry: it
//! turns container labels into [`Registration`]s according to a [`KeyScheme`]
//! and issues them through a [`RegistryClient`], wrapping every call in a
//! deadline.
//!
//! ## Statelessness
//!
//! The driver keeps no record of what it registered. Deregistration on
//! `stop`/`kill` recomputes keys from the event's labels; keys depend only on
//! the service name and the scheme, and container labels cannot change
//! without recreating the container.

pub mod debug;

use crate::config::CregConfig;
use crate::error::{Error, Result};
use crate::labels::{
    LabelSchema, TagFilter, extract_dns_rewrites, extract_ports, map_services, proxy_label_filter,
    resolve_host_ports,
};
use crate::traits::{Backend, Registration, RegistryClient};
use crate::types::{ContainerAction, ContainerEvent, ContainerInfo, Port};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use debug::DebugBackend;

/// Metadata key holding the owning namespace
pub const META_NAMESPACE: &str = "creg-namespace";

/// Metadata key holding the owning instance id
pub const META_INSTANCE: &str = "creg-instance";

/// Per-backend settings derived from the daemon configuration
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Routing name
    pub name: String,
    /// This instance's id
    pub instance_id: String,
    /// Address advertised for every service
    pub forward_address: String,
    /// Tags appended to every registration
    pub static_tags: Vec<String>,
    /// Recognized label keys
    pub labels: LabelSchema,
    /// Namespace stamped into registration metadata
    pub namespace: String,
    /// Advertise published host ports
    pub use_host_ports: bool,
    /// Deadline for a single registry call
    pub call_timeout: Duration,
}

impl BackendSettings {
    /// Settings for the backend routed as `name`
    pub fn from_config(name: impl Into<String>, config: &CregConfig) -> Self {
        Self {
            name: name.into(),
            instance_id: config.instance_id.clone(),
            forward_address: config.forward_address.clone(),
            static_tags: config.static_tags.clone(),
            labels: config.labels.clone(),
            namespace: config.namespace.clone(),
            use_host_ports: config.engine.use_host_ports,
            call_timeout: config.engine.call_timeout(),
        }
    }
}

/// How a registry keys its records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScheme {
    /// Service catalog: `<service>-<instance id>`
    Agent,
    /// Key/value store: `<namespace>/<service>/<hostname>`
    KeyValue {
        /// Key namespace, also the purge prefix
        namespace: String,
        /// Host segment of every key
        hostname: String,
    },
    /// DNS rewrites: `<service><domain suffix>`
    Dns {
        /// Suffix appended to service names, e.g. `.home.lan`
        domain_suffix: String,
    },
}

impl KeyScheme {
    /// Identity key of `service` registered by `instance_id`
    pub fn key(&self, service: &str, instance_id: &str) -> String {
        match self {
            KeyScheme::Agent => format!("{}-{}", service, instance_id),
            KeyScheme::KeyValue {
                namespace,
                hostname,
            } => format!("{}/{}/{}", namespace, service, hostname),
            KeyScheme::Dns { domain_suffix } => format!("{}{}", service, domain_suffix),
        }
    }
}

/// Generic backend over a [`RegistryClient`]
pub struct RegistryBackend {
    client: Box<dyn RegistryClient>,
    settings: BackendSettings,
    scheme: KeyScheme,
    filters: Vec<TagFilter>,
}

impl RegistryBackend {
    /// Create a backend with the default tag filters
    pub fn new(client: Box<dyn RegistryClient>, settings: BackendSettings, scheme: KeyScheme) -> Self {
        Self {
            client,
            settings,
            scheme,
            filters: vec![proxy_label_filter as TagFilter],
        }
    }

    /// Registrations derived from a container's labels
    ///
    /// Pure: the same container always yields the same registrations, which
    /// is what lets `stop` find what `start` registered.
    pub fn plan(&self, container: &ContainerInfo) -> Vec<Registration> {
        let labels = &self.settings.labels;
        let mut ports = extract_ports(&container.labels, &labels.port_prefix);
        if self.settings.use_host_ports {
            ports = resolve_host_ports(ports, &container.ports);
        }

        let services = map_services(
            &ports,
            &container.labels,
            &self.settings.static_tags,
            &self.filters,
        );

        let mut registrations = Vec::with_capacity(services.len());
        for (token, service) in services {
            let port = match Port::parse(&token) {
                Ok(port) => port,
                Err(e) => {
                    warn!(
                        backend = %self.settings.name,
                        container = %container.id,
                        service = %service.name,
                        error = %e,
                        "Skipping service with invalid port"
                    );
                    continue;
                }
            };

            registrations.push(Registration {
                id: self.scheme.key(&service.name, &self.settings.instance_id),
                name: service.name,
                address: self.settings.forward_address.clone(),
                port: port.number(),
                tags: service.tags,
                meta: self.meta(),
            });
        }

        if let KeyScheme::Dns { .. } = self.scheme {
            for rewrite in extract_dns_rewrites(&container.labels, &labels.dns) {
                registrations.push(Registration {
                    id: rewrite.domain.clone(),
                    name: rewrite.domain,
                    address: rewrite.answer,
                    port: 0,
                    tags: Vec::new(),
                    meta: self.meta(),
                });
            }
        }

        registrations
    }

    fn meta(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (META_NAMESPACE.to_string(), self.settings.namespace.clone()),
            (META_INSTANCE.to_string(), self.settings.instance_id.clone()),
        ])
    }

    async fn call<T, F>(&self, operation: String, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(operation, self.settings.call_timeout)),
        }
    }

    async fn register(&self, container: &str, registration: &Registration) -> Result<()> {
        let result = self
            .call(
                format!("register {}", registration.id),
                self.client.register(registration),
            )
            .await;

        match &result {
            Ok(()) => info!(
                backend = %self.settings.name,
                container = %container,
                service = %registration.name,
                id = %registration.id,
                port = registration.port,
                "Registered service"
            ),
            Err(e) => warn!(
                backend = %self.settings.name,
                client = self.client.client_name(),
                container = %container,
                service = %registration.name,
                id = %registration.id,
                error = %e,
                "Failed to register service"
            ),
        }
        result
    }

    async fn deregister(&self, container: &str, id: &str) -> Result<()> {
        let result = self
            .call(format!("deregister {}", id), self.client.deregister(id))
            .await;

        match &result {
            Ok(()) => info!(
                backend = %self.settings.name,
                container = %container,
                id = %id,
                "Deregistered service"
            ),
            Err(e) => warn!(
                backend = %self.settings.name,
                client = self.client.client_name(),
                container = %container,
                id = %id,
                error = %e,
                "Failed to deregister service"
            ),
        }
        result
    }

    /// True once `shutdown` has fired; `remaining` calls are then skipped
    fn stopping(&self, shutdown: &CancellationToken, phase: &str, remaining: usize) -> bool {
        if !shutdown.is_cancelled() {
            return false;
        }
        info!(
            backend = %self.settings.name,
            phase,
            skipped = remaining,
            "Shutdown requested, starting no further registry calls"
        );
        true
    }

    fn owns(&self, id: &str, record: &crate::traits::RegistryRecord) -> bool {
        match &self.scheme {
            KeyScheme::Agent => {
                record.meta.get(META_NAMESPACE) == Some(&self.settings.namespace)
            }
            KeyScheme::KeyValue { namespace, .. } => id.starts_with(&format!("{}/", namespace)),
            KeyScheme::Dns { domain_suffix } => {
                id.ends_with(domain_suffix.as_str())
                    && record.address == self.settings.forward_address
            }
        }
    }
}

#[async_trait]
impl Backend for RegistryBackend {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn purge(&self, shutdown: &CancellationToken) -> Result<()> {
        let name = &self.settings.name;
        if self.stopping(shutdown, "purge", 0) {
            return Ok(());
        }

        if let KeyScheme::KeyValue { namespace, .. } = &self.scheme {
            let prefix = format!("{}/", namespace);
            self.call(
                format!("delete prefix {}", prefix),
                self.client.delete_by_prefix(&prefix),
            )
            .await
            .map_err(|e| Error::registry(name.clone(), format!("purge failed: {}", e)))?;
            info!(backend = %name, prefix = %prefix, "Purged registrations");
            return Ok(());
        }

        let records = self
            .call("list registrations".to_string(), self.client.list_all())
            .await
            .map_err(|e| Error::registry(name.clone(), format!("purge failed: {}", e)))?;

        let owned: Vec<String> = records
            .iter()
            .filter(|(id, record)| self.owns(id, record))
            .map(|(id, _)| id.clone())
            .collect();

        let mut purged = 0;
        let mut failed = 0;
        for (done, id) in owned.iter().enumerate() {
            if self.stopping(shutdown, "purge", owned.len() - done) {
                break;
            }
            match self.deregister("purge", id).await {
                Ok(()) => purged += 1,
                Err(_) => failed += 1,
            }
        }

        info!(
            backend = %name,
            listed = records.len(),
            purged,
            failed,
            "Purged registrations"
        );
        Ok(())
    }

    async fn refresh(&self, containers: &[ContainerInfo], shutdown: &CancellationToken) -> Result<()> {
        let registrations: Vec<(&str, Registration)> = containers
            .iter()
            .flat_map(|c| self.plan(c).into_iter().map(move |r| (c.id.as_str(), r)))
            .collect();

        let mut attempted = 0;
        let mut failed = 0;
        for (container, registration) in &registrations {
            if self.stopping(shutdown, "refresh", registrations.len() - attempted) {
                return Ok(());
            }
            attempted += 1;
            if self.register(container, registration).await.is_err() {
                failed += 1;
            }
        }

        info!(
            backend = %self.settings.name,
            containers = containers.len(),
            attempted,
            failed,
            "Refresh complete"
        );

        if attempted > 0 && failed == attempted {
            return Err(Error::registry(
                self.settings.name.clone(),
                format!("refresh failed for all {} registrations", attempted),
            ));
        }
        Ok(())
    }

    async fn handle_event(&self, event: &ContainerEvent, shutdown: &CancellationToken) {
        let container = &event.container;

        match &event.action {
            ContainerAction::Start => {
                let plan = self.plan(container);
                for (done, registration) in plan.iter().enumerate() {
                    if self.stopping(shutdown, "start", plan.len() - done) {
                        break;
                    }
                    let _ = self.register(&container.id, registration).await;
                }
            }
            ContainerAction::Stop | ContainerAction::Kill => {
                let plan = self.plan(container);
                for (done, registration) in plan.iter().enumerate() {
                    if self.stopping(shutdown, "stop", plan.len() - done) {
                        break;
                    }
                    let _ = self.deregister(&container.id, &registration.id).await;
                }
            }
            ContainerAction::Other(action) => {
                debug!(
                    backend = %self.settings.name,
                    container = %container.id,
                    action = %action,
                    "Ignoring action"
                );
            }
        }
    }
}
