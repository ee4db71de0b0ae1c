// # Docker / Podman Event Source
//
// Container runtime event source built on the Docker Engine API. Podman
// exposes the same API on its own socket, so both runtimes share this
// implementation and differ only in how they connect.
//
// ## Stream behavior
//
// 1. Subscribe to `start`, `stop` and `kill` container events
// 2. Emit a synthetic `start` for every running, eligible container
// 3. Forward live events, each enriched with a fresh inspect
//
// A container started between steps 1 and 2 may be reported twice. That is
// harmless: registration is an upsert.
//
// The stream ends on shutdown or when the runtime connection breaks. It does
// not reconnect; other sources keep running.
//
// ## API Reference
//
// - List containers: GET `/containers/json?filters={"status":["running"]}`
// - Inspect: GET `/containers/:id/json`
// - Events: GET `/events?filters={"type":["container"],"event":[...]}`

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, PortMap};
use bollard::system::EventsOptions;
use creg_core::config::SourceConfig;
use creg_core::labels::Eligibility;
use creg_core::traits::{EventSource, EventSourceFactory, EventStream};
use creg_core::{ContainerAction, ContainerEvent, ContainerInfo, Error, Port, PortBinding, Result};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Seconds bollard waits for a response before failing a request
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Events buffered between the runtime and the multiplexer
const EVENT_BUFFER: usize = 64;

/// Runtime actions this source forwards
const TRACKED_ACTIONS: [&str; 3] = ["start", "stop", "kill"];

/// Event source for a Docker-API-compatible runtime
pub struct RuntimeSource {
    name: String,
    docker: Docker,
    eligibility: Eligibility,
}

impl std::fmt::Debug for RuntimeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSource")
            .field("name", &self.name)
            .field("eligibility", &self.eligibility)
            .finish()
    }
}

impl RuntimeSource {
    /// Connect using the client's local defaults (`DOCKER_HOST` or the default socket)
    pub fn connect_local(name: impl Into<String>, eligibility: Eligibility) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::source(format!("failed to connect to docker: {}", e)))?;

        Ok(Self {
            name: name.into(),
            docker,
            eligibility,
        })
    }

    /// Connect to a runtime listening on a unix socket
    pub fn connect_socket(
        name: impl Into<String>,
        socket: &str,
        eligibility: Eligibility,
    ) -> Result<Self> {
        let name = name.into();
        let docker = Docker::connect_with_unix(socket, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            .map_err(|e| Error::source(format!("failed to connect to {} at {}: {}", name, socket, e)))?;

        Ok(Self {
            name,
            docker,
            eligibility,
        })
    }

    async fn inspect(docker: &Docker, id: &str) -> Result<ContainerInfo> {
        let detail = docker
            .inspect_container(id, None)
            .await
            .map_err(|e| Error::source(format!("failed to inspect container {}: {}", id, e)))?;

        Ok(container_from_inspect(&detail))
    }

    async fn running_containers(
        name: &str,
        docker: &Docker,
        eligibility: &Eligibility,
    ) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            filters: HashMap::from([("status".to_string(), vec!["running".to_string()])]),
            ..Default::default()
        };

        let summaries = docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::source(format!("failed to list containers: {}", e)))?;

        let mut containers = Vec::new();
        for summary in summaries {
            let Some(id) = summary.id else { continue };

            // Cheap pre-filter on the list labels before paying for an inspect
            if let Some(labels) = &summary.labels {
                if !eligibility.is_eligible(labels) {
                    continue;
                }
            }

            match Self::inspect(docker, &id).await {
                Ok(container) if eligibility.is_eligible(&container.labels) => {
                    containers.push(container)
                }
                Ok(_) => {}
                Err(e) => warn!(source = %name, container = %id, error = %e, "Skipping container"),
            }
        }

        debug!(source = %name, count = containers.len(), "Listed running containers");
        Ok(containers)
    }
}

#[async_trait]
impl EventSource for RuntimeSource {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn running(&self) -> Result<Vec<ContainerInfo>> {
        Self::running_containers(&self.name, &self.docker, &self.eligibility).await
    }

    fn events(&self, shutdown: CancellationToken) -> EventStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(follow(
            self.name.clone(),
            self.docker.clone(),
            self.eligibility.clone(),
            tx,
            shutdown,
        ));

        Box::pin(ReceiverStream::new(rx))
    }
}

/// Send `event`, giving up on shutdown or when the consumer is gone
async fn emit(
    tx: &mpsc::Sender<ContainerEvent>,
    event: ContainerEvent,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

async fn follow(
    name: String,
    docker: Docker,
    eligibility: Eligibility,
    tx: mpsc::Sender<ContainerEvent>,
    shutdown: CancellationToken,
) {
    let options = EventsOptions::<String> {
        filters: HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            (
                "event".to_string(),
                TRACKED_ACTIONS.iter().map(|a| a.to_string()).collect(),
            ),
        ]),
        ..Default::default()
    };
    let mut stream = docker.events(Some(options));

    match RuntimeSource::running_containers(&name, &docker, &eligibility).await {
        Ok(running) => {
            info!(source = %name, count = running.len(), "Emitting running containers");
            for container in running {
                if !emit(&tx, ContainerEvent::start(container), &shutdown).await {
                    return;
                }
            }
        }
        Err(e) => error!(source = %name, error = %e, "Failed to list running containers"),
    }

    info!(source = %name, "Listening for container events");

    loop {
        let message = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(source = %name, "Event source cancelled");
                return;
            }

            message = stream.next() => message,
        };

        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                error!(source = %name, error = %e, "Container event stream failed");
                return;
            }
            None => {
                warn!(source = %name, "Container event stream ended");
                return;
            }
        };

        let action = ContainerAction::parse(message.action.as_deref().unwrap_or_default());
        let Some(actor) = message.actor else { continue };
        let Some(id) = actor.id else { continue };

        let container = match RuntimeSource::inspect(&docker, &id).await {
            Ok(container) => container,
            // A killed container can be gone before we inspect it; its event
            // attributes still carry the labels.
            Err(e) if action.is_teardown() => {
                debug!(source = %name, container = %id, error = %e, "Using event attributes");
                container_from_attributes(&id, actor.attributes.unwrap_or_default())
            }
            Err(e) => {
                warn!(source = %name, container = %id, error = %e, "Dropping event");
                continue;
            }
        };

        if !eligibility.is_eligible(&container.labels) {
            debug!(source = %name, container = %id, action = %action, "Ignoring ineligible container");
            continue;
        }

        debug!(source = %name, container = %id, action = %action, "Container event");
        if !emit(&tx, ContainerEvent::new(action, container), &shutdown).await {
            return;
        }
    }
}

/// Normalize an inspect response
pub fn container_from_inspect(detail: &ContainerInspectResponse) -> ContainerInfo {
    let labels = detail
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();

    let ports = detail
        .network_settings
        .as_ref()
        .and_then(|n| n.ports.as_ref())
        .map(convert_ports)
        .unwrap_or_default();

    ContainerInfo {
        id: detail.id.clone().unwrap_or_default(),
        labels,
        ports,
    }
}

/// Published bindings keyed by container port; unpublished ports are dropped
fn convert_ports(ports: &PortMap) -> HashMap<Port, Vec<PortBinding>> {
    ports
        .iter()
        .filter_map(|(token, bindings)| {
            let bindings: Vec<PortBinding> = bindings
                .as_ref()?
                .iter()
                .map(|b| {
                    PortBinding::new(
                        b.host_ip.clone().unwrap_or_default(),
                        b.host_port.clone().unwrap_or_default(),
                    )
                })
                .collect();

            if bindings.is_empty() {
                return None;
            }

            Port::parse(token).ok().map(|port| (port, bindings))
        })
        .collect()
}

/// Runtime keys mixed into event attributes alongside the labels
const RUNTIME_ATTRIBUTES: [&str; 4] = ["name", "image", "exitCode", "signal"];

/// Event attributes are the container labels plus a few runtime keys
fn container_from_attributes(id: &str, mut attributes: HashMap<String, String>) -> ContainerInfo {
    for key in RUNTIME_ATTRIBUTES {
        attributes.remove(key);
    }

    ContainerInfo {
        id: id.to_string(),
        labels: attributes,
        ports: HashMap::new(),
    }
}

/// Factory for Docker sources
pub struct DockerFactory;

impl EventSourceFactory for DockerFactory {
    fn create(
        &self,
        config: &SourceConfig,
        eligibility: &Eligibility,
    ) -> Result<Box<dyn EventSource>> {
        match config {
            SourceConfig::Docker { socket: Some(socket) } => Ok(Box::new(
                RuntimeSource::connect_socket("docker", socket, eligibility.clone())?,
            )),
            SourceConfig::Docker { socket: None } => Ok(Box::new(RuntimeSource::connect_local(
                "docker",
                eligibility.clone(),
            )?)),
            _ => Err(Error::config("Invalid config for docker source")),
        }
    }
}

/// Factory for Podman sources
pub struct PodmanFactory;

impl EventSourceFactory for PodmanFactory {
    fn create(
        &self,
        config: &SourceConfig,
        eligibility: &Eligibility,
    ) -> Result<Box<dyn EventSource>> {
        match config {
            SourceConfig::Podman { socket } => Ok(Box::new(RuntimeSource::connect_socket(
                "podman",
                socket,
                eligibility.clone(),
            )?)),
            _ => Err(Error::config("Invalid config for podman source")),
        }
    }
}

/// Register the docker and podman sources with a registry
pub fn register(registry: &creg_core::PluginRegistry) {
    registry.register_source("docker", Box::new(DockerFactory));
    registry.register_source("podman", Box::new(PodmanFactory));
}
