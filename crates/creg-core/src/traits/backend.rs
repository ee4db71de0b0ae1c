// # Backend Trait
//
// One backend per configured registry. The multiplexer hands each backend its
// own bounded channel; the backend consumes it on its own task.
//
// ## Lifecycle
//
// ```text
//   Purge (optional) ──► Refresh (optional) ──► EventLoop ──► Stopped
//        │ error              │ error               │
//        └──────► Failed ◄────┘                     └── shutdown / channel closed
// ```
//
// Purge or refresh failures are fatal for that backend only. Failures while
// handling a single event are logged and the loop continues.
//
// Every operation receives the shutdown token. A registry call already in
// flight is allowed to finish, but no new call starts once it has fired.

use crate::types::{ContainerEvent, ContainerInfo};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a backend does before entering its event loop
#[derive(Debug, Clone, Default)]
pub struct StartupPlan {
    /// Remove every registration this instance owns first
    pub purge: bool,
    /// Snapshot to register before live events are processed
    pub refresh: Vec<ContainerInfo>,
}

impl StartupPlan {
    /// Neither purge nor refresh
    pub fn none() -> Self {
        Self::default()
    }

    /// Build a plan from a snapshot, keeping only containers routed to `backend`
    ///
    /// `routing_label` is the label key carrying the backend allow-list.
    pub fn routed(
        purge: bool,
        snapshot: &[ContainerInfo],
        routing_label: &str,
        backend: &str,
    ) -> Self {
        let refresh = snapshot
            .iter()
            .filter(|c| crate::labels::Routing::from_labels(&c.labels, routing_label).accepts(backend))
            .cloned()
            .collect();
        Self { purge, refresh }
    }
}

/// Counters reported when a backend stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Events taken off the channel and handled
    pub events_handled: usize,
}

/// Trait for registry backends
///
/// Implementors provide the three lifecycle operations; [`Backend::run`]
/// sequences them and is rarely overridden.
///
/// # Concurrency
///
/// A backend processes its events strictly in order, one at a time. Events
/// for different backends proceed independently.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Routing name, matched against the routing label
    fn name(&self) -> &str;

    /// Remove every registration owned by this instance
    ///
    /// Stops early, without error, once `shutdown` fires.
    async fn purge(&self, shutdown: &CancellationToken) -> Result<(), crate::Error>;

    /// Register services for a snapshot of running containers
    ///
    /// Individual failures are logged. An error is returned only when the
    /// refresh could not register anything at all. A refresh cut short by
    /// `shutdown` is not an error.
    async fn refresh(
        &self,
        containers: &[ContainerInfo],
        shutdown: &CancellationToken,
    ) -> Result<(), crate::Error>;

    /// Apply a single event; failures are logged, never returned
    async fn handle_event(&self, event: &ContainerEvent, shutdown: &CancellationToken);

    /// Run the backend until `shutdown` fires or `events` closes
    ///
    /// # Returns
    ///
    /// - `Ok(RunSummary)`: Clean stop
    /// - `Err(Error)`: Purge or refresh failed; no events were consumed
    async fn run(
        &self,
        mut events: mpsc::Receiver<ContainerEvent>,
        startup: StartupPlan,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, crate::Error> {
        let name = self.name().to_string();

        if startup.purge {
            info!(backend = %name, "Purging registrations");
            self.purge(&shutdown).await?;
        }

        if !startup.refresh.is_empty() && !shutdown.is_cancelled() {
            info!(backend = %name, containers = startup.refresh.len(), "Refreshing registrations");
            self.refresh(&startup.refresh, &shutdown).await?;
        }

        info!(backend = %name, "Entering event loop");

        let mut summary = RunSummary::default();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(backend = %name, "Shutdown requested, leaving event loop");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => {
                        debug!(
                            backend = %name,
                            container = %event.container.id,
                            action = %event.action,
                            "Handling event"
                        );
                        self.handle_event(&event, &shutdown).await;
                        summary.events_handled += 1;
                    }
                    None => {
                        info!(backend = %name, "Event channel closed, leaving event loop");
                        break;
                    }
                },
            }
        }

        info!(backend = %name, events = summary.events_handled, "Backend stopped");
        Ok(summary)
    }
}

/// Helper trait for constructing backends from configuration
pub trait BackendFactory: Send + Sync {
    /// Create a Backend instance
    ///
    /// # Parameters
    ///
    /// - `config`: Configuration specific to this backend
    /// - `global`: Daemon-wide settings (instance id, forward address, tags, labels)
    fn create(
        &self,
        config: &crate::config::BackendConfig,
        global: &crate::config::CregConfig,
    ) -> Result<Box<dyn Backend>, crate::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routed_plan_filters_by_allow_list() {
        let snapshot = vec![
            ContainerInfo::new("a"),
            ContainerInfo::new("b").with_label("creg.backends", "etcd"),
            ContainerInfo::new("c").with_label("creg.backends", "consul, etcd"),
        ];

        let plan = StartupPlan::routed(true, &snapshot, "creg.backends", "consul");

        assert!(plan.purge);
        let ids: Vec<_> = plan.refresh.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
