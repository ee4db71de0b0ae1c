// # Event Source Trait
//
// Defines the interface for container runtimes that feed the multiplexer.
//
// ## Implementations
//
// - Docker Engine and Podman: `creg-source-docker` crate
//
// ## Usage
//
// ```rust,ignore
// use creg_core::EventSource;
// use tokio_stream::StreamExt;
// use tokio_util::sync::CancellationToken;
//
// let source = /* EventSource implementation */;
// let shutdown = CancellationToken::new();
//
// // Snapshot used by Backend::refresh
// let running = source.running().await?;
//
// // Synthetic starts for running containers, then live events
// let mut events = source.events(shutdown.clone());
// while let Some(event) = events.next().await {
//     println!("{} {}", event.action, event.container.id);
// }
// ```

use crate::labels::Eligibility;
use crate::types::{ContainerEvent, ContainerInfo};
use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// Stream of normalized container events
pub type EventStream = Pin<Box<dyn Stream<Item = ContainerEvent> + Send + 'static>>;

/// Trait for container runtime event sources
///
/// A source only observes and normalizes. It never decides what gets
/// registered where; that belongs to the multiplexer and the backends.
///
/// # Stream contract
///
/// - Immediately after subscription, one synthetic `start` event is emitted
///   for every running eligible container.
/// - Live `start`, `stop` and `kill` events follow, in runtime order.
/// - Only eligible containers are emitted (see [`Eligibility`]).
/// - The stream ends when `shutdown` fires or the runtime connection breaks.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Source name for logging (e.g. "docker", "podman")
    fn source_name(&self) -> &str;

    /// Currently running, eligible containers
    async fn running(&self) -> Result<Vec<ContainerInfo>, crate::Error>;

    /// Subscribe to container events
    fn events(&self, shutdown: CancellationToken) -> EventStream;
}

/// Helper trait for constructing event sources from configuration
pub trait EventSourceFactory: Send + Sync {
    /// Create an EventSource instance from configuration
    ///
    /// # Parameters
    ///
    /// - `config`: Configuration specific to this source type
    /// - `eligibility`: Which containers this instance tracks
    fn create(
        &self,
        config: &crate::config::SourceConfig,
        eligibility: &Eligibility,
    ) -> Result<Box<dyn EventSource>, crate::Error>;
}
