//! Event multiplexer
//!
//! Fans N event sources out to M named backend channels. Every input runs on
//! its own dispatch loop; an event is delivered to every output whose name
//! the event's routing label accepts.
//!
//! ```text
//!   docker ──┐                      ┌──► consul   (bounded mpsc)
//!            ├──► dispatch loops ───┼──► etcd     (bounded mpsc)
//!   podman ──┘     (routing label)  └──► debug    (bounded mpsc)
//! ```
//!
//! ## Ordering and back-pressure
//!
//! Events from one input reach a given output in input order. A full output
//! blocks that input's dispatch loop (and so that input's delivery to every
//! other output) until the backend catches up or shutdown fires. Nothing is
//! dropped silently.
//!
//! ## Outputs
//!
//! Outputs may be added at any time, before or after [`EventMultiplexer::run`].
//! The output table is the only shared mutable state; dispatch loops take a
//! snapshot of the matching senders under a read lock and send outside it.
//! An output whose receiver was dropped is removed on the next send to it.

use crate::labels::Routing;
use crate::traits::EventStream;
use crate::types::ContainerEvent;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct OutputTable {
    senders: HashMap<String, mpsc::Sender<ContainerEvent>>,
    closed: bool,
}

/// Shared, synchronized set of named outputs
#[derive(Clone)]
struct Outputs {
    table: Arc<RwLock<OutputTable>>,
    buffer: usize,
}

impl Outputs {
    fn new(buffer: usize) -> Self {
        Self {
            table: Arc::new(RwLock::new(OutputTable::default())),
            buffer: buffer.max(1),
        }
    }

    fn add(&self, name: String) -> mpsc::Receiver<ContainerEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);

        if table.closed {
            // Dropping `tx` closes `rx` right away
            debug!(backend = %name, "Output added after multiplexer stopped");
            return rx;
        }

        if table.senders.insert(name.clone(), tx).is_some() {
            warn!(backend = %name, "Replacing existing output with the same name");
        }
        rx
    }

    fn matching(&self, routing: &Routing) -> Vec<(String, mpsc::Sender<ContainerEvent>)> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .senders
            .iter()
            .filter(|(name, _)| routing.accepts(name))
            .map(|(name, tx)| (name.clone(), tx.clone()))
            .collect()
    }

    fn remove_if_same(&self, name: &str, tx: &mpsc::Sender<ContainerEvent>) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.senders.get(name).is_some_and(|current| current.same_channel(tx)) {
            table.senders.remove(name);
        }
    }

    fn names(&self) -> Vec<String> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = table.senders.keys().cloned().collect();
        names.sort();
        names
    }

    fn close(&self) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.closed = true;
        table.senders.clear();
    }
}

/// Routes container events from many sources to many named backends
pub struct EventMultiplexer {
    inputs: Vec<(String, EventStream)>,
    outputs: Outputs,
    routing_label: String,
}

impl EventMultiplexer {
    /// Create a multiplexer
    ///
    /// # Parameters
    ///
    /// - `routing_label`: Label key carrying a container's backend allow-list
    /// - `buffer`: Capacity of each output channel (at least 1)
    pub fn new(routing_label: impl Into<String>, buffer: usize) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Outputs::new(buffer),
            routing_label: routing_label.into(),
        }
    }

    /// Attach an input stream; `name` is used for logging only
    pub fn add_input(&mut self, name: impl Into<String>, input: EventStream) {
        self.inputs.push((name.into(), input));
    }

    /// Create a named output and return its receiving end
    ///
    /// Adding a name twice replaces the earlier output; its receiver then
    /// sees the channel close.
    pub fn new_output(&self, name: impl Into<String>) -> mpsc::Receiver<ContainerEvent> {
        self.outputs.add(name.into())
    }

    /// Start one dispatch loop per input
    ///
    /// Loops stop when their input ends or `shutdown` fires. Once every loop
    /// has stopped, all output senders are dropped so backends observe their
    /// channel closing.
    pub fn run(self, shutdown: CancellationToken) -> MultiplexerHandle {
        info!(
            inputs = self.inputs.len(),
            outputs = self.outputs.names().len(),
            "Starting event multiplexer"
        );

        let loops: Vec<JoinHandle<usize>> = self
            .inputs
            .into_iter()
            .map(|(source, input)| {
                tokio::spawn(dispatch(
                    source,
                    input,
                    self.outputs.clone(),
                    self.routing_label.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        let outputs = self.outputs.clone();
        let supervisor = tokio::spawn(async move {
            let mut delivered = 0;
            for handle in loops {
                match handle.await {
                    Ok(count) => delivered += count,
                    Err(e) => error!(error = %e, "Dispatch loop panicked"),
                }
            }
            outputs.close();
            info!(delivered, "Event multiplexer stopped");
            delivered
        });

        MultiplexerHandle {
            outputs: self.outputs,
            supervisor,
        }
    }
}

/// Handle to a running multiplexer
pub struct MultiplexerHandle {
    outputs: Outputs,
    supervisor: JoinHandle<usize>,
}

impl MultiplexerHandle {
    /// Create a named output on the running multiplexer
    pub fn new_output(&self, name: impl Into<String>) -> mpsc::Receiver<ContainerEvent> {
        self.outputs.add(name.into())
    }

    /// Wait for every dispatch loop to stop
    ///
    /// Returns the number of event deliveries made across all outputs.
    pub async fn join(self) -> usize {
        match self.supervisor.await {
            Ok(delivered) => delivered,
            Err(e) => {
                error!(error = %e, "Multiplexer supervisor panicked");
                self.outputs.close();
                0
            }
        }
    }
}

async fn dispatch(
    source: String,
    mut input: EventStream,
    outputs: Outputs,
    routing_label: String,
    shutdown: CancellationToken,
) -> usize {
    let mut delivered = 0;

    loop {
        let event = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(source = %source, "Dispatch loop cancelled");
                break;
            }

            next = input.next() => match next {
                Some(event) => event,
                None => {
                    info!(source = %source, "Input closed, dispatch loop exiting");
                    break;
                }
            },
        };

        let routing = Routing::from_labels(&event.container.labels, &routing_label);
        let targets = outputs.matching(&routing);

        if targets.is_empty() {
            debug!(
                source = %source,
                container = %event.container.id,
                "No output accepts event"
            );
            continue;
        }

        for (name, tx) in targets {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!(source = %source, "Dispatch loop cancelled while sending");
                    return delivered;
                }

                sent = tx.send(event.clone()) => match sent {
                    Ok(()) => delivered += 1,
                    Err(_) => {
                        warn!(backend = %name, "Output receiver dropped, removing output");
                        outputs.remove_if_same(&name, &tx);
                    }
                },
            }
        }
    }

    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContainerInfo;
    use std::time::Duration;
    use tokio::time::timeout;

    fn input(events: Vec<ContainerEvent>) -> EventStream {
        Box::pin(tokio_stream::iter(events))
    }

    fn routed(id: &str, route: Option<&str>) -> ContainerEvent {
        let mut container = ContainerInfo::new(id);
        if let Some(route) = route {
            container = container.with_label("creg.backends", route);
        }
        ContainerEvent::start(container)
    }

    async fn drain(mut rx: mpsc::Receiver<ContainerEvent>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(2), rx.recv()).await {
            ids.push(event.container.id);
        }
        ids
    }

    #[tokio::test]
    async fn broadcasts_unlabelled_events() {
        let mut mux = EventMultiplexer::new("creg.backends", 4);
        let a = mux.new_output("a");
        let b = mux.new_output("b");
        mux.add_input("test", input(vec![routed("c1", None)]));

        let handle = mux.run(CancellationToken::new());
        assert_eq!(handle.join().await, 2);

        assert_eq!(drain(a).await, vec!["c1"]);
        assert_eq!(drain(b).await, vec!["c1"]);
    }

    #[tokio::test]
    async fn allow_list_selects_outputs() {
        let mut mux = EventMultiplexer::new("creg.backends", 4);
        let a = mux.new_output("a");
        let b = mux.new_output("b");
        mux.add_input(
            "test",
            input(vec![
                routed("only-b", Some("b")),
                routed("everyone", Some("all")),
                routed("nobody", Some("doesnotexist")),
            ]),
        );

        mux.run(CancellationToken::new()).join().await;

        assert_eq!(drain(a).await, vec!["everyone"]);
        assert_eq!(drain(b).await, vec!["only-b", "everyone"]);
    }

    #[tokio::test]
    async fn dropped_output_does_not_block_others() {
        let mut mux = EventMultiplexer::new("creg.backends", 1);
        let gone = mux.new_output("gone");
        let live = mux.new_output("live");
        drop(gone);

        mux.add_input("test", input(vec![routed("c1", None)]));
        let handle = mux.run(CancellationToken::new());
        assert_eq!(handle.join().await, 1);

        assert_eq!(drain(live).await, vec!["c1"]);
    }

    #[tokio::test]
    async fn cancellation_unblocks_full_output() {
        let mut mux = EventMultiplexer::new("creg.backends", 1);
        let _stalled = mux.new_output("stalled");
        mux.add_input(
            "test",
            Box::pin(tokio_stream::iter(vec![routed("c1", None), routed("c2", None)]).chain(
                tokio_stream::pending(),
            )),
        );

        let shutdown = CancellationToken::new();
        let handle = mux.run(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let delivered = timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("multiplexer did not stop after cancellation");
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn outputs_close_when_inputs_end() {
        let mux = EventMultiplexer::new("creg.backends", 4);
        let mut rx = mux.new_output("a");

        mux.run(CancellationToken::new()).join().await;

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn output_added_while_running_receives_events() {
        let mut mux = EventMultiplexer::new("creg.backends", 4);
        let (tx, rx) = mpsc::channel(4);
        mux.add_input(
            "test",
            Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)),
        );

        let handle = mux.run(CancellationToken::new());
        let late = handle.new_output("late");

        tx.send(routed("c1", None)).await.unwrap();
        drop(tx);

        assert_eq!(handle.join().await, 1);
        assert_eq!(drain(late).await, vec!["c1"]);
    }
}
