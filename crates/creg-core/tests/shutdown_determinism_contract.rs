//! Contract Test: Shutdown Determinism
//!
//! Constraints verified:
//! - Backends stop on cancellation even when idle
//! - Backends stop when their channel closes
//! - Cancellation interrupts a multiplexer blocked on a full output
//! - A backend stuck in a registry call still stops within the call timeout
//! - Once cancelled, a backend lets the in-flight call finish but starts no
//!   new one, whether it is handling an event, refreshing or purging

mod common;

use common::*;
use creg_core::driver::META_NAMESPACE;
use creg_core::{
    Backend, ContainerEvent, ContainerInfo, EventMultiplexer, KeyScheme, RegistryBackend,
    RegistryRecord, StartupPlan,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn idle_backend_stops_on_cancel() {
    let client = RecordingRegistryClient::new();
    let backend = RegistryBackend::new(
        Box::new(RecordingRegistryClient::sharing_counters_with(&client)),
        settings("consul"),
        KeyScheme::Agent,
    );

    let (_tx, rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { backend.run(rx, StartupPlan::none(), shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), runner).await;
    assert!(result.is_ok(), "Backend should terminate within 5 seconds");
    assert_eq!(result.unwrap().unwrap().unwrap().events_handled, 0);
    assert_eq!(client.call_count(), 0);
}

#[tokio::test]
async fn blocked_multiplexer_stops_on_cancel() {
    let source = ControlledEventSource::new(Vec::new());
    let tx = source.sender();
    let shutdown = CancellationToken::new();

    let mut mux = EventMultiplexer::new("creg.backends", 1);
    let _never_read = mux.new_output("stalled");
    mux.add_input(
        "controlled",
        creg_core::EventSource::events(&source, shutdown.clone()),
    );
    let handle = mux.run(shutdown.clone());

    for id in ["a", "b", "c"] {
        tx.send(ContainerEvent::start(svc1(id))).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let delivered = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("multiplexer should stop within 5 seconds");
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn stuck_registry_call_bounded_by_timeout() {
    let client = RecordingRegistryClient::new();
    client.set_delay(Duration::from_secs(60));
    let backend = Arc::new(RegistryBackend::new(
        Box::new(RecordingRegistryClient::sharing_counters_with(&client)),
        settings("consul"),
        KeyScheme::Agent,
    ));

    let (tx, rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn({
        let backend = Arc::clone(&backend);
        let shutdown = shutdown.clone();
        async move { backend.run(rx, StartupPlan::none(), shutdown).await }
    });

    tx.send(ContainerEvent::start(svc1("a"))).await.unwrap();
    assert!(eventually(|| client.call_count() == 1).await);
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), runner).await;
    assert!(result.is_ok(), "Backend should stop once the call times out");
}

fn slow_agent_backend(client: &RecordingRegistryClient) -> Arc<RegistryBackend> {
    client.set_delay(Duration::from_millis(300));
    Arc::new(RegistryBackend::new(
        Box::new(RecordingRegistryClient::sharing_counters_with(client)),
        settings("consul"),
        KeyScheme::Agent,
    ))
}

#[tokio::test]
async fn cancel_mid_event_starts_no_new_calls() {
    let client = RecordingRegistryClient::new();
    let backend = slow_agent_backend(&client);

    let (tx, rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn({
        let backend = Arc::clone(&backend);
        let shutdown = shutdown.clone();
        async move { backend.run(rx, StartupPlan::none(), shutdown).await }
    });

    let container = ContainerInfo::new("multi")
        .with_label("creg", "true")
        .with_label("creg.port", "80/tcp:a,81/tcp:b,82/tcp:c");
    tx.send(ContainerEvent::start(container)).await.unwrap();

    assert!(eventually(|| client.call_count() == 1).await);
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), runner).await;
    assert!(result.is_ok(), "Backend should stop after the in-flight call");
    assert_eq!(client.registers().len(), 1);
}

#[tokio::test]
async fn cancel_during_refresh_starts_no_new_calls() {
    let client = RecordingRegistryClient::new();
    let backend = slow_agent_backend(&client);

    let refresh: Vec<ContainerInfo> = (0..5)
        .map(|n| {
            ContainerInfo::new(format!("c{}", n))
                .with_label("creg", "true")
                .with_label("creg.port", format!("80/tcp:svc{}", n))
        })
        .collect();

    let (_tx, rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn({
        let backend = Arc::clone(&backend);
        let shutdown = shutdown.clone();
        let plan = StartupPlan {
            purge: false,
            refresh,
        };
        async move { backend.run(rx, plan, shutdown).await }
    });

    assert!(eventually(|| client.call_count() == 1).await);
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("Backend should stop after the in-flight call")
        .unwrap();
    assert!(result.is_ok(), "A refresh cut short by shutdown is not a failure");
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn cancel_during_purge_deregisters_nothing_further() {
    let client = RecordingRegistryClient::new();
    for id in ["a-node1", "b-node1", "c-node1"] {
        let mut record = RegistryRecord {
            id: id.to_string(),
            ..Default::default()
        };
        record.meta.insert(META_NAMESPACE.to_string(), "creg".to_string());
        client.seed(record);
    }
    let backend = slow_agent_backend(&client);

    let (_tx, rx) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn({
        let backend = Arc::clone(&backend);
        let shutdown = shutdown.clone();
        let plan = StartupPlan {
            purge: true,
            refresh: Vec::new(),
        };
        async move { backend.run(rx, plan, shutdown).await }
    });

    // The list call is in flight
    assert!(eventually(|| client.call_count() == 1).await);
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("Backend should stop after the in-flight call")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(client.calls(), vec![Call::ListAll]);
}
