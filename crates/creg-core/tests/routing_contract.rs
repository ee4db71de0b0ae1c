//! Contract Test: Routing
//!
//! Constraints verified:
//! - Unlabelled events reach every backend
//! - The routing label restricts delivery to the named backends or `all`
//! - Naming an unknown backend delivers to nobody
//! - Every source gets its own dispatch loop, and each output sees a
//!   source's events in the order that source emitted them

mod common;

use common::*;
use creg_core::{
    Backend, ContainerEvent, EventMultiplexer, EventSource, KeyScheme, RegistryBackend,
    StartupPlan,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Deployment {
    consul: RecordingRegistryClient,
    etcd: RecordingRegistryClient,
    source: ControlledEventSource,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

async fn deploy() -> Deployment {
    let consul = RecordingRegistryClient::new();
    let etcd = RecordingRegistryClient::new();
    let source = ControlledEventSource::new(Vec::new());
    let shutdown = CancellationToken::new();

    let mut mux = EventMultiplexer::new("creg.backends", 16);
    mux.add_input(source.source_name().to_string(), source.events(shutdown.clone()));

    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(RegistryBackend::new(
            Box::new(RecordingRegistryClient::sharing_counters_with(&consul)),
            settings("consul"),
            KeyScheme::Agent,
        )),
        Arc::new(RegistryBackend::new(
            Box::new(RecordingRegistryClient::sharing_counters_with(&etcd)),
            settings("etcd"),
            KeyScheme::KeyValue {
                namespace: "creg".to_string(),
                hostname: "host1".to_string(),
            },
        )),
    ];

    let mut tasks = Vec::new();
    for backend in backends {
        let rx = mux.new_output(backend.name());
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let _ = backend.run(rx, StartupPlan::none(), shutdown).await;
        }));
    }

    let handle = mux.run(shutdown.clone());
    tasks.push(tokio::spawn(async move {
        handle.join().await;
    }));

    Deployment {
        consul,
        etcd,
        source,
        shutdown,
        tasks,
    }
}

async fn finish(deployment: Deployment) {
    deployment.shutdown.cancel();
    for task in deployment.tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn unlabelled_event_reaches_all_backends() {
    let d = deploy().await;
    d.source.sender().send(ContainerEvent::start(svc1("a"))).unwrap();

    assert!(eventually(|| d.consul.registers().len() == 1).await);
    assert!(eventually(|| d.etcd.registers().len() == 1).await);
    finish(d).await;
}

#[tokio::test]
async fn allow_list_restricts_delivery() {
    let d = deploy().await;
    let tx = d.source.sender();

    tx.send(ContainerEvent::start(svc1("a").with_label("creg.backends", "etcd")))
        .unwrap();
    tx.send(ContainerEvent::start(svc1("b").with_label("creg.backends", "all")))
        .unwrap();

    assert!(eventually(|| d.etcd.registers().len() == 2).await);
    assert!(eventually(|| d.consul.registers().len() == 1).await);
    finish(d).await;
}

#[tokio::test]
async fn unknown_backend_receives_nothing() {
    let d = deploy().await;
    let tx = d.source.sender();

    tx.send(ContainerEvent::start(
        svc1("a").with_label("creg.backends", "doesnotexist"),
    ))
    .unwrap();
    // Sentinel routed to etcd proves the first event was processed
    tx.send(ContainerEvent::start(svc1("b").with_label("creg.backends", "etcd")))
        .unwrap();

    assert!(eventually(|| d.etcd.registers().len() == 1).await);
    assert_eq!(d.consul.call_count(), 0);
    finish(d).await;
}

#[tokio::test]
async fn concurrent_sources_keep_per_source_order() {
    let docker = ControlledEventSource::new(Vec::new());
    let podman = ControlledEventSource::new(Vec::new());
    let shutdown = CancellationToken::new();

    // Outputs are drained one after the other, so each must hold every event
    let mut mux = EventMultiplexer::new("creg.backends", 32);
    mux.add_input("docker", docker.events(shutdown.clone()));
    mux.add_input("podman", podman.events(shutdown.clone()));
    let mut outputs = vec![mux.new_output("consul"), mux.new_output("etcd")];
    let handle = mux.run(shutdown.clone());

    let (docker_tx, podman_tx) = (docker.sender(), podman.sender());
    for n in 0..10 {
        docker_tx.send(ContainerEvent::start(svc1(&format!("docker-{}", n)))).unwrap();
        podman_tx.send(ContainerEvent::start(svc1(&format!("podman-{}", n)))).unwrap();
    }
    drop((docker_tx, podman_tx));
    drop((docker, podman));

    for rx in &mut outputs {
        let mut seen = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("outputs close once both sources end")
        {
            seen.push(event.container.id);
        }

        assert_eq!(seen.len(), 20);
        for source in ["docker", "podman"] {
            let order: Vec<&String> = seen.iter().filter(|id| id.starts_with(source)).collect();
            let expected: Vec<String> = (0..10).map(|n| format!("{}-{}", source, n)).collect();
            assert_eq!(order, expected.iter().collect::<Vec<_>>());
        }
    }

    assert_eq!(handle.join().await, 40);
}
