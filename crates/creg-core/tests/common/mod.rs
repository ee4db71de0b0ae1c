//! Test doubles and common utilities for contract tests
//!
//! The doubles record every call so tests can assert on exactly what the
//! core asked a registry to do, without any network.

#![allow(dead_code)]

use creg_core::error::{Error, Result};
use creg_core::traits::{EventSource, EventStream, Registration, RegistryClient, RegistryRecord};
use creg_core::{BackendSettings, ContainerEvent, ContainerInfo, CregConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One call observed by [`RecordingRegistryClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register {
        id: String,
        name: String,
        address: String,
        port: u16,
        tags: Vec<String>,
    },
    Deregister(String),
    DeleteByPrefix(String),
    ListAll,
}

impl Call {
    pub fn is_register(&self) -> bool {
        matches!(self, Call::Register { .. })
    }

    pub fn is_deregister(&self) -> bool {
        matches!(self, Call::Deregister(_))
    }
}

/// A registry client that records calls and can be told to fail or stall
pub struct RecordingRegistryClient {
    calls: Arc<Mutex<Vec<Call>>>,
    call_count: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
    records: Arc<Mutex<BTreeMap<String, RegistryRecord>>>,
}

impl RecordingRegistryClient {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            call_count: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
            delay: Arc::new(Mutex::new(None)),
            records: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Create a client that shares recorded state with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            calls: Arc::clone(&other.calls),
            call_count: Arc::clone(&other.call_count),
            failing: Arc::clone(&other.failing),
            delay: Arc::clone(&other.delay),
            records: Arc::clone(&other.records),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn registers(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_register).collect()
    }

    pub fn deregisters(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_deregister).collect()
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every subsequent call take `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Seed what list_all() returns
    pub fn seed(&self, record: RegistryRecord) {
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    async fn observe(&self, call: Call) -> Result<()> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(call);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::http("registry unavailable"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RegistryClient for RecordingRegistryClient {
    async fn register(&self, registration: &Registration) -> Result<()> {
        self.observe(Call::Register {
            id: registration.id.clone(),
            name: registration.name.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tags: registration.tags.clone(),
        })
        .await
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.observe(Call::Deregister(id.to_string())).await?;
        self.records.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_all(&self) -> Result<BTreeMap<String, RegistryRecord>> {
        self.observe(Call::ListAll).await?;
        Ok(self.records.lock().unwrap().clone())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        self.observe(Call::DeleteByPrefix(prefix.to_string())).await
    }

    fn client_name(&self) -> &'static str {
        "recording"
    }
}

/// An event source whose events are pushed by the test
pub struct ControlledEventSource {
    tx: mpsc::UnboundedSender<ContainerEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ContainerEvent>>>,
    running: Vec<ContainerInfo>,
}

impl ControlledEventSource {
    pub fn new(running: Vec<ContainerInfo>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            running,
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ContainerEvent> {
        self.tx.clone()
    }
}

#[async_trait::async_trait]
impl EventSource for ControlledEventSource {
    fn source_name(&self) -> &str {
        "controlled"
    }

    async fn running(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.running.clone())
    }

    fn events(&self, _shutdown: tokio_util::sync::CancellationToken) -> EventStream {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("events() can only be called once");
        Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx))
    }
}

/// Daemon-wide configuration used by every contract test
pub fn test_config() -> CregConfig {
    let mut config = CregConfig::new("node1", "10.0.0.5");
    config.engine.call_timeout_secs = 1;
    config
}

pub fn settings(name: &str) -> BackendSettings {
    BackendSettings::from_config(name, &test_config())
}

/// An eligible container exposing `80/tcp` as `svc1`
pub fn svc1(id: &str) -> ContainerInfo {
    ContainerInfo::new(id)
        .with_label("creg", "true")
        .with_label("creg.port", "80/tcp:svc1")
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
