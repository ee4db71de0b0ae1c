// # Registry Client Trait
//
// Defines the request/response surface of one concrete registry.
//
// ## Implementations
//
// - Consul agent: `creg-backend-consul` crate
// - etcd v3 KV: `creg-backend-etcd` crate
// - AdGuardHome rewrites: `creg-backend-adguardhome` crate
//
// Clients are stateless wrappers. Timeouts, retries of the whole batch and
// every decision about *what* to register live in the backend driver.

use async_trait::async_trait;
use std::collections::BTreeMap;

/// One record to upsert into a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Identity key; deregistration uses the same value
    pub id: String,
    /// Service (or domain) name
    pub name: String,
    /// Address advertised to consumers
    pub address: String,
    /// Advertised port (0 when the registry has no notion of ports)
    pub port: u16,
    /// Ordered `key=value` tags
    pub tags: Vec<String>,
    /// Registry metadata, for registries that support it
    pub meta: BTreeMap<String, String>,
}

/// A record as listed back from a registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryRecord {
    /// Identity key
    pub id: String,
    /// Service (or domain) name
    pub name: String,
    /// Registered address
    pub address: String,
    /// Registered port
    pub port: u16,
    /// Registered tags
    pub tags: Vec<String>,
    /// Registered metadata
    pub meta: BTreeMap<String, String>,
}

/// Trait for registry client implementations
///
/// # Idempotency
///
/// `register` must have upsert semantics: registering the same id twice
/// overwrites, it never appends or fails. `deregister` of an unknown id is
/// not an error.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Upsert a registration
    async fn register(&self, registration: &Registration) -> Result<(), crate::Error>;

    /// Remove the registration with this id
    async fn deregister(&self, id: &str) -> Result<(), crate::Error>;

    /// Every record currently held by the registry, keyed by id
    async fn list_all(&self) -> Result<BTreeMap<String, RegistryRecord>, crate::Error>;

    /// Remove every record whose id starts with `prefix`
    async fn delete_by_prefix(&self, prefix: &str) -> Result<(), crate::Error>;

    /// Client name for logging (e.g. "consul")
    fn client_name(&self) -> &'static str;
}
