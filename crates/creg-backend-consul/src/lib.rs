// # Consul Backend
//
// Registers services with the local Consul agent's service catalog.
//
// Records are keyed `<service>-<instance id>` and carry the creg namespace
// and instance id in their service metadata, which is how purge recognizes
// what it owns.
//
// ## API Reference
//
// - Register: PUT `/v1/agent/service/register`
// - Deregister: PUT `/v1/agent/service/deregister/:service_id`
// - List: GET `/v1/agent/services`
//
// The ACL token, when configured, is sent as `X-Consul-Token` and never
// logged.

use async_trait::async_trait;
use creg_core::config::{BackendConfig, CregConfig};
use creg_core::traits::{Backend, BackendFactory, Registration, RegistryClient, RegistryRecord};
use creg_core::{BackendSettings, Error, KeyScheme, RegistryBackend, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Default HTTP timeout for agent requests
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Service registration payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
}

impl From<&Registration> for AgentServiceRegistration {
    fn from(registration: &Registration) -> Self {
        Self {
            id: registration.id.clone(),
            name: registration.name.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tags: registration.tags.clone(),
            meta: registration.meta.clone(),
        }
    }
}

/// Service entry as returned by `/v1/agent/services`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub tags: Option<Vec<String>>,
    pub meta: Option<BTreeMap<String, String>>,
}

impl From<AgentService> for RegistryRecord {
    fn from(service: AgentService) -> Self {
        Self {
            id: service.id,
            name: service.service,
            address: service.address,
            port: service.port,
            tags: service.tags.unwrap_or_default(),
            meta: service.meta.unwrap_or_default(),
        }
    }
}

/// Consul agent client
pub struct ConsulClient {
    /// Agent base URL, without trailing slash
    address: String,
    /// ACL token
    /// ⚠️ NEVER log this value
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for ConsulClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulClient")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl ConsulClient {
    /// Create a client for the agent at `address`
    pub fn new(address: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            address: address.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// URL of `/v1/agent/service/deregister/<id>` with `id` percent-encoded
    fn deregister_url(&self, id: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.address)
            .map_err(|e| Error::config(format!("invalid Consul address '{}': {}", self.address, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("Consul address '{}' cannot carry a path", self.address)))?
            .pop_if_empty()
            .extend(["v1", "agent", "service", "deregister", id]);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = self.dispatch(request, what).await?;
        Self::check(response, what).await
    }

    async fn dispatch(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| Error::registry("consul", format!("{}: HTTP request failed: {}", what, e)))
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        Err(match status.as_u16() {
            401 | 403 => Error::registry(
                "consul",
                format!("{}: permission denied (check the ACL token). Status: {}", what, status),
            ),
            500..=599 => Error::registry(
                "consul",
                format!("{}: agent error (transient): {} - {}", what, status, body.trim()),
            ),
            _ => Error::registry("consul", format!("{}: {} - {}", what, status, body.trim())),
        })
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn register(&self, registration: &Registration) -> Result<()> {
        let payload = AgentServiceRegistration::from(registration);
        let request = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .json(&payload);

        self.send(request, "register").await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let request = self.client.put(self.deregister_url(id)?);
        let response = self.dispatch(request, "deregister").await?;

        // Unknown service ids are already gone
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(id = %id, "Service already deregistered");
            return Ok(());
        }

        Self::check(response, "deregister").await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<BTreeMap<String, RegistryRecord>> {
        let request = self.client.get(self.url("/v1/agent/services"));
        let response = self.send(request, "list services").await?;

        let services: HashMap<String, AgentService> = response
            .json()
            .await
            .map_err(|e| Error::registry("consul", format!("failed to parse services: {}", e)))?;

        Ok(services
            .into_iter()
            .map(|(id, service)| (id, RegistryRecord::from(service)))
            .collect())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        let ids: Vec<String> = self
            .list_all()
            .await?
            .into_keys()
            .filter(|id| id.starts_with(prefix))
            .collect();

        for id in ids {
            self.deregister(&id).await?;
        }
        Ok(())
    }

    fn client_name(&self) -> &'static str {
        "consul"
    }
}

/// Factory for Consul backends
pub struct ConsulFactory;

impl BackendFactory for ConsulFactory {
    fn create(&self, config: &BackendConfig, global: &CregConfig) -> Result<Box<dyn Backend>> {
        match config {
            BackendConfig::Consul { address, token, .. } => {
                if address.is_empty() {
                    return Err(Error::config("Consul address is required"));
                }

                let client = ConsulClient::new(address.clone(), token.clone())?;
                let settings = BackendSettings::from_config(config.name(), global);

                Ok(Box::new(RegistryBackend::new(
                    Box::new(client),
                    settings,
                    KeyScheme::Agent,
                )))
            }
            _ => Err(Error::config("Invalid config for consul backend")),
        }
    }
}

/// Register the Consul backend with a registry
pub fn register(registry: &creg_core::PluginRegistry) {
    registry.register_backend("consul", Box::new(ConsulFactory));
}
