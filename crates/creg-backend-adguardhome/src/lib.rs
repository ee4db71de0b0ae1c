// # AdGuardHome Backend
//
// Publishes services as DNS rewrites: `<service><domain suffix>` answers
// with the forward address. Containers can add explicit rewrites through the
// dns label (`creg.dns=nas.lan,10.0.0.9`).
//
// Rewrites have no metadata, so ownership for purge is inferred: a rewrite
// is creg's when its domain ends with the configured suffix and it answers
// with the forward address.
//
// ## API Reference
//
// - List: GET `/control/rewrite/list`
// - Add: POST `/control/rewrite/add` `{"domain", "answer"}`
// - Delete: POST `/control/rewrite/delete` `{"domain", "answer"}`
//
// Authentication is HTTP basic auth; the password is never logged.

use async_trait::async_trait;
use creg_core::config::{BackendConfig, CregConfig};
use creg_core::traits::{Backend, BackendFactory, Registration, RegistryClient, RegistryRecord};
use creg_core::{BackendSettings, Error, KeyScheme, RegistryBackend, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Default HTTP timeout for control API requests
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// One DNS rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewrite {
    pub domain: String,
    pub answer: String,
}

impl From<&Registration> for Rewrite {
    fn from(registration: &Registration) -> Self {
        Self {
            domain: registration.id.clone(),
            answer: registration.address.clone(),
        }
    }
}

/// What `register` has to do to make `wanted` the only rewrite for its domain
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RewritePlan {
    /// Stale answers for the same domain
    pub delete: Vec<Rewrite>,
    /// Whether `wanted` still has to be added
    pub add: bool,
}

/// Compare the current rewrites against `wanted`
pub fn plan_upsert(current: &[Rewrite], wanted: &Rewrite) -> RewritePlan {
    let mut plan = RewritePlan {
        delete: Vec::new(),
        add: true,
    };

    for rewrite in current.iter().filter(|r| r.domain == wanted.domain) {
        if rewrite.answer == wanted.answer {
            plan.add = false;
        } else {
            plan.delete.push(rewrite.clone());
        }
    }
    plan
}

struct Credentials {
    user: String,
    password: String,
}

/// AdGuardHome control API client
pub struct AdGuardHomeClient {
    address: String,
    credentials: Option<Credentials>,
    client: reqwest::Client,
}

impl std::fmt::Debug for AdGuardHomeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdGuardHomeClient")
            .field("address", &self.address)
            .field("user", &self.credentials.as_ref().map(|c| c.user.as_str()))
            .field("password", &self.credentials.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl AdGuardHomeClient {
    /// Create a client; `auth` is `user:password`
    pub fn new(address: impl Into<String>, auth: Option<&str>) -> Result<Self> {
        let credentials = match auth {
            None | Some("") => None,
            Some(auth) => {
                let (user, password) = auth
                    .split_once(':')
                    .ok_or_else(|| Error::config("AdGuardHome auth must be 'user:password'"))?;
                Some(Credentials {
                    user: user.to_string(),
                    password: password.to_string(),
                })
            }
        };

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            address: address.into().trim_end_matches('/').to_string(),
            credentials,
            client,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let request = match &self.credentials {
            Some(c) => request.basic_auth(&c.user, Some(&c.password)),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::registry("adguardhome", format!("{}: HTTP request failed: {}", what, e)))?;

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
                "adguardhome",
                format!("{}: authentication failed. Status: {}", what, status),
            ),
            _ => Error::registry("adguardhome", format!("{}: {} - {}", what, status, body.trim())),
        })
    }

    /// Every configured rewrite
    pub async fn rewrites(&self) -> Result<Vec<Rewrite>> {
        let request = self
            .client
            .get(format!("{}/control/rewrite/list", self.address));
        let response = self.send(request, "list rewrites").await?;

        // AdGuardHome answers `null` when there are no rewrites
        let rewrites: Option<Vec<Rewrite>> = response
            .json()
            .await
            .map_err(|e| Error::registry("adguardhome", format!("failed to parse rewrites: {}", e)))?;
        Ok(rewrites.unwrap_or_default())
    }

    async fn post(&self, op: &str, rewrite: &Rewrite) -> Result<()> {
        let request = self
            .client
            .post(format!("{}/control/rewrite/{}", self.address, op))
            .json(rewrite);
        self.send(request, op).await?;
        debug!(op = %op, domain = %rewrite.domain, answer = %rewrite.answer, "Rewrite updated");
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for AdGuardHomeClient {
    async fn register(&self, registration: &Registration) -> Result<()> {
        let wanted = Rewrite::from(registration);
        let plan = plan_upsert(&self.rewrites().await?, &wanted);

        for stale in &plan.delete {
            self.post("delete", stale).await?;
        }
        if plan.add {
            self.post("add", &wanted).await?;
        }
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        for rewrite in self.rewrites().await?.iter().filter(|r| r.domain == id) {
            self.post("delete", rewrite).await?;
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<BTreeMap<String, RegistryRecord>> {
        Ok(self
            .rewrites()
            .await?
            .into_iter()
            .map(|r| {
                let record = RegistryRecord {
                    id: r.domain.clone(),
                    name: r.domain.clone(),
                    address: r.answer,
                    ..Default::default()
                };
                (r.domain, record)
            })
            .collect())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        for rewrite in self
            .rewrites()
            .await?
            .iter()
            .filter(|r| r.domain.starts_with(prefix))
        {
            self.post("delete", rewrite).await?;
        }
        Ok(())
    }

    fn client_name(&self) -> &'static str {
        "adguardhome"
    }
}

/// Factory for AdGuardHome backends
pub struct AdGuardHomeFactory;

impl BackendFactory for AdGuardHomeFactory {
    fn create(&self, config: &BackendConfig, global: &CregConfig) -> Result<Box<dyn Backend>> {
        match config {
            BackendConfig::AdGuardHome {
                address,
                auth,
                domain_suffix,
                ..
            } => {
                if address.is_empty() {
                    return Err(Error::config("AdGuardHome address is required"));
                }

                let client = AdGuardHomeClient::new(address.clone(), auth.as_deref())?;
                let settings = BackendSettings::from_config(config.name(), global);
                let scheme = KeyScheme::Dns {
                    domain_suffix: domain_suffix.clone(),
                };

                Ok(Box::new(RegistryBackend::new(Box::new(client), settings, scheme)))
            }
            _ => Err(Error::config("Invalid config for adguardhome backend")),
        }
    }
}

/// Register the AdGuardHome backend with a registry
pub fn register(registry: &creg_core::PluginRegistry) {
    registry.register_backend("adguardhome", Box::new(AdGuardHomeFactory));
}
