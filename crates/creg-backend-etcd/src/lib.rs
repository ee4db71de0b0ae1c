// # etcd Backend
//
// Stores services in etcd's key space through the v3 JSON gateway.
//
// ## Key layout
//
// ```text
// <namespace>/<service>/<hostname>  =  <forward address>:<port>
// ```
//
// Everything under `<namespace>/` belongs to creg, so purge is a single
// range delete.
//
// ## API Reference
//
// - Put: POST `/v3/kv/put` `{"key", "value"}`
// - Delete: POST `/v3/kv/deleterange` `{"key", "range_end"}`
// - Range: POST `/v3/kv/range` `{"key", "range_end"}`
//
// Keys and values are base64 on the wire.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use creg_core::config::{BackendConfig, CregConfig};
use creg_core::traits::{Backend, BackendFactory, Registration, RegistryClient, RegistryRecord};
use creg_core::{BackendSettings, Error, KeyScheme, RegistryBackend, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default HTTP timeout for gateway requests
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

/// End of the key range covering every key that starts with `prefix`
///
/// Mirrors etcd's `GetPrefixRangeEnd`: the prefix with its last byte below
/// `0xff` incremented, or `\0` (the whole key space) when there is none.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

/// Value stored for a registration
pub fn encode_value(registration: &Registration) -> String {
    format!("{}:{}", registration.address, registration.port)
}

/// Split a stored `address:port` value; the port is 0 when absent or invalid
fn decode_value(value: &str) -> (String, u16) {
    match value.rsplit_once(':') {
        Some((address, port)) => (address.to_string(), port.parse().unwrap_or(0)),
        None => (value.to_string(), 0),
    }
}

fn decode(field: &str, what: &str) -> Result<String> {
    let bytes = BASE64
        .decode(field)
        .map_err(|e| Error::registry("etcd", format!("invalid base64 {}: {}", what, e)))?;
    String::from_utf8(bytes)
        .map_err(|e| Error::registry("etcd", format!("non-utf8 {}: {}", what, e)))
}

/// etcd v3 gateway client scoped to one namespace
#[derive(Debug)]
pub struct EtcdClient {
    endpoint: String,
    namespace: String,
    client: reqwest::Client,
}

impl EtcdClient {
    /// Create a client for the gateway at `endpoint`
    pub fn new(endpoint: impl Into<String>, namespace: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            client,
        })
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::registry("etcd", format!("{}: HTTP request failed: {}", path, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(Error::registry(
                "etcd",
                format!("{}: {} - {}", path, status, body.trim()),
            ));
        }

        Ok(response)
    }

    fn prefix_request(prefix: &str) -> RangeRequest {
        RangeRequest {
            key: BASE64.encode(prefix),
            range_end: Some(BASE64.encode(prefix_range_end(prefix.as_bytes()))),
        }
    }
}

#[async_trait]
impl RegistryClient for EtcdClient {
    async fn register(&self, registration: &Registration) -> Result<()> {
        let request = PutRequest {
            key: BASE64.encode(&registration.id),
            value: BASE64.encode(encode_value(registration)),
        };
        self.post("/v3/kv/put", &request).await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let request = RangeRequest {
            key: BASE64.encode(id),
            range_end: None,
        };
        self.post("/v3/kv/deleterange", &request).await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<BTreeMap<String, RegistryRecord>> {
        let prefix = format!("{}/", self.namespace);
        let response = self
            .post("/v3/kv/range", &Self::prefix_request(&prefix))
            .await?;

        let range: RangeResponse = response
            .json()
            .await
            .map_err(|e| Error::registry("etcd", format!("failed to parse range: {}", e)))?;

        let mut records = BTreeMap::new();
        for kv in range.kvs {
            let key = decode(&kv.key, "key")?;
            let value = decode(&kv.value, "value")?;
            let (address, port) = decode_value(&value);
            let name = key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split('/').next())
                .unwrap_or_default()
                .to_string();

            records.insert(
                key.clone(),
                RegistryRecord {
                    id: key,
                    name,
                    address,
                    port,
                    ..Default::default()
                },
            );
        }
        Ok(records)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        self.post("/v3/kv/deleterange", &Self::prefix_request(prefix))
            .await?;
        Ok(())
    }

    fn client_name(&self) -> &'static str {
        "etcd"
    }
}

/// Factory for etcd backends
pub struct EtcdFactory;

impl BackendFactory for EtcdFactory {
    fn create(&self, config: &BackendConfig, global: &CregConfig) -> Result<Box<dyn Backend>> {
        match config {
            BackendConfig::Etcd {
                endpoint,
                namespace,
                ..
            } => {
                if endpoint.is_empty() {
                    return Err(Error::config("etcd endpoint is required"));
                }

                let hostname = std::env::var("HOSTNAME")
                    .ok()
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| global.instance_id.clone());

                let client = EtcdClient::new(endpoint.clone(), namespace.clone())?;
                let settings = BackendSettings::from_config(config.name(), global);
                let scheme = KeyScheme::KeyValue {
                    namespace: namespace.clone(),
                    hostname,
                };

                Ok(Box::new(RegistryBackend::new(Box::new(client), settings, scheme)))
            }
            _ => Err(Error::config("Invalid config for etcd backend")),
        }
    }
}

/// Register the etcd backend with a registry
pub fn register(registry: &creg_core::PluginRegistry) {
    registry.register_backend("etcd", Box::new(EtcdFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_end_increments_last_byte() {
        assert_eq!(prefix_range_end(b"creg/"), b"creg0".to_vec());
        assert_eq!(prefix_range_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_range_end(b"\xff\xff"), vec![0]);
        assert_eq!(prefix_range_end(b""), vec![0]);
    }

    #[test]
    fn value_is_address_and_port() {
        let registration = Registration {
            id: "creg/web/host1".to_string(),
            name: "web".to_string(),
            address: "10.0.0.5".to_string(),
            port: 8080,
            tags: Vec::new(),
            meta: BTreeMap::new(),
        };

        assert_eq!(encode_value(&registration), "10.0.0.5:8080");
        assert_eq!(decode_value("10.0.0.5:8080"), ("10.0.0.5".to_string(), 8080));
        assert_eq!(decode_value("10.0.0.5"), ("10.0.0.5".to_string(), 0));
    }

    #[test]
    fn prefix_request_is_base64() {
        let request = serde_json::to_value(EtcdClient::prefix_request("creg/")).unwrap();

        assert_eq!(request["key"], "Y3JlZy8=");
        assert_eq!(request["range_end"], "Y3JlZzA=");
    }

    #[test]
    fn single_key_delete_omits_range_end() {
        let request = RangeRequest {
            key: BASE64.encode("creg/web/host1"),
            range_end: None,
        };
        let json = serde_json::to_value(&request).unwrap();

        assert!(json.get("range_end").is_none());
    }

    #[test]
    fn parses_range_response() {
        let body = format!(
            r#"{{"header": {{}}, "kvs": [{{"key": "{}", "value": "{}", "version": "1"}}], "count": "1"}}"#,
            BASE64.encode("creg/web/host1"),
            BASE64.encode("10.0.0.5:80"),
        );

        let range: RangeResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(range.kvs.len(), 1);
        assert_eq!(decode(&range.kvs[0].key, "key").unwrap(), "creg/web/host1");
        assert_eq!(decode(&range.kvs[0].value, "value").unwrap(), "10.0.0.5:80");

        // An empty range omits kvs entirely
        let empty: RangeResponse = serde_json::from_str(r#"{"header": {}}"#).unwrap();
        assert!(empty.kvs.is_empty());
    }

    #[test]
    fn factory_builds_key_value_backend() {
        let config = BackendConfig::Etcd {
            endpoint: "http://127.0.0.1:2379".to_string(),
            namespace: "creg".to_string(),
            name: Some("kv".to_string()),
        };
        let global = CregConfig::new("node1", "10.0.0.5");

        let backend = EtcdFactory.create(&config, &global).unwrap();
        assert_eq!(backend.name(), "kv");
    }
}
