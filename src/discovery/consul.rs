//! Consul agent HTTP adapter.
//!
//! ## Configuration
//!
//! ```yaml
//! consul:
//!   address: "http://127.0.0.1:8500"
//!   token: "secret"            # optional, sent as X-Consul-Token
//!   service_prefix: "platform-" # optional, prepended to service names
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{backend_id, BackendHealth, DiscoveryBackend, DiscoveryError, DiscoveryInstance};

/// Meta keys the curator writes so its own announcements can be recognised.
const META_INSTANCE_ID: &str = "curator_instance_id";
const META_SERVICE_NAME: &str = "curator_service_name";

/// Connection settings for a Consul agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub service_prefix: String,
}

fn default_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            token: None,
            service_prefix: String::new(),
        }
    }
}

/// One entry of `GET /v1/agent/services`.
#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Meta", default)]
    meta: Option<BTreeMap<String, String>>,
}

/// Discovery backend speaking the Consul agent API.
pub struct ConsulBackend {
    config: ConsulConfig,
    timeout_ms: u64,
    client: reqwest::Client,
}

impl ConsulBackend {
    pub fn new(config: ConsulConfig, timeout: Duration) -> Result<Self, DiscoveryError> {
        if config.address.trim().is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "consul address must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            config,
            timeout_ms: timeout.as_millis() as u64,
            client,
        })
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.address.trim_end_matches('/'), path)
    }

    fn with_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => request.header("X-Consul-Token", token.as_str()),
            None => request,
        }
    }

    fn send_error(&self, e: reqwest::Error) -> DiscoveryError {
        if e.is_timeout() {
            DiscoveryError::Timeout(self.timeout_ms)
        } else {
            DiscoveryError::Unreachable(e.to_string())
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, DiscoveryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(DiscoveryError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    fn registration_body(&self, instance: &DiscoveryInstance) -> serde_json::Value {
        let mut meta = instance.meta.clone();
        meta.insert(META_INSTANCE_ID.to_string(), instance.instance_id.clone());
        meta.insert(META_SERVICE_NAME.to_string(), instance.service_name.clone());

        let mut body = json!({
            "ID": instance.backend_id(),
            "Name": format!("{}{}", self.config.service_prefix, instance.service_name),
            "Tags": instance.tags,
            "Meta": meta,
        });
        if let Some(address) = &instance.address {
            body["Address"] = json!(address);
        }
        if let Some(port) = instance.port {
            body["Port"] = json!(port);
        }
        body
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulBackend {
    fn name(&self) -> &str {
        "consul"
    }

    async fn announce(&self, instance: &DiscoveryInstance) -> Result<(), DiscoveryError> {
        let request = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .json(&self.registration_body(instance));

        let response = self
            .with_token(request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn withdraw(&self, service_name: &str, instance_id: &str) -> Result<(), DiscoveryError> {
        let mut url = reqwest::Url::parse(&self.url("/v1/agent/service/deregister"))
            .map_err(|e| DiscoveryError::InvalidConfig(format!("invalid consul address: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| DiscoveryError::InvalidConfig("consul address cannot carry a path".to_string()))?
            .push(&backend_id(service_name, instance_id));
        let request = self.client.put(url);

        let response = self
            .with_token(request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        // Consul answers 404 for services it does not know.
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<BackendHealth, DiscoveryError> {
        let start = Instant::now();
        let request = self.client.get(self.url("/v1/status/leader"));

        match self.with_token(request).send().await {
            Ok(resp) if resp.status().is_success() => {
                let leader = resp.text().await.unwrap_or_default();
                let leader = leader.trim().trim_matches('"');
                Ok(BackendHealth {
                    reachable: true,
                    latency_ms: Some(start.elapsed().as_millis() as u64),
                    message: if leader.is_empty() {
                        "reachable, no cluster leader".to_string()
                    } else {
                        format!("leader {}", leader)
                    },
                })
            }
            Ok(resp) => Ok(BackendHealth {
                reachable: false,
                latency_ms: Some(start.elapsed().as_millis() as u64),
                message: format!("HTTP {}", resp.status()),
            }),
            Err(e) => Ok(BackendHealth {
                reachable: false,
                latency_ms: Some(start.elapsed().as_millis() as u64),
                message: e.to_string(),
            }),
        }
    }

    async fn list_instances(&self) -> Result<Vec<DiscoveryInstance>, DiscoveryError> {
        let request = self.client.get(self.url("/v1/agent/services"));
        let response = self
            .with_token(request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let response = Self::expect_success(response).await?;

        let services: HashMap<String, AgentService> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;

        let mut instances: Vec<DiscoveryInstance> = services
            .into_values()
            .filter_map(|svc| {
                // Only entries this curator announced carry the instance id.
                let mut meta = svc.meta.unwrap_or_default();
                let instance_id = meta.remove(META_INSTANCE_ID)?;
                let service_name = meta.remove(META_SERVICE_NAME).unwrap_or_else(|| {
                    svc.service
                        .strip_prefix(self.config.service_prefix.as_str())
                        .unwrap_or(&svc.service)
                        .to_string()
                });
                Some(DiscoveryInstance {
                    service_name,
                    instance_id,
                    address: (!svc.address.is_empty()).then_some(svc.address),
                    port: (svc.port != 0).then_some(svc.port),
                    tags: svc.tags.unwrap_or_default(),
                    meta,
                })
            })
            .collect();
        instances.sort_by(|a, b| a.backend_id().cmp(&b.backend_id()));
        Ok(instances)
    }
}
