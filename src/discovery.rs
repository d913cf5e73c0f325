//! Service discovery client.
//!
//! The agent registers itself (service + HTTP health check) with the
//! discovery service and resolves the coordinator's endpoint from its KV
//! store. The discovery base URL is resolved to a numeric address once,
//! so register and deregister always talk to the same instance rather
//! than whichever one a fresh DNS lookup would pick.

use serde_json::Value;
use tracing::{debug, error};

use crate::{NodeError, Result};

/// Client for one discovery endpoint.
pub struct DiscoveryClient {
    base_url: String,
    client: reqwest::Client,
}

impl DiscoveryClient {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    /// Client pinned to a numeric address for the same endpoint.
    ///
    /// # Errors
    ///
    /// `NodeError::Service` when the hostname cannot be resolved.
    pub async fn resolved(base_url: &str) -> Result<Self> {
        Ok(Self::new(&resolve_numeric_url(base_url).await?))
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the config service where a service lives for an environment
    /// and datacenter. Returns the service base URL.
    ///
    /// # Errors
    ///
    /// `NodeError::Service` on transport failure or an empty answer.
    pub async fn get_service_url(
        config_service_url: &str,
        service: &str,
        environment: &str,
        datacenter: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/serviceUrls/{service}?environment={environment}&datacenter={datacenter}",
            config_service_url.trim_end_matches('/')
        );
        let response = reqwest::Client::new().get(&url).send().await?;
        if !response.status().is_success() {
            return Err(NodeError::Service(format!(
                "config service request 'GET {url}' returned status {}",
                response.status()
            )));
        }
        let body = response.text().await?.trim().to_owned();
        if body.is_empty() {
            return Err(NodeError::Service(format!(
                "config service has no endpoint for '{service}'"
            )));
        }
        Ok(body)
    }

    /// Coordinator endpoint from the discovery KV store.
    ///
    /// # Errors
    ///
    /// `NodeError::Service` on transport failure or a malformed record.
    pub async fn get_coordinator_url(&self) -> Result<String> {
        let path = "/v1/kv/arras/services/coordinator?raw";
        let body: Value = self.get_json(path).await?;
        let (Some(ip), Some(port), Some(url_path)) = (
            body.get("ipAddress").and_then(Value::as_str),
            body.get("port").and_then(Value::as_u64),
            body.get("urlPath").and_then(Value::as_str),
        ) else {
            return Err(NodeError::Service(format!(
                "discovery request 'GET {path}' returned invalid response body"
            )));
        };
        Ok(format!("http://{ip}:{port}{url_path}"))
    }

    /// Register this agent as a service instance.
    ///
    /// # Errors
    ///
    /// `NodeError::Service` on any non-2xx answer.
    pub async fn register_service(
        &self,
        id: &str,
        name: &str,
        ip_addr: &str,
        port: u16,
    ) -> Result<()> {
        debug!(service = name, id, "registering service");
        self.put_json(
            "/v1/agent/service/register",
            &serde_json::json!({
                "ID": id,
                "Name": name,
                "Address": ip_addr,
                "Port": port,
            }),
        )
        .await
    }

    /// Register an HTTP health check against a registered service.
    ///
    /// # Errors
    ///
    /// `NodeError::Service` on any non-2xx answer.
    pub async fn register_check(
        &self,
        name: &str,
        service_id: &str,
        http_url: &str,
        interval_secs: u16,
    ) -> Result<()> {
        debug!(check = name, "registering health check");
        self.put_json(
            "/v1/agent/check/register",
            &serde_json::json!({
                "ID": name,
                "Name": name,
                "Interval": format!("{interval_secs}s"),
                // time out just short of the interval
                "Timeout": format!("{}s", interval_secs.saturating_sub(1)),
                "HTTP": http_url,
                "ServiceID": service_id,
                "Status": "passing",
            }),
        )
        .await
    }

    /// # Errors
    ///
    /// `NodeError::Service` on any non-2xx answer.
    pub async fn deregister_service(&self, id: &str) -> Result<()> {
        debug!(id, "deregistering service");
        self.put_empty(&format!("/v1/agent/service/deregister/{id}"))
            .await
    }

    /// # Errors
    ///
    /// `NodeError::Service` on any non-2xx answer.
    pub async fn deregister_check(&self, name: &str) -> Result<()> {
        debug!(check = name, "deregistering health check");
        self.put_empty(&format!("/v1/agent/check/deregister/{name}"))
            .await
    }

    /// Publish the node info document to the KV store. Logs and returns
    /// false on failure rather than erroring; registration decides
    /// whether that is fatal.
    pub async fn update_node_info(&self, node_info: &Value) -> bool {
        let Some(node_id) = node_info.get("id").and_then(Value::as_str) else {
            error!("cannot write node info to discovery: missing 'id' field");
            return false;
        };
        let path = format!("/v1/kv/arras/services/nodes/{node_id}/info");
        match self.put_json(&path, node_info).await {
            Ok(()) => true,
            Err(err) => {
                error!(node_id, %err, "failed to write node info to discovery");
                false
            }
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(NodeError::Service(format!(
                "discovery request 'GET {url}' returned status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn put_json(&self, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.put(&url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(NodeError::Service(format!(
                "discovery request 'PUT {url}' returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn put_empty(&self, path: &str) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.put(&url).send().await?;
        if !response.status().is_success() {
            return Err(NodeError::Service(format!(
                "discovery request 'PUT {url}' returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Rewrite a URL's hostname to a numeric IPv4 address.
///
/// # Errors
///
/// `NodeError::Service` when resolution fails.
pub async fn resolve_numeric_url(url: &str) -> Result<String> {
    let stripped = url.strip_prefix("http://").unwrap_or(url);
    let (host, rest) = match stripped.find([':', '/']) {
        Some(pos) => stripped.split_at(pos),
        None => (stripped, ""),
    };

    // already numeric, or a lookup target
    let ip = if host.parse::<std::net::IpAddr>().is_ok() {
        host.to_owned()
    } else {
        tokio::net::lookup_host((host, 0))
            .await
            .map_err(|err| NodeError::Service(format!("cannot resolve '{host}': {err}")))?
            .find(|addr| addr.is_ipv4())
            .map(|addr| addr.ip().to_string())
            .ok_or_else(|| NodeError::Service(format!("no ipv4 address for '{host}'")))?
    };
    Ok(format!("http://{ip}{rest}"))
}
