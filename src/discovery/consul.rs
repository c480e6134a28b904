// SPDX-License-Identifier: MIT OR Apache-2.0

//! Consul-backed discovery via the local agent's HTTP API.
//!
//! With `use-health-checks` enabled, only instances whose checks pass are
//! returned (`/v1/health/service/{name}?passing=true`); otherwise the raw
//! catalog is used and instances are visible immediately after registration.

use super::{DiscoveryBackend, ServiceInstance};
use crate::config::ConsulSettings;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConsulBackend {
    http: reqwest::Client,
    base_url: String,
    service: String,
    use_health_checks: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogEntry {
    address: String,
    #[serde(default)]
    service_address: String,
    service_port: u16,
    #[serde(default)]
    service_meta: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    meta: HashMap<String, String>,
}

impl ConsulBackend {
    #[must_use]
    pub fn new(settings: &ConsulSettings, service: String) -> Self {
        let timeout = settings.refresh_period.max(Duration::from_secs(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: settings.agent_url(),
            service,
            use_health_checks: settings.use_health_checks,
        }
    }

    fn failure(&self, reason: impl std::fmt::Display) -> Error {
        Error::DiscoveryFailure {
            service: self.service.clone(),
            reason: reason.to_string(),
        }
    }

    fn instance(node_address: &str, service_address: &str, port: u16, meta: &HashMap<String, String>) -> ServiceInstance {
        // ServiceAddress takes precedence; fall back to the node address.
        let host = if service_address.is_empty() {
            node_address.to_string()
        } else {
            service_address.to_string()
        };
        let secure = meta.get("secure").map(|v| v == "true").unwrap_or(false);
        ServiceInstance {
            host,
            port,
            metadata: meta.clone(),
            secure,
        }
    }

    async fn resolve_health(&self) -> Result<Vec<ServiceInstance>> {
        let url = format!(
            "{}/v1/health/service/{}?passing=true",
            self.base_url, self.service
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.failure(e))?;
        if !response.status().is_success() {
            return Err(self.failure(format!("health query returned {}", response.status())));
        }
        let entries: Vec<HealthEntry> = response.json().await.map_err(|e| self.failure(e))?;
        Ok(entries
            .iter()
            .map(|e| {
                Self::instance(
                    &e.node.address,
                    &e.service.address,
                    e.service.port,
                    &e.service.meta,
                )
            })
            .collect())
    }

    async fn resolve_catalog(&self) -> Result<Vec<ServiceInstance>> {
        let url = format!("{}/v1/catalog/service/{}", self.base_url, self.service);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.failure(e))?;
        if !response.status().is_success() {
            return Err(self.failure(format!("catalog query returned {}", response.status())));
        }
        let entries: Vec<CatalogEntry> = response.json().await.map_err(|e| self.failure(e))?;
        Ok(entries
            .iter()
            .map(|e| {
                Self::instance(
                    &e.address,
                    &e.service_address,
                    e.service_port,
                    &e.service_meta,
                )
            })
            .collect())
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulBackend {
    async fn resolve(&self) -> Result<Vec<ServiceInstance>> {
        if self.use_health_checks {
            self.resolve_health().await
        } else {
            self.resolve_catalog().await
        }
    }

    fn kind(&self) -> &'static str {
        "consul"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_address_takes_precedence() {
        let meta = HashMap::new();
        let instance = ConsulBackend::instance("10.0.1.5", "10.0.2.7", 7000, &meta);
        assert_eq!(instance.authority(), "10.0.2.7:7000");
    }

    #[test]
    fn empty_service_address_falls_back_to_node() {
        let meta = HashMap::new();
        let instance = ConsulBackend::instance("10.0.1.5", "", 7000, &meta);
        assert_eq!(instance.authority(), "10.0.1.5:7000");
    }

    #[test]
    fn secure_flag_comes_from_meta() {
        let mut meta = HashMap::new();
        meta.insert("secure".to_string(), "true".to_string());
        let instance = ConsulBackend::instance("10.0.1.5", "", 7000, &meta);
        assert!(instance.secure);

        meta.insert("secure".to_string(), "false".to_string());
        let instance = ConsulBackend::instance("10.0.1.5", "", 7000, &meta);
        assert!(!instance.secure);
    }

    #[test]
    fn catalog_entry_deserializes_consul_shape() {
        let json = serde_json::json!([{
            "Node": "worker-1",
            "Address": "10.0.1.5",
            "ServiceAddress": "10.0.1.5",
            "ServicePort": 7000,
            "ServiceName": "orders",
            "ServiceID": "orders-10.0.1.5-7000",
            "ServiceMeta": {"secure": "false"}
        }]);
        let entries: Vec<CatalogEntry> = serde_json::from_value(json).unwrap();
        assert_eq!(entries[0].service_port, 7000);
        assert_eq!(entries[0].service_meta["secure"], "false");
    }

    #[test]
    fn health_entry_deserializes_consul_shape() {
        let json = serde_json::json!([{
            "Node": {"Node": "worker-1", "Address": "10.0.1.5"},
            "Service": {"ID": "orders-h-9000", "Service": "orders", "Address": "", "Port": 9000},
            "Checks": []
        }]);
        let entries: Vec<HealthEntry> = serde_json::from_value(json).unwrap();
        assert_eq!(entries[0].node.address, "10.0.1.5");
        assert_eq!(entries[0].service.port, 9000);
    }
}
