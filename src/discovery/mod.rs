// SPDX-License-Identifier: MIT OR Apache-2.0

//! Service discovery: map a logical service name to a current list of
//! reachable instances.
//!
//! Backends are pluggable behind [`DiscoveryBackend`]; the [`ServiceResolver`]
//! keeps the name → backend table and applies the backend selection rules
//! when a name is first defined. The resolver itself never caches instance
//! lists — channel caching lives one layer up.

mod consul;
mod dns;
mod static_list;

pub use consul::ConsulBackend;
pub use dns::DnsBackend;
pub use static_list::StaticBackend;

use crate::config::{BackendKind, ConsulSettings, DynamicGrpcSettings, ServiceOverride};
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One reachable endpoint of a logical service. Produced per resolve call,
/// never shared across resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
    pub secure: bool,
}

impl ServiceInstance {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            metadata: HashMap::new(),
            secure: false,
        }
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// `host:port` form used for dialing and logging.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split and validate a `host:port` pair. Rejection is a defined error, not
/// a fallback.
pub fn parse_address(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(value.to_string()))?;

    if host.is_empty() {
        return Err(Error::InvalidAddress(value.to_string()));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAddress(value.to_string()))?;
    if port == 0 {
        return Err(Error::InvalidAddress(value.to_string()));
    }

    Ok((host.to_string(), port))
}

/// A discovery backend yields the current instances of one logical service.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn resolve(&self) -> Result<Vec<ServiceInstance>>;

    /// Stable tag for logs and metrics.
    fn kind(&self) -> &'static str;
}

/// The name → backend table. Definitions are immutable for the process
/// lifetime; redefinition is idempotent.
pub struct ServiceResolver {
    consul: ConsulSettings,
    overrides: HashMap<String, ServiceOverride>,
    table: RwLock<HashMap<String, Arc<dyn DiscoveryBackend>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ServiceResolver {
    #[must_use]
    pub fn new(settings: &DynamicGrpcSettings, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            consul: settings.consul.clone(),
            overrides: settings.services.clone(),
            table: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Define `name` with an explicit backend. A second definition for the
    /// same name is a no-op; the first one wins.
    pub async fn ensure_defined(&self, name: &str, backend: Arc<dyn DiscoveryBackend>) {
        let mut table = self.table.write().await;
        match table.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(existing) => {
                if existing.get().kind() != backend.kind() {
                    tracing::warn!(
                        service = %name,
                        existing = existing.get().kind(),
                        requested = backend.kind(),
                        "Service already defined with a different backend; keeping the first"
                    );
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                tracing::debug!(service = %name, backend = backend.kind(), "Defined service");
                slot.insert(backend);
            }
        }
    }

    /// Define `name` from configuration, applying the selection order:
    /// direct address override, then explicit backend keys, then the
    /// process-global Consul fallback.
    pub async fn ensure_defined_from_config(&self, name: &str) -> Result<()> {
        {
            let table = self.table.read().await;
            if table.contains_key(name) {
                return Ok(());
            }
        }

        let backend = self.backend_from_config(name)?;
        self.ensure_defined(name, backend).await;
        Ok(())
    }

    fn backend_from_config(&self, name: &str) -> Result<Arc<dyn DiscoveryBackend>> {
        let service = self.overrides.get(name);

        if let Some(address) = service.and_then(|s| s.address.as_deref()) {
            let (host, port) = parse_address(address)?;
            let secure = service.and_then(|s| s.secure).unwrap_or(false);
            let instance = ServiceInstance::new(host, port).secure(secure);
            return Ok(Arc::new(StaticBackend::new(vec![instance])));
        }

        if let Some(service) = service {
            match service.backend {
                Some(BackendKind::Static) => {
                    let secure = service.secure.unwrap_or(false);
                    let instances = service
                        .addresses
                        .iter()
                        .map(|a| {
                            parse_address(a)
                                .map(|(host, port)| ServiceInstance::new(host, port).secure(secure))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(Arc::new(StaticBackend::new(instances)));
                }
                Some(BackendKind::Consul) => {
                    let consul_name = service.service_name.clone().unwrap_or_else(|| name.into());
                    return Ok(Arc::new(ConsulBackend::new(&self.consul, consul_name)));
                }
                Some(BackendKind::Kubernetes) => {
                    let service_name =
                        service.service_name.clone().unwrap_or_else(|| name.into());
                    let port = service.port.ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "dynamic-grpc.services.{name}: kubernetes backend requires a port"
                        ))
                    })?;
                    return Ok(Arc::new(DnsBackend::new(
                        service_name,
                        service.namespace.clone(),
                        port,
                        service.secure.unwrap_or(false),
                    )));
                }
                None => {
                    if !service.addresses.is_empty() {
                        let secure = service.secure.unwrap_or(false);
                        let instances = service
                            .addresses
                            .iter()
                            .map(|a| {
                                parse_address(a).map(|(host, port)| {
                                    ServiceInstance::new(host, port).secure(secure)
                                })
                            })
                            .collect::<Result<Vec<_>>>()?;
                        return Ok(Arc::new(StaticBackend::new(instances)));
                    }
                }
            }
        }

        Ok(Arc::new(ConsulBackend::new(
            &self.consul,
            name.to_string(),
        )))
    }

    /// Current instances of `name`. `Ok(vec![])` means defined but no
    /// healthy instance.
    pub async fn resolve(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let backend = {
            let table = self.table.read().await;
            table
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ServiceUnknown(name.to_string()))?
        };

        match backend.resolve().await {
            Ok(instances) => {
                let result = if instances.is_empty() { "empty" } else { "success" };
                self.metrics.discovery_attempt(name, result);
                tracing::debug!(
                    service = %name,
                    backend = backend.kind(),
                    count = instances.len(),
                    "Resolved service"
                );
                Ok(instances)
            }
            Err(e @ Error::DiscoveryFailure { .. }) => {
                self.metrics.discovery_attempt(name, "failure");
                Err(e)
            }
            Err(e) => {
                self.metrics.discovery_attempt(name, "failure");
                Err(Error::DiscoveryFailure {
                    service: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Whether `name` has been defined.
    pub async fn is_defined(&self, name: &str) -> bool {
        self.table.read().await.contains_key(name)
    }
}
