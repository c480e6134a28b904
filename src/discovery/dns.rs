// SPDX-License-Identifier: MIT OR Apache-2.0

//! Kubernetes-style discovery through DNS.
//!
//! A headless service exposes one A record per ready pod, so resolving
//! `{service}.{namespace}.svc` yields the current instance set. Plain
//! cluster DNS names and external hostnames work the same way.

use super::{DiscoveryBackend, ServiceInstance};
use crate::error::{Error, Result};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct DnsBackend {
    authority: String,
    port: u16,
    secure: bool,
}

impl DnsBackend {
    #[must_use]
    pub fn new(service: String, namespace: Option<String>, port: u16, secure: bool) -> Self {
        let authority = match namespace {
            Some(ns) => format!("{service}.{ns}.svc"),
            None => service,
        };
        Self {
            authority,
            port,
            secure,
        }
    }

    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

#[async_trait]
impl DiscoveryBackend for DnsBackend {
    async fn resolve(&self) -> Result<Vec<ServiceInstance>> {
        let addrs = tokio::net::lookup_host((self.authority.as_str(), self.port))
            .await
            .map_err(|e| Error::DiscoveryFailure {
                service: self.authority.clone(),
                reason: e.to_string(),
            })?;

        let mut instances: Vec<ServiceInstance> = addrs
            .map(|addr| ServiceInstance::new(addr.ip().to_string(), addr.port()).secure(self.secure))
            .collect();
        instances.sort_by(|a, b| a.host.cmp(&b.host));
        instances.dedup();
        Ok(instances)
    }

    fn kind(&self) -> &'static str {
        "kubernetes"
    }
}
