// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{DiscoveryBackend, ServiceInstance};
use crate::error::Result;
use async_trait::async_trait;

/// Fixed address list. Used for direct `host:port` overrides and for test
/// wiring.
#[derive(Debug, Clone)]
pub struct StaticBackend {
    instances: Vec<ServiceInstance>,
}

impl StaticBackend {
    #[must_use]
    pub fn new(instances: Vec<ServiceInstance>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl DiscoveryBackend for StaticBackend {
    async fn resolve(&self) -> Result<Vec<ServiceInstance>> {
        Ok(self.instances.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}
