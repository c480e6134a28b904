// SPDX-License-Identifier: MIT OR Apache-2.0

//! The public client-facing surface: logical name in, channel or typed stub
//! out.

use crate::channel::{ChannelInfo, ChannelManager, DynamicChannel};
use crate::config::ChannelCacheSettings;
use crate::error::Result;
use crate::metrics::{timed, MetricsSink};
use std::sync::Arc;

#[derive(Clone)]
pub struct ClientFactory {
    channels: Arc<ChannelManager>,
    metrics: Arc<dyn MetricsSink>,
}

impl ClientFactory {
    #[must_use]
    pub fn new(channels: Arc<ChannelManager>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { channels, metrics }
    }

    /// Resolve `name` to a live channel, from cache when possible.
    pub async fn channel(&self, name: &str) -> Result<DynamicChannel> {
        let result = timed(&*self.metrics, "get_channel", self.channels.get(name)).await;
        if let Err(e) = &result {
            self.metrics.exception(e.kind(), name, "get_channel");
            tracing::warn!(service = %name, error = %e, "Failed to obtain channel");
        }
        result
    }

    /// Resolve `name` and wrap the channel in a typed stub:
    ///
    /// ```ignore
    /// let client = factory
    ///     .client("orders", OrdersServiceClient::new)
    ///     .await?;
    /// ```
    pub async fn client<T, F>(&self, name: &str, stub: F) -> Result<T>
    where
        F: FnOnce(DynamicChannel) -> T,
    {
        let result = timed(&*self.metrics, "get_client", self.channels.get(name)).await;
        match result {
            Ok(channel) => {
                self.metrics.client_created(name);
                Ok(stub(channel))
            }
            Err(e) => {
                self.metrics.exception(e.kind(), name, "get_client");
                tracing::warn!(service = %name, error = %e, "Failed to build client");
                Err(e)
            }
        }
    }

    /// Drop the cached channel for `name`, if any.
    pub async fn evict(&self, name: &str) {
        self.channels.evict(name).await;
    }

    /// Number of cached channels.
    pub async fn active_count(&self) -> usize {
        self.channels.active_count().await
    }

    /// Per-entry cache details.
    pub async fn stats(&self) -> Vec<ChannelInfo> {
        self.channels.stats().await
    }

    /// Channel settings in effect, including the message-size limit stub
    /// factories should apply.
    #[must_use]
    pub fn settings(&self) -> &ChannelCacheSettings {
        self.channels.settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicGrpcSettings;
    use crate::discovery::{ServiceInstance, ServiceResolver, StaticBackend};
    use crate::error::Error;
    use crate::metrics::AtomicMetrics;

    async fn factory_with(instances: Vec<ServiceInstance>) -> (ClientFactory, Arc<AtomicMetrics>) {
        let metrics = Arc::new(AtomicMetrics::with_defaults());
        let settings = DynamicGrpcSettings::default();
        let resolver = Arc::new(ServiceResolver::new(&settings, metrics.clone()));
        resolver
            .ensure_defined("svc", Arc::new(StaticBackend::new(instances)))
            .await;
        let channels =
            Arc::new(ChannelManager::new(resolver, &settings, None, metrics.clone()).unwrap());
        (ClientFactory::new(channels, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn client_applies_the_stub_factory() {
        let (factory, metrics) = factory_with(vec![ServiceInstance::new("127.0.0.1", 50051)]).await;

        let stub = factory
            .client("svc", |channel| format!("stub({})", channel.instance_count()))
            .await
            .unwrap();
        assert_eq!(stub, "stub(1)");
        assert_eq!(metrics.counter_total("client_created_total"), 1);
    }

    #[tokio::test]
    async fn failures_are_tagged_with_service_and_operation() {
        let (factory, metrics) = factory_with(Vec::new()).await;

        let err = factory.channel("svc").await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(
            metrics.counter_with(
                "exceptions_total",
                &[
                    ("exception", "unavailable"),
                    ("service", "svc"),
                    ("operation", "get_channel")
                ]
            ),
            1
        );
    }

    #[tokio::test]
    async fn evict_clears_the_entry() {
        let (factory, _) = factory_with(vec![ServiceInstance::new("127.0.0.1", 50051)]).await;

        factory.channel("svc").await.unwrap();
        assert_eq!(factory.active_count().await, 1);
        factory.evict("svc").await;
        assert_eq!(factory.active_count().await, 0);
    }
}
