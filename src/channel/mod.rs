// SPDX-License-Identifier: MIT OR Apache-2.0

//! The channel cache: one multiplexed gRPC channel per logical service name,
//! bounded in size, evicted when idle.
//!
//! Channels connect lazily; creating one never blocks on the network, only
//! discovery does. Eviction drops the cache entry — callers still holding a
//! clone finish their calls on it, which is the graceful half of shutdown;
//! the transport closes once the last clone goes away.

mod auth;
mod dynamic;
mod tls;

pub use auth::{
    current_call_token, with_call_token, AmbientTokenProvider, AuthInterceptor,
    CallTokenProvider, StaticTokenProvider,
};
pub use dynamic::DynamicChannel;
pub use tls::client_config as tls_client_config;

use crate::config::{ChannelCacheSettings, DynamicGrpcSettings, TlsPolicy};
use crate::discovery::{ServiceInstance, ServiceResolver};
use crate::error::{Error, Result};
use crate::metrics::{EvictionReason, MetricsSink};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint, Uri};

struct CacheEntry {
    channel: DynamicChannel,
    created_at: Instant,
    last_used_at: Instant,
}

/// Per-entry view for `stats()`.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub service: String,
    pub instances: usize,
    pub age: Duration,
    pub idle: Duration,
}

pub struct ChannelManager {
    resolver: Arc<ServiceResolver>,
    settings: ChannelCacheSettings,
    tls: TlsPolicy,
    auth: Option<Arc<AuthInterceptor>>,
    connection_window: Option<u32>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    metrics: Arc<dyn MetricsSink>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ChannelManager {
    /// Build a manager from the `dynamic-grpc.*` settings. The ambient token
    /// provider backs the auth header unless the caller supplies another.
    pub fn new(
        resolver: Arc<ServiceResolver>,
        settings: &DynamicGrpcSettings,
        connection_window: Option<u32>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        Self::with_token_provider(
            resolver,
            settings,
            connection_window,
            metrics,
            Arc::new(AmbientTokenProvider),
        )
    }

    pub fn with_token_provider(
        resolver: Arc<ServiceResolver>,
        settings: &DynamicGrpcSettings,
        connection_window: Option<u32>,
        metrics: Arc<dyn MetricsSink>,
        tokens: Arc<dyn CallTokenProvider>,
    ) -> Result<Self> {
        let auth = AuthInterceptor::from_policy(&settings.auth, tokens)?.map(Arc::new);
        Ok(Self {
            resolver,
            settings: settings.channel.clone(),
            tls: settings.tls.clone(),
            auth,
            connection_window,
            cache: Mutex::new(HashMap::new()),
            metrics,
            sweeper: std::sync::Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Start the periodic idle sweep. Runs at a quarter of the idle TTL so a
    /// stale entry outlives its TTL by at most 25 %.
    pub fn spawn_idle_sweeper(self: Arc<Self>) {
        let period = (self.settings.idle_ttl / 4).max(Duration::from_millis(10));
        let manager = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_idle().await;
            }
        });
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    /// Cached channel for `name`, creating one if needed.
    pub async fn get(&self, name: &str) -> Result<DynamicChannel> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }

        self.resolver.ensure_defined_from_config(name).await?;

        {
            let mut cache = self.cache.lock().await;
            let fresh = cache
                .get(name)
                .map(|entry| entry.last_used_at.elapsed() <= self.settings.idle_ttl);
            match fresh {
                Some(true) => {
                    if let Some(entry) = cache.get_mut(name) {
                        entry.last_used_at = Instant::now();
                        self.metrics.cache_hit(name);
                        return Ok(entry.channel.clone());
                    }
                }
                Some(false) => {
                    cache.remove(name);
                    self.metrics
                        .channel_evicted(name, EvictionReason::TtlExpired);
                    self.update_gauges(cache.len());
                    tracing::debug!(service = %name, "Evicted idle channel");
                }
                None => {}
            }
        }

        self.metrics.cache_miss(name);

        // Build outside the lock; discovery and TLS setup may take a while.
        let channel = self.build_channel(name).await?;
        self.metrics.channel_created(name);

        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get_mut(name) {
            // Lost the insertion race; drop ours and adopt the winner.
            existing.last_used_at = Instant::now();
            return Ok(existing.channel.clone());
        }

        if cache.len() >= self.settings.max_size {
            if let Some(lru) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_used_at)
                .map(|(key, _)| key.clone())
            {
                cache.remove(&lru);
                self.metrics
                    .channel_evicted(&lru, EvictionReason::SizeLimit);
                tracing::debug!(service = %lru, "Evicted least-recently-used channel");
            }
        }

        let now = Instant::now();
        cache.insert(
            name.to_string(),
            CacheEntry {
                channel: channel.clone(),
                created_at: now,
                last_used_at: now,
            },
        );
        self.update_gauges(cache.len());
        Ok(channel)
    }

    /// Force-remove one entry.
    pub async fn evict(&self, name: &str) {
        let mut cache = self.cache.lock().await;
        if cache.remove(name).is_some() {
            self.metrics.channel_evicted(name, EvictionReason::Manual);
            self.update_gauges(cache.len());
            tracing::debug!(service = %name, "Evicted channel");
        }
    }

    /// Drop every entry and stop the sweeper. Bounded by the configured
    /// shutdown timeout.
    pub async fn shutdown_all(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        let drain = async {
            let mut cache = self.cache.lock().await;
            for (name, _) in cache.drain() {
                self.metrics
                    .channel_evicted(&name, EvictionReason::ProcessShutdown);
            }
            self.update_gauges(0);
        };
        if tokio::time::timeout(self.settings.shutdown_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!("Channel cache drain exceeded the shutdown timeout");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn stats(&self) -> Vec<ChannelInfo> {
        let cache = self.cache.lock().await;
        cache
            .iter()
            .map(|(name, entry)| ChannelInfo {
                service: name.clone(),
                instances: entry.channel.instance_count(),
                age: entry.created_at.elapsed(),
                idle: entry.last_used_at.elapsed(),
            })
            .collect()
    }

    /// The cache settings in effect; stub factories read message-size limits
    /// from here.
    #[must_use]
    pub fn settings(&self) -> &ChannelCacheSettings {
        &self.settings
    }

    async fn sweep_idle(&self) {
        let mut cache = self.cache.lock().await;
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.last_used_at.elapsed() > self.settings.idle_ttl)
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            cache.remove(&name);
            self.metrics
                .channel_evicted(&name, EvictionReason::TtlExpired);
            tracing::debug!(service = %name, "Swept idle channel");
        }
        self.update_gauges(cache.len());
    }

    fn update_gauges(&self, size: usize) {
        self.metrics.set_cache_size(size as u64);
        self.metrics.set_active_channels(size as u64);
    }

    async fn build_channel(&self, name: &str) -> Result<DynamicChannel> {
        let instances = self.resolver.resolve(name).await?;
        if instances.is_empty() {
            return Err(Error::Unavailable(name.to_string()));
        }

        let channels = instances
            .iter()
            .map(|instance| self.connect_instance(name, instance))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            service = %name,
            instances = channels.len(),
            "Created channel"
        );
        Ok(DynamicChannel::new(channels, self.auth.clone()))
    }

    fn connect_instance(&self, name: &str, instance: &ServiceInstance) -> Result<Channel> {
        let mut endpoint = Endpoint::from_shared(format!("http://{}", instance.authority()))
            .map_err(|e| Error::ChannelCreate {
                service: name.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(window) = self.connection_window {
            endpoint = endpoint
                .initial_connection_window_size(window)
                .initial_stream_window_size(window);
        }

        if self.tls.enabled || instance.secure {
            let tls_config = tls::client_config(&self.tls).map_err(|e| Error::ChannelCreate {
                service: name.to_string(),
                reason: e.to_string(),
            })?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
            let sni_host = instance.host.clone();
            let fallback_port = instance.port;

            Ok(endpoint.connect_with_connector_lazy(tower::service_fn(move |uri: Uri| {
                let connector = connector.clone();
                let sni_host = sni_host.clone();
                async move {
                    let host = uri.host().unwrap_or("127.0.0.1").to_string();
                    let port = uri.port_u16().unwrap_or(fallback_port);
                    let tcp = tokio::net::TcpStream::connect((host.as_str(), port)).await?;

                    // SNI carries the discovered hostname, which matters for
                    // certificate verification behind load balancers.
                    let server_name = ServerName::try_from(sni_host.clone())
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                    let tls_stream = connector.connect(server_name, tcp).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(tls_stream))
                }
            })))
        } else {
            Ok(endpoint.connect_lazy())
        }
    }
}
