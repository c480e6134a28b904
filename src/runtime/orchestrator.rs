// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic wiring: resolver → channel manager → factory → registrar →
//! lifecycle, with shutdown in reverse order.

use crate::channel::ChannelManager;
use crate::config::{RegistrationMode, Settings};
use crate::discovery::ServiceResolver;
use crate::error::Result;
use crate::factory::ClientFactory;
use crate::lifecycle::{
    ExitFatalHandler, FatalHandler, ReadinessGate, RegistrationLifecycle,
};
use crate::metadata::{self, ServerInfo};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::registry::{ConsulRegistrar, GrpcRegistrar, RegistrationRecord, Registrar};
use std::sync::Arc;

pub struct Orchestrator {
    resolver: Arc<ServiceResolver>,
    channels: Arc<ChannelManager>,
    factory: ClientFactory,
    lifecycle: Arc<RegistrationLifecycle>,
    readiness: ReadinessGate,
    metrics: Arc<dyn MetricsSink>,
}

impl Orchestrator {
    /// Wire and start everything with no metrics backend and the default
    /// process-exit fatal handler.
    pub async fn start(settings: Settings, server: ServerInfo) -> Result<Self> {
        Self::start_with(settings, server, Arc::new(NoopMetrics), Arc::new(ExitFatalHandler)).await
    }

    /// Full wiring with injectable metrics sink and fatal handler. The
    /// lifecycle starts last; `shutdown` runs in reverse.
    pub async fn start_with(
        settings: Settings,
        server: ServerInfo,
        metrics: Arc<dyn MetricsSink>,
        fatal: Arc<dyn FatalHandler>,
    ) -> Result<Self> {
        settings.validate()?;

        let resolver = Arc::new(ServiceResolver::new(&settings.dynamic_grpc, metrics.clone()));
        let channels = Arc::new(ChannelManager::new(
            resolver.clone(),
            &settings.dynamic_grpc,
            settings.server.effective_connection_window(),
            metrics.clone(),
        )?);
        channels.clone().spawn_idle_sweeper();
        let factory = ClientFactory::new(channels.clone(), metrics.clone());

        let record = if settings.registration.enabled {
            metadata::collect(&settings, &server)?
        } else {
            // Never registered; the lifecycle start is a no-op.
            RegistrationRecord::new(
                settings
                    .application
                    .name
                    .clone()
                    .unwrap_or_else(|| "unknown-service".to_string()),
                "localhost",
                1,
            )
        };

        let consul = &settings.dynamic_grpc.consul;
        let (registrar, registry_endpoint): (Arc<dyn Registrar>, String) =
            match settings.registration.mode {
                RegistrationMode::Direct => (
                    Arc::new(ConsulRegistrar::new(consul)),
                    format!("consul {}", consul.agent_url()),
                ),
                RegistrationMode::Grpc => {
                    let endpoint = &settings.registration.registration_service;
                    let location = match endpoint.direct_address() {
                        Some((host, port)) => {
                            format!("{} @ {host}:{port}", endpoint.discovery_name)
                        }
                        None => format!(
                            "{} via consul {}",
                            endpoint.discovery_name,
                            consul.agent_url()
                        ),
                    };
                    (
                        Arc::new(GrpcRegistrar::new(
                            factory.clone(),
                            resolver.clone(),
                            endpoint.clone(),
                            settings.dynamic_grpc.channel.max_message_size,
                        )),
                        location,
                    )
                }
            };

        let lifecycle = RegistrationLifecycle::with_fatal_handler(
            settings.registration.clone(),
            record,
            registrar,
            registry_endpoint,
            fatal,
        );
        let readiness = ReadinessGate::new(lifecycle.clone());

        lifecycle.clone().start().await;

        Ok(Self {
            resolver,
            channels,
            factory,
            lifecycle,
            readiness,
            metrics,
        })
    }

    #[must_use]
    pub fn factory(&self) -> &ClientFactory {
        &self.factory
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<ServiceResolver> {
        &self.resolver
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<RegistrationLifecycle> {
        &self.lifecycle
    }

    #[must_use]
    pub fn readiness(&self) -> &ReadinessGate {
        &self.readiness
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Reverse-order teardown: deregister first, then drain the channel
    /// cache.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
        self.channels.shutdown_all().await;
    }
}
