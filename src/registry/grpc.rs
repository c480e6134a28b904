// SPDX-License-Identifier: MIT OR Apache-2.0

//! gRPC-mode registration: stream the record to the central registration
//! service and relay its platform events.
//!
//! The registry itself is found through the same dynamic machinery as any
//! other service. A direct `host`/`port` in the configuration wins over the
//! discovery name; the resolved channel is cached until [`Registrar::reset`].

use super::{RegistrationEvent, RegistrationEvents, Registrar, RegistrationRecord};
use crate::api::registration::registration_service_client::RegistrationServiceClient;
use crate::api::registration::{
    HttpEndpoint as ProtoHttpEndpoint, RegisterRequest, RegistrationPhase, UnregisterRequest,
};
use crate::channel::DynamicChannel;
use crate::config::RegistryEndpointSettings;
use crate::discovery::{ServiceInstance, ServiceResolver, StaticBackend};
use crate::error::{Error, Result};
use crate::factory::ClientFactory;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub struct GrpcRegistrar {
    factory: ClientFactory,
    resolver: Arc<ServiceResolver>,
    settings: RegistryEndpointSettings,
    max_message_size: usize,
    channel: Mutex<Option<DynamicChannel>>,
}

impl GrpcRegistrar {
    #[must_use]
    pub fn new(
        factory: ClientFactory,
        resolver: Arc<ServiceResolver>,
        settings: RegistryEndpointSettings,
        max_message_size: usize,
    ) -> Self {
        Self {
            factory,
            resolver,
            settings,
            max_message_size,
            channel: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<RegistrationServiceClient<DynamicChannel>> {
        let mut cached = self.channel.lock().await;
        if cached.is_none() {
            if let Some((host, port)) = self.settings.direct_address() {
                let instance =
                    ServiceInstance::new(host, port).secure(self.settings.tls_enabled);
                self.resolver
                    .ensure_defined(
                        &self.settings.discovery_name,
                        Arc::new(StaticBackend::new(vec![instance])),
                    )
                    .await;
            }
            *cached = Some(self.factory.channel(&self.settings.discovery_name).await?);
        }

        let channel = cached
            .clone()
            .ok_or_else(|| Error::RegistrationTransient("registry channel unavailable".into()))?;
        Ok(RegistrationServiceClient::new(channel)
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size))
    }

    fn event_for(response: &crate::api::registration::RegisterResponse) -> Option<RegistrationEvent> {
        let phase = RegistrationPhase::try_from(response.phase)
            .unwrap_or(RegistrationPhase::Unspecified);
        match phase {
            RegistrationPhase::Started => Some(RegistrationEvent::Started),
            RegistrationPhase::Validated => Some(RegistrationEvent::Validated),
            RegistrationPhase::ConsulRegistered => Some(RegistrationEvent::ConsulRegistered {
                service_id: response.service_id.clone(),
            }),
            RegistrationPhase::HealthCheckConfigured => {
                Some(RegistrationEvent::HealthCheckConfigured)
            }
            RegistrationPhase::ConsulHealthy => Some(RegistrationEvent::ConsulHealthy),
            RegistrationPhase::MetadataRetrieved => Some(RegistrationEvent::MetadataRetrieved),
            RegistrationPhase::SchemaValidated => Some(RegistrationEvent::SchemaValidated),
            RegistrationPhase::DatabaseSaved => Some(RegistrationEvent::DatabaseSaved),
            RegistrationPhase::ApicurioRegistered => Some(RegistrationEvent::ApicurioRegistered),
            RegistrationPhase::Completed => Some(RegistrationEvent::Completed {
                service_id: response.service_id.clone(),
            }),
            RegistrationPhase::Failed => Some(RegistrationEvent::Failed {
                message: response.message.clone(),
                permanent: response.permanent,
            }),
            RegistrationPhase::Unspecified => None,
        }
    }
}

impl From<&RegistrationRecord> for RegisterRequest {
    fn from(record: &RegistrationRecord) -> Self {
        RegisterRequest {
            name: record.name.clone(),
            service_type: record.service_type.as_str().to_string(),
            version: record.version.clone(),
            advertised_host: record.advertised_host.clone(),
            advertised_port: u32::from(record.advertised_port),
            internal_host: record.internal_host.clone().unwrap_or_default(),
            internal_port: record.internal_port.map(u32::from).unwrap_or_default(),
            tls_enabled: record.tls_enabled,
            tags: record.tags.clone(),
            capabilities: record.capabilities.clone(),
            metadata: record
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            http_endpoints: record
                .http_endpoints
                .iter()
                .map(|e| ProtoHttpEndpoint {
                    scheme: e.scheme.clone(),
                    host: e.host.clone(),
                    port: u32::from(e.port),
                    base_path: e.base_path.clone(),
                    health_path: e.health_path.clone(),
                    tls_enabled: e.tls_enabled,
                })
                .collect(),
            grpc_services: record.grpc_services.clone(),
            http_schema: record.http_schema.clone().unwrap_or_default(),
            schema_version: record.schema_version.clone().unwrap_or_default(),
            schema_artifact_id: record.schema_artifact_id.clone().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Registrar for GrpcRegistrar {
    async fn register(&self, record: &RegistrationRecord) -> Result<RegistrationEvents> {
        let mut client = self.client().await?;
        let request = RegisterRequest::from(record);

        let mut stream = client.register(request).await?.into_inner();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let mut completed = false;
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if let Some(event) = GrpcRegistrar::event_for(&response) {
                            let failed = matches!(event, RegistrationEvent::Failed { .. });
                            if matches!(event, RegistrationEvent::Completed { .. }) {
                                completed = true;
                            }
                            if tx.send(event).await.is_err() {
                                return;
                            }
                            if failed {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        // The server closes the stream after its terminal
                        // event; a clean close is not a failure.
                        return;
                    }
                    Err(status) => {
                        let event = if completed {
                            RegistrationEvent::StreamLost {
                                message: status.to_string(),
                            }
                        } else {
                            RegistrationEvent::Failed {
                                message: status.to_string(),
                                permanent: false,
                            }
                        };
                        let _ = tx.send(event).await;
                        return;
                    }
                }
            }
        });

        Ok(RegistrationEvents::new(rx, Some(task)))
    }

    async fn unregister(&self, record: &RegistrationRecord) -> Result<()> {
        let service_id = record.service_id();
        let attempt = async {
            let mut client = self.client().await?;
            client
                .unregister(UnregisterRequest {
                    service_id: service_id.clone(),
                })
                .await
                .map_err(Error::from)
        };

        match tokio::time::timeout(self.settings.timeout, attempt).await {
            Ok(Ok(response)) => {
                tracing::info!(
                    service = %service_id,
                    acknowledged = response.into_inner().acknowledged,
                    "Unregistered from registry"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(service = %service_id, error = %e, "Unregister failed");
            }
            Err(_) => {
                tracing::warn!(service = %service_id, "Unregister timed out");
            }
        }
        Ok(())
    }

    async fn reset(&self) {
        *self.channel.lock().await = None;
        self.factory.evict(&self.settings.discovery_name).await;
        tracing::debug!(
            registry = %self.settings.discovery_name,
            "Reset registry channel"
        );
    }
}
