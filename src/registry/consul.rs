// SPDX-License-Identifier: MIT OR Apache-2.0

//! Direct-mode registration into the local Consul agent.
//!
//! The agent upserts on repeated registration, so re-registration is just
//! another PUT. Health is aggregated by the agent with AND semantics: the
//! `/v1/agent/health/service/id/{id}` endpoint reports passing only when
//! every installed check passes.

use super::{RegistrationEvent, RegistrationEvents, Registrar, RegistrationRecord};
use super::record::join_health_path;
use crate::config::ConsulSettings;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

const CHECK_INTERVAL: &str = "10s";
const DEREGISTER_AFTER: &str = "1m";
const UNREGISTER_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConsulRegistrar {
    http: reqwest::Client,
    base_url: String,
    healthy_timeout: Duration,
    poll_interval: Duration,
}

impl ConsulRegistrar {
    #[must_use]
    pub fn new(settings: &ConsulSettings) -> Self {
        // Per-request deadline on every agent call, health polls included.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: settings.agent_url(),
            healthy_timeout: Duration::from_secs(60),
            poll_interval: settings.refresh_period,
        }
    }

    /// How long to wait for all checks to pass before rolling back.
    #[must_use]
    pub fn with_healthy_timeout(mut self, timeout: Duration) -> Self {
        self.healthy_timeout = timeout;
        self
    }

    /// The agent payload for one record.
    #[must_use]
    pub fn register_payload(record: &RegistrationRecord) -> serde_json::Value {
        let (address, port) = record.backend_address();
        json!({
            "ID": record.service_id(),
            "Name": record.name,
            "Address": address,
            "Port": port,
            "Tags": record.backend_tags(),
            "Meta": record.backend_metadata(),
            "Checks": Self::checks(record),
        })
    }

    /// One gRPC check for the bare service, one per advertised gRPC service,
    /// and at most one HTTP check from the first endpoint with a health path.
    fn checks(record: &RegistrationRecord) -> Vec<serde_json::Value> {
        let target = format!("{}:{}", record.advertised_host, record.advertised_port);
        let mut checks = vec![json!({
            "Name": "grpc",
            "GRPC": target,
            "GRPCUseTLS": record.tls_enabled,
            "Interval": CHECK_INTERVAL,
            "DeregisterCriticalServiceAfter": DEREGISTER_AFTER,
        })];

        for service in &record.grpc_services {
            checks.push(json!({
                "Name": format!("grpc {service}"),
                "GRPC": format!("{target}/{service}"),
                "GRPCUseTLS": record.tls_enabled,
                "Interval": CHECK_INTERVAL,
                "DeregisterCriticalServiceAfter": DEREGISTER_AFTER,
            }));
        }

        if let Some(endpoint) = record
            .http_endpoints
            .iter()
            .find(|e| !e.health_path.is_empty())
        {
            let url = if endpoint.health_path.contains("://") {
                endpoint.health_path.clone()
            } else {
                format!(
                    "{}://{}:{}{}",
                    endpoint.scheme,
                    endpoint.host,
                    endpoint.port,
                    join_health_path(&endpoint.base_path, &endpoint.health_path)
                )
            };
            let mut check = json!({
                "Name": "http",
                "HTTP": url,
                "Interval": CHECK_INTERVAL,
                "DeregisterCriticalServiceAfter": DEREGISTER_AFTER,
            });
            if endpoint.tls_enabled {
                check["TLSSkipVerify"] = json!(true);
            }
            checks.push(check);
        }

        checks
    }

    async fn put_registration(&self, record: &RegistrationRecord) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let response = self
            .http
            .put(&url)
            .json(&Self::register_payload(record))
            .send()
            .await
            .map_err(|e| Error::RegistrationTransient(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else if response.status().is_client_error() {
            Err(Error::RegistrationPermanent(format!(
                "Consul rejected the registration: {}",
                response.status()
            )))
        } else {
            Err(Error::RegistrationTransient(format!(
                "Consul registration returned {}",
                response.status()
            )))
        }
    }

    async fn wait_healthy(&self, service_id: &str) -> Result<()> {
        let url = format!(
            "{}/v1/agent/health/service/id/{}",
            self.base_url, service_id
        );
        let deadline = tokio::time::Instant::now() + self.healthy_timeout;

        loop {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    tracing::debug!(
                        service = %service_id,
                        status = %response.status(),
                        "Health checks not passing yet"
                    );
                }
                Err(e) => {
                    tracing::debug!(service = %service_id, error = %e, "Health poll failed");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::RegistrationTransient(format!(
                    "Health checks for {service_id} did not pass within {:?}",
                    self.healthy_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url, service_id
        );
        let response = self
            .http
            .put(&url)
            .send()
            .await
            .map_err(|e| Error::RegistrationTransient(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::RegistrationTransient(format!(
                "Consul deregister returned {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl Registrar for ConsulRegistrar {
    async fn register(&self, record: &RegistrationRecord) -> Result<RegistrationEvents> {
        let registrar = self.clone();
        let record = record.clone();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let service_id = record.service_id();
            let _ = tx.send(RegistrationEvent::Started).await;

            if !record.is_valid() {
                let _ = tx
                    .send(RegistrationEvent::Failed {
                        message: format!(
                            "Invalid registration record: name={:?} host={:?} port={}",
                            record.name, record.advertised_host, record.advertised_port
                        ),
                        permanent: true,
                    })
                    .await;
                return;
            }
            let _ = tx.send(RegistrationEvent::Validated).await;

            match registrar.put_registration(&record).await {
                Ok(()) => {
                    tracing::info!(service = %service_id, "Registered with Consul");
                }
                Err(e) => {
                    let permanent = matches!(e, Error::RegistrationPermanent(_));
                    let _ = tx
                        .send(RegistrationEvent::Failed {
                            message: e.to_string(),
                            permanent,
                        })
                        .await;
                    return;
                }
            }
            let _ = tx
                .send(RegistrationEvent::ConsulRegistered {
                    service_id: service_id.clone(),
                })
                .await;
            // Checks ride along with the registration PUT.
            let _ = tx.send(RegistrationEvent::HealthCheckConfigured).await;

            match registrar.wait_healthy(&service_id).await {
                Ok(()) => {
                    let _ = tx.send(RegistrationEvent::ConsulHealthy).await;
                    let _ = tx
                        .send(RegistrationEvent::Completed {
                            service_id: service_id.clone(),
                        })
                        .await;
                }
                Err(e) => {
                    // Roll back the half-registered service.
                    if let Err(rollback) = registrar.deregister(&service_id).await {
                        tracing::warn!(
                            service = %service_id,
                            error = %rollback,
                            "Rollback deregistration failed"
                        );
                    }
                    let _ = tx
                        .send(RegistrationEvent::Failed {
                            message: e.to_string(),
                            permanent: false,
                        })
                        .await;
                }
            }
        });

        Ok(RegistrationEvents::new(rx, Some(task)))
    }

    async fn unregister(&self, record: &RegistrationRecord) -> Result<()> {
        let service_id = record.service_id();
        match tokio::time::timeout(UNREGISTER_DEADLINE, self.deregister(&service_id)).await {
            Ok(Ok(())) => {
                tracing::info!(service = %service_id, "Deregistered from Consul");
            }
            Ok(Err(e)) => {
                tracing::warn!(service = %service_id, error = %e, "Deregistration failed");
            }
            Err(_) => {
                tracing::warn!(service = %service_id, "Deregistration timed out");
            }
        }
        Ok(())
    }
}
