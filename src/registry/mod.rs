// SPDX-License-Identifier: MIT OR Apache-2.0

//! Registration against a discovery backend.
//!
//! A [`Registrar`] turns a [`RegistrationRecord`] into a lazy sequence of
//! [`RegistrationEvent`]s ending in `Completed` or `Failed`. The lifecycle
//! manager interprets the events; registrars only report what happened.

mod consul;
mod grpc;
mod record;

pub use consul::ConsulRegistrar;
pub use grpc::GrpcRegistrar;
pub use record::{
    is_reserved_grpc_service, join_health_path, sanitize_metadata, HttpEndpoint,
    RegistrationRecord, RESERVED_GRPC_SERVICES,
};

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Platform events observed during one registration attempt. The terminal
/// event (`Completed` or `Failed`) is the last one a well-behaved attempt
/// emits; `StreamLost` reports a post-`Completed` transport failure in gRPC
/// mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    Started,
    Validated,
    ConsulRegistered { service_id: String },
    HealthCheckConfigured,
    ConsulHealthy,
    MetadataRetrieved,
    SchemaValidated,
    DatabaseSaved,
    ApicurioRegistered,
    Completed { service_id: String },
    Failed { message: String, permanent: bool },
    StreamLost { message: String },
}

impl RegistrationEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationEvent::Completed { .. } | RegistrationEvent::Failed { .. }
        )
    }
}

/// A lazy, cancellable event sequence. Dropping it aborts the producing
/// task, which cancels the attempt.
pub struct RegistrationEvents {
    rx: mpsc::Receiver<RegistrationEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl RegistrationEvents {
    #[must_use]
    pub fn new(
        rx: mpsc::Receiver<RegistrationEvent>,
        task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self { rx, task }
    }

    /// Next event; `None` when the attempt's stream closed.
    pub async fn next(&mut self) -> Option<RegistrationEvent> {
        self.rx.recv().await
    }
}

impl Drop for RegistrationEvents {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One registration backend: direct Consul or the central gRPC registry.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Begin a registration attempt. An `Err` means the attempt could not
    /// even start (e.g. the registry is unreachable); everything after that
    /// is reported through the event sequence.
    async fn register(&self, record: &RegistrationRecord) -> Result<RegistrationEvents>;

    /// Best-effort removal, bounded by the implementation's deadline.
    /// Failures are logged; the record is considered gone either way.
    async fn unregister(&self, record: &RegistrationRecord) -> Result<()>;

    /// Drop any cached connection to the registry so the next attempt
    /// re-discovers it.
    async fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events_are_terminal() {
        assert!(RegistrationEvent::Completed {
            service_id: "svc-h-9000".into()
        }
        .is_terminal());
        assert!(RegistrationEvent::Failed {
            message: "no".into(),
            permanent: false
        }
        .is_terminal());
        assert!(!RegistrationEvent::Started.is_terminal());
        assert!(!RegistrationEvent::StreamLost {
            message: "reset".into()
        }
        .is_terminal());
    }

    #[tokio::test]
    async fn dropping_the_sequence_aborts_the_producer() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            loop {
                if tx.send(RegistrationEvent::Started).await.is_err() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        let mut events = RegistrationEvents::new(rx, Some(task));
        assert_eq!(events.next().await, Some(RegistrationEvent::Started));
        drop(events);
        // The producer is aborted; nothing to assert beyond not hanging.
    }
}
