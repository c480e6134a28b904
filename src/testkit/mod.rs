// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test fixtures: an in-process echo server, a scriptable registrar for
//! driving the lifecycle without a network, and a mock registration service.

use crate::api::echo::echo_service_server::{EchoService, EchoServiceServer};
use crate::api::echo::{EchoRequest, EchoResponse};
use crate::api::registration::registration_service_server::{
    RegistrationService, RegistrationServiceServer,
};
use crate::api::registration::{
    RegisterRequest, RegisterResponse, RegistrationPhase, UnregisterRequest, UnregisterResponse,
};
use crate::error::Result;
use crate::registry::{RegistrationEvent, RegistrationEvents, Registrar, RegistrationRecord};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status};

// ---------------------------------------------------------------------------
// Echo server
// ---------------------------------------------------------------------------

/// A canned echo gRPC server on an ephemeral local port.
pub struct EchoServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

struct Echoer;

#[tonic::async_trait]
impl EchoService for Echoer {
    async fn echo(
        &self,
        request: Request<EchoRequest>,
    ) -> std::result::Result<Response<EchoResponse>, Status> {
        Ok(Response::new(EchoResponse {
            payload: request.into_inner().payload,
        }))
    }
}

impl EchoServer {
    pub async fn spawn() -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| crate::error::Error::InvalidConfig(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| crate::error::Error::InvalidConfig(e.to_string()))?;

        let handle = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(EchoServiceServer::new(Echoer))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
        });

        Ok(Self { addr, handle })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` suitable for a static backend definition.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Scripted registrar
// ---------------------------------------------------------------------------

/// What one scripted registration attempt does.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Complete { service_id: String },
    /// Complete, then drop the stream shortly after.
    CompleteThenLose { service_id: String },
    TransientFailure(String),
    PermanentFailure(String),
}

/// A [`Registrar`] that replays a script of outcomes; once the script is
/// exhausted the fallback outcome repeats.
pub struct ScriptedRegistrar {
    script: std::sync::Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    register_calls: AtomicUsize,
    unregister_calls: AtomicUsize,
    reset_calls: AtomicUsize,
}

impl ScriptedRegistrar {
    #[must_use]
    pub fn with_script(script: Vec<ScriptedOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: std::sync::Mutex::new(script.into()),
            fallback: ScriptedOutcome::TransientFailure("script exhausted".into()),
            register_calls: AtomicUsize::new(0),
            unregister_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
        })
    }

    /// Every attempt completes with `service_id`.
    #[must_use]
    pub fn completing(service_id: &str) -> Arc<Self> {
        Arc::new(Self {
            script: std::sync::Mutex::new(VecDeque::new()),
            fallback: ScriptedOutcome::Complete {
                service_id: service_id.to_string(),
            },
            register_calls: AtomicUsize::new(0),
            unregister_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
        })
    }

    /// Every attempt fails with a transient error.
    #[must_use]
    pub fn always_failing() -> Arc<Self> {
        Arc::new(Self {
            script: std::sync::Mutex::new(VecDeque::new()),
            fallback: ScriptedOutcome::TransientFailure("scripted failure".into()),
            register_calls: AtomicUsize::new(0),
            unregister_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reset_calls(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> ScriptedOutcome {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Registrar for ScriptedRegistrar {
    async fn register(&self, _record: &RegistrationRecord) -> Result<RegistrationEvents> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(async move {
            let _ = tx.send(RegistrationEvent::Started).await;
            let _ = tx.send(RegistrationEvent::Validated).await;
            match outcome {
                ScriptedOutcome::Complete { service_id } => {
                    let _ = tx
                        .send(RegistrationEvent::Completed { service_id })
                        .await;
                }
                ScriptedOutcome::CompleteThenLose { service_id } => {
                    let _ = tx
                        .send(RegistrationEvent::Completed { service_id })
                        .await;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = tx
                        .send(RegistrationEvent::StreamLost {
                            message: "connection reset".into(),
                        })
                        .await;
                }
                ScriptedOutcome::TransientFailure(message) => {
                    let _ = tx
                        .send(RegistrationEvent::Failed {
                            message,
                            permanent: false,
                        })
                        .await;
                }
                ScriptedOutcome::PermanentFailure(message) => {
                    let _ = tx
                        .send(RegistrationEvent::Failed {
                            message,
                            permanent: true,
                        })
                        .await;
                }
            }
        });

        Ok(RegistrationEvents::new(rx, Some(task)))
    }

    async fn unregister(&self, _record: &RegistrationRecord) -> Result<()> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Mock registration service
// ---------------------------------------------------------------------------

/// How the mock registry treats each registration.
#[derive(Debug, Clone)]
pub enum RegistryBehavior {
    /// Emit the full happy path and close the stream cleanly.
    Complete,
    /// Complete, then break the stream with a transport error.
    CompleteThenBreak,
    /// Reject the record permanently.
    FailPermanently(String),
}

/// An in-process registration service on an ephemeral port.
pub struct MockRegistry {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    register_calls: Arc<AtomicUsize>,
    unregister_calls: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct MockRegistryService {
    behavior: RegistryBehavior,
    register_calls: Arc<AtomicUsize>,
    unregister_calls: Arc<AtomicUsize>,
}

fn response(phase: RegistrationPhase, service_id: &str) -> RegisterResponse {
    RegisterResponse {
        phase: phase as i32,
        service_id: service_id.to_string(),
        message: String::new(),
        permanent: false,
    }
}

#[tonic::async_trait]
impl RegistrationService for MockRegistryService {
    type RegisterStream = ReceiverStream<std::result::Result<RegisterResponse, Status>>;

    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> std::result::Result<Response<Self::RegisterStream>, Status> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let record = request.into_inner();
        let attempt = self.register_calls.load(Ordering::SeqCst);
        let service_id = format!(
            "{}-{}-{}",
            record.name, record.advertised_host, record.advertised_port
        );
        let behavior = self.behavior.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for phase in [
                RegistrationPhase::Started,
                RegistrationPhase::Validated,
                RegistrationPhase::ConsulRegistered,
                RegistrationPhase::HealthCheckConfigured,
                RegistrationPhase::ConsulHealthy,
            ] {
                if tx.send(Ok(response(phase, &service_id))).await.is_err() {
                    return;
                }
            }

            match behavior {
                RegistryBehavior::Complete => {
                    let _ = tx
                        .send(Ok(response(RegistrationPhase::Completed, &service_id)))
                        .await;
                }
                RegistryBehavior::CompleteThenBreak => {
                    let _ = tx
                        .send(Ok(response(RegistrationPhase::Completed, &service_id)))
                        .await;
                    // Only the first stream breaks; re-registration succeeds.
                    if attempt == 1 {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let _ = tx.send(Err(Status::unavailable("stream reset"))).await;
                    }
                }
                RegistryBehavior::FailPermanently(message) => {
                    let _ = tx
                        .send(Ok(RegisterResponse {
                            phase: RegistrationPhase::Failed as i32,
                            service_id: String::new(),
                            message,
                            permanent: true,
                        }))
                        .await;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn unregister(
        &self,
        _request: Request<UnregisterRequest>,
    ) -> std::result::Result<Response<UnregisterResponse>, Status> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(UnregisterResponse { acknowledged: true }))
    }
}

impl MockRegistry {
    pub async fn spawn(behavior: RegistryBehavior) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| crate::error::Error::InvalidConfig(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| crate::error::Error::InvalidConfig(e.to_string()))?;

        let register_calls = Arc::new(AtomicUsize::new(0));
        let unregister_calls = Arc::new(AtomicUsize::new(0));
        let service = MockRegistryService {
            behavior,
            register_calls: register_calls.clone(),
            unregister_calls: unregister_calls.clone(),
        };

        let handle = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(RegistrationServiceServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
        });

        Ok(Self {
            addr,
            handle,
            register_calls,
            unregister_calls,
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls.load(Ordering::SeqCst)
    }
}

impl Drop for MockRegistry {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
