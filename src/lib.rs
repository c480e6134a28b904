// SPDX-License-Identifier: MIT OR Apache-2.0

//! # dynamic-grpc-rs
//!
//! A typed, async, runtime-dynamic gRPC client factory with
//! service-discovery-driven registration.
//!
//! ## Features
//!
//! - **Dynamic clients** — resolve a logical service name at runtime to a
//!   live, multiplexed channel or a typed stub
//! - **Pluggable discovery** — static address lists, Consul, Kubernetes DNS
//! - **Bounded channel cache** — LRU with idle TTL and graceful drain
//! - **Self-registration** — register the process into Consul (directly or
//!   through a central registry), with health checks, retry/backoff,
//!   re-registration and a required-readiness gate
//! - **Observable** — structured tracing, optional Prometheus-style metrics
//! - **mTLS support** — rustls-backed, with per-instance SNI
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dynamic_grpc_rs::{Orchestrator, ServerInfo, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_with_env()?;
//! let server = ServerInfo {
//!     grpc_port: Some(9000),
//!     http_port: Some(8080),
//!     grpc_services: vec!["my.pkg.OrdersService".to_string()],
//! };
//!
//! let runtime = Orchestrator::start(settings, server).await?;
//!
//! // A typed stub for a service known only by name:
//! let client = runtime
//!     .factory()
//!     .client("billing", my_proto::billing_client::BillingClient::new)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`factory`] — public surface: name → channel / typed stub
//! - [`channel`] — channel cache, TLS, round-robin, per-call auth
//! - [`discovery`] — logical name → instances, pluggable backends
//! - [`registry`] — registration record and registrars (Consul, gRPC)
//! - [`lifecycle`] — registration state machine and readiness gate
//! - [`metadata`] — build the registration record from configuration
//! - [`metrics`] — counters/gauges/timers, no-op by default
//! - [`config`] — settings for every `dynamic-grpc.*` / `registration.*` key
//! - [`runtime`] — backoff and the wiring orchestrator
//! - [`error`] — error types
//! - [`api`] — generated protobuf types (low-level)
//! - [`testkit`] — testing utilities

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod api;
pub mod channel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod metadata;
pub mod metrics;
pub mod registry;
pub mod runtime;
pub mod testkit;

pub use channel::{
    current_call_token, with_call_token, AmbientTokenProvider, CallTokenProvider, ChannelInfo,
    ChannelManager, DynamicChannel, StaticTokenProvider,
};
pub use config::{
    AuthPolicy, ChannelCacheSettings, ConsulSettings, DynamicGrpcSettings, Profile,
    RegistrationMode, RegistrationSettings, Settings, TlsPolicy, ENV_CONFIG_PATH, ENV_CONSUL_HOST,
    ENV_CONSUL_PORT, ENV_PROFILE,
};
pub use discovery::{
    ConsulBackend, DiscoveryBackend, DnsBackend, ServiceInstance, ServiceResolver, StaticBackend,
};
pub use error::{Error, Result};
pub use factory::ClientFactory;
pub use lifecycle::{
    ExitFatalHandler, FatalHandler, ReadinessGate, ReadinessReport, RegistrationLifecycle,
    RegistrationState,
};
pub use metadata::ServerInfo;
pub use metrics::{AtomicMetrics, EvictionReason, MetricsSink, MetricsSnapshot, NoopMetrics};
pub use registry::{
    ConsulRegistrar, GrpcRegistrar, HttpEndpoint, RegistrationEvent, RegistrationRecord, Registrar,
};
pub use runtime::{ExponentialBackoff, Orchestrator};
