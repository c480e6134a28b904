// SPDX-License-Identifier: MIT OR Apache-2.0

use dynamic_grpc_rs::api::echo::echo_service_client::EchoServiceClient;
use dynamic_grpc_rs::api::echo::EchoRequest;
use dynamic_grpc_rs::config::{ServiceOverride, Settings};
use dynamic_grpc_rs::lifecycle::{FatalHandler, RegistrationState};
use dynamic_grpc_rs::metrics::NoopMetrics;
use dynamic_grpc_rs::registry::{
    ConsulRegistrar, RegistrationEvent, RegistrationRecord, Registrar,
};
use dynamic_grpc_rs::testkit::{EchoServer, MockRegistry, RegistryBehavior};
use dynamic_grpc_rs::{Orchestrator, ServerInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FlagFatal {
    fired: AtomicBool,
    message: std::sync::Mutex<String>,
}

impl FlagFatal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            message: std::sync::Mutex::new(String::new()),
        })
    }
}

impl FatalHandler for FlagFatal {
    fn fatal(&self, message: &str) {
        self.fired.store(true, Ordering::SeqCst);
        *self.message.lock().unwrap() = message.to_string();
    }
}

async fn wait_for_state(
    lifecycle: &Arc<dynamic_grpc_rs::RegistrationLifecycle>,
    expected: RegistrationState,
    deadline: Duration,
) {
    let mut rx = lifecycle.subscribe();
    tokio::time::timeout(deadline, async {
        rx.wait_for(|state| *state == expected).await.unwrap();
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {expected}"));
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// Scenario: static discovery round-trip through a real echo server.
#[tokio::test]
async fn static_discovery_round_trip() {
    let echo = EchoServer::spawn().await.unwrap();

    let mut settings = Settings::default();
    settings.dynamic_grpc.services.insert(
        "svc-a".to_string(),
        ServiceOverride {
            address: Some(echo.authority()),
            ..Default::default()
        },
    );

    let runtime = Orchestrator::start(settings, ServerInfo::default())
        .await
        .unwrap();

    let mut client = runtime
        .factory()
        .client("svc-a", EchoServiceClient::new)
        .await
        .unwrap();
    let response = client
        .echo(EchoRequest {
            payload: "hello over a dynamic channel".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.into_inner().payload, "hello over a dynamic channel");

    runtime.factory().evict("svc-a").await;
    assert_eq!(runtime.factory().active_count().await, 0);

    runtime.shutdown().await;
}

// Scenario: instances discovered through Consul's health API feed a working
// channel.
#[tokio::test]
async fn consul_resolution_feeds_the_factory() {
    let echo = EchoServer::spawn().await.unwrap();
    let consul = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("passing", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
            "Node": {"Node": "worker-1", "Address": "127.0.0.1"},
            "Service": {
                "ID": "orders-1",
                "Service": "orders",
                "Address": "127.0.0.1",
                "Port": echo.addr().port(),
                "Meta": {}
            },
            "Checks": []
        }])))
        .mount(&consul)
        .await;

    let mut settings = Settings::default();
    settings.dynamic_grpc.consul.host = "127.0.0.1".to_string();
    settings.dynamic_grpc.consul.port = consul.address().port();

    let runtime = Orchestrator::start(settings, ServerInfo::default())
        .await
        .unwrap();

    // "orders" was never defined explicitly: the global Consul fallback
    // kicks in.
    let mut client = runtime
        .factory()
        .client("orders", EchoServiceClient::new)
        .await
        .unwrap();
    let response = client
        .echo(EchoRequest {
            payload: "via consul".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.into_inner().payload, "via consul");

    runtime.shutdown().await;
}

// Scenario: direct-mode Consul registration installs the service and its
// checks, then unregister removes it.
#[tokio::test]
async fn consul_direct_mode_registration_round_trip() {
    let consul = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&consul)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/agent/health/service/id/svc-h-9000"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&consul)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/svc-h-9000"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&consul)
        .await;

    let mut consul_settings = dynamic_grpc_rs::ConsulSettings::default();
    consul_settings.host = "127.0.0.1".to_string();
    consul_settings.port = consul.address().port();
    consul_settings.refresh_period = Duration::from_millis(100);

    let registrar =
        ConsulRegistrar::new(&consul_settings).with_healthy_timeout(Duration::from_secs(2));

    let mut record = RegistrationRecord::new("svc", "h", 9000);
    record.grpc_services = vec!["my.pkg.Svc".to_string()];

    let mut events = registrar.register(&record).await.unwrap();
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    assert_eq!(
        seen.last(),
        Some(&RegistrationEvent::Completed {
            service_id: "svc-h-9000".to_string()
        })
    );
    assert!(seen.contains(&RegistrationEvent::ConsulRegistered {
        service_id: "svc-h-9000".to_string()
    }));

    // The registration payload carried the identity rows and both gRPC
    // checks.
    let requests = consul.received_requests().await.unwrap();
    let register_request = requests
        .iter()
        .find(|r| r.url.path() == "/v1/agent/service/register")
        .expect("no register request observed");
    let body: serde_json::Value = serde_json::from_slice(&register_request.body).unwrap();
    assert_eq!(body["ID"], "svc-h-9000");
    assert_eq!(body["Name"], "svc");
    assert_eq!(body["Meta"]["advertised-host"], "h");
    assert_eq!(body["Meta"]["advertised-port"], "9000");
    assert!(body["Meta"]["version"].is_string());
    let checks = body["Checks"].as_array().unwrap();
    assert_eq!(checks[0]["GRPC"], "h:9000");
    assert_eq!(checks[1]["GRPC"], "h:9000/my.pkg.Svc");

    registrar.unregister(&record).await.unwrap();
    consul.verify().await;
}

// Scenario: health checks never pass, so the half-registered service is
// rolled back.
#[tokio::test]
async fn unhealthy_registration_rolls_back() {
    let consul = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&consul)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/agent/health/service/id/svc-h-9000"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&consul)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/svc-h-9000"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&consul)
        .await;

    let mut consul_settings = dynamic_grpc_rs::ConsulSettings::default();
    consul_settings.host = "127.0.0.1".to_string();
    consul_settings.port = consul.address().port();
    consul_settings.refresh_period = Duration::from_millis(50);

    let registrar =
        ConsulRegistrar::new(&consul_settings).with_healthy_timeout(Duration::from_millis(200));

    let record = RegistrationRecord::new("svc", "h", 9000);
    let mut events = registrar.register(&record).await.unwrap();

    let mut last = None;
    while let Some(event) = events.next().await {
        let terminal = event.is_terminal();
        last = Some(event);
        if terminal {
            break;
        }
    }
    match last {
        Some(RegistrationEvent::Failed { permanent, .. }) => assert!(!permanent),
        other => panic!("expected a transient failure, got {other:?}"),
    }
    consul.verify().await;
}

// Scenario: required registration times out against an unreachable registry
// and trips the fatal handler with a diagnostic.
#[tokio::test]
async fn required_timeout_trips_the_fatal_handler() {
    let dead_port = free_port();

    let mut settings = Settings::default();
    settings.registration.enabled = true;
    settings.registration.mode = dynamic_grpc_rs::RegistrationMode::Grpc;
    settings.registration.required = true;
    settings.registration.required_timeout = Duration::from_millis(500);
    settings.registration.service_name = Some("svc".to_string());
    settings.registration.advertised_host = Some("h".to_string());
    settings.registration.advertised_port = Some(9000);
    settings.registration.retry.initial_delay = Duration::from_millis(50);
    settings.registration.retry.max_delay = Duration::from_millis(100);
    settings.registration.registration_service.host = Some("127.0.0.1".to_string());
    settings.registration.registration_service.port = Some(dead_port);

    let fatal = FlagFatal::new();
    let runtime = Orchestrator::start_with(
        settings,
        ServerInfo::default(),
        Arc::new(NoopMetrics),
        fatal.clone(),
    )
    .await
    .unwrap();

    assert!(!runtime.readiness().is_up());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !fatal.fired.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("fatal handler never fired");

    let message = fatal.message.lock().unwrap().clone();
    assert!(message.contains("registration-service"));
    assert!(message.contains("127.0.0.1"));

    runtime.shutdown().await;
}

// Scenario: a registration stream that breaks after COMPLETED triggers
// re-registration and ends registered again.
#[tokio::test]
async fn reregisters_after_stream_failure() {
    let registry = MockRegistry::spawn(RegistryBehavior::CompleteThenBreak)
        .await
        .unwrap();

    let mut settings = Settings::default();
    settings.registration.enabled = true;
    settings.registration.mode = dynamic_grpc_rs::RegistrationMode::Grpc;
    settings.registration.service_name = Some("svc".to_string());
    settings.registration.advertised_host = Some("h".to_string());
    settings.registration.advertised_port = Some(9000);
    settings.registration.retry.initial_delay = Duration::from_millis(50);
    settings.registration.retry.max_delay = Duration::from_millis(100);
    settings.registration.re_registration.interval = Duration::from_millis(100);
    settings.registration.registration_service.host = Some("127.0.0.1".to_string());
    settings.registration.registration_service.port = Some(registry.addr().port());

    let fatal = FlagFatal::new();
    let runtime = Orchestrator::start_with(
        settings,
        ServerInfo::default(),
        Arc::new(NoopMetrics),
        fatal.clone(),
    )
    .await
    .unwrap();

    let lifecycle = runtime.lifecycle().clone();
    wait_for_state(&lifecycle, RegistrationState::Registered, Duration::from_secs(5)).await;
    assert_eq!(lifecycle.service_id().as_deref(), Some("svc-h-9000"));

    // The registry breaks the stream ~50 ms after completing; the lifecycle
    // must drop to UNREGISTERED and climb back.
    let mut rx = lifecycle.subscribe();
    tokio::time::timeout(Duration::from_secs(10), async {
        rx.wait_for(|s| *s == RegistrationState::Unregistered)
            .await
            .unwrap();
        rx.wait_for(|s| *s == RegistrationState::Registered)
            .await
            .unwrap();
    })
    .await
    .expect("did not re-register after the stream failure");

    assert!(registry.register_calls() >= 2);
    assert!(!fatal.fired.load(Ordering::SeqCst));

    runtime.shutdown().await;
    assert_eq!(registry.unregister_calls(), 1);
    assert_eq!(lifecycle.state(), RegistrationState::Deregistered);
}

// Scenario: gRPC-mode registration against a permanently rejecting registry
// with re-registration disabled ends FAILED without exiting.
#[tokio::test]
async fn permanent_rejection_without_rereg_is_failed_but_alive() {
    let registry = MockRegistry::spawn(RegistryBehavior::FailPermanently(
        "schema rejected".to_string(),
    ))
    .await
    .unwrap();

    let mut settings = Settings::default();
    settings.registration.enabled = true;
    settings.registration.mode = dynamic_grpc_rs::RegistrationMode::Grpc;
    settings.registration.service_name = Some("svc".to_string());
    settings.registration.advertised_host = Some("h".to_string());
    settings.registration.advertised_port = Some(9000);
    settings.registration.re_registration.enabled = false;
    settings.registration.registration_service.host = Some("127.0.0.1".to_string());
    settings.registration.registration_service.port = Some(registry.addr().port());

    let fatal = FlagFatal::new();
    let runtime = Orchestrator::start_with(
        settings,
        ServerInfo::default(),
        Arc::new(NoopMetrics),
        fatal.clone(),
    )
    .await
    .unwrap();

    let lifecycle = runtime.lifecycle().clone();
    wait_for_state(&lifecycle, RegistrationState::Failed, Duration::from_secs(5)).await;

    // Not required: the factory keeps working and the process stays up.
    assert!(!fatal.fired.load(Ordering::SeqCst));
    assert_eq!(registry.register_calls(), 1);
    assert!(runtime.readiness().is_up());

    runtime.shutdown().await;
}
