// SPDX-License-Identifier: MIT OR Apache-2.0

//! Assemble the registration record from process configuration and the
//! running server's addresses.

use crate::config::{HostMode, Settings};
use crate::error::{Error, Result};
use crate::registry::{is_reserved_grpc_service, join_health_path, HttpEndpoint, RegistrationRecord};

const FALLBACK_SERVICE_NAME: &str = "unknown-service";
const FALLBACK_VERSION: &str = "1.0.0";

/// What the embedding server knows about itself.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub grpc_port: Option<u16>,
    pub http_port: Option<u16>,
    /// Fully-qualified names of the gRPC services the server registered.
    pub grpc_services: Vec<String>,
}

/// Build the record a process registers under, applying the override
/// precedence rules.
pub fn collect(settings: &Settings, server: &ServerInfo) -> Result<RegistrationRecord> {
    let registration = &settings.registration;

    let name = registration
        .service_name
        .clone()
        .or_else(|| settings.application.name.clone())
        .unwrap_or_else(|| FALLBACK_SERVICE_NAME.to_string());

    let version = registration
        .version
        .clone()
        .or_else(|| settings.application.version.clone())
        .unwrap_or_else(|| FALLBACK_VERSION.to_string());

    let advertised_host = match &registration.advertised_host {
        Some(host) => host.clone(),
        None => default_host(settings.server.host_mode)?,
    };

    let advertised_port = registration
        .advertised_port
        .or(server.grpc_port)
        .or(server.http_port)
        .ok_or_else(|| {
            Error::InvalidConfig(
                "No advertised port: set registration.advertised-port or run a server".into(),
            )
        })?;

    let mut record = RegistrationRecord::new(name, advertised_host, advertised_port);
    record.service_type = registration.service_type;
    record.version = version;
    record.internal_host = registration.internal_host.clone();
    record.internal_port = registration.internal_port;
    record.tls_enabled = registration.tls_enabled;
    record.tags = registration.tags.clone();

    record.capabilities = registration.capabilities.clone();
    for capability in &settings.server.capabilities {
        if !record.capabilities.contains(capability) {
            record.capabilities.push(capability.clone());
        }
    }

    record.grpc_services = collect_grpc_services(&server.grpc_services);

    if registration.http.enabled {
        let endpoint = http_endpoint(settings, &record, server)?;
        record.http_endpoints.push(endpoint);
    }

    if let Some(port) = server.http_port {
        record.metadata.insert("http.port".into(), port.to_string());
    }
    if let Some(port) = server.grpc_port {
        record.metadata.insert("grpc.port".into(), port.to_string());
    }
    record.metadata.insert("runtime".into(), "rust".into());
    record
        .metadata
        .insert("library.version".into(), env!("CARGO_PKG_VERSION").into());

    record.http_schema = registration.http.schema.clone();
    record.schema_version = registration.http.schema_version.clone();
    record.schema_artifact_id = registration.http.schema_artifact_id.clone();

    Ok(record)
}

/// Host-mode default: the machine hostname in production, the docker-host
/// alias of the current OS otherwise.
fn default_host(mode: HostMode) -> Result<String> {
    match mode {
        HostMode::Production => Ok(hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())),
        HostMode::Docker => Ok(docker_host_alias().to_string()),
        HostMode::Custom => Err(Error::InvalidConfig(
            "server.host-mode=custom requires registration.advertised-host".into(),
        )),
    }
}

#[must_use]
pub fn docker_host_alias() -> &'static str {
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        "host.docker.internal"
    } else {
        "172.17.0.1"
    }
}

/// Filter out health/reflection, sort, and dedupe.
fn collect_grpc_services(services: &[String]) -> Vec<String> {
    let mut services: Vec<String> = services
        .iter()
        .filter(|s| !is_reserved_grpc_service(s))
        .cloned()
        .collect();
    services.sort();
    services.dedup();
    services
}

fn http_endpoint(
    settings: &Settings,
    record: &RegistrationRecord,
    server: &ServerInfo,
) -> Result<HttpEndpoint> {
    let http = &settings.registration.http;

    let mut scheme = http.scheme.clone();
    let mut host = http
        .advertised_host
        .clone()
        .unwrap_or_else(|| record.advertised_host.clone());
    let mut port = http
        .advertised_port
        .or(server.http_port)
        .unwrap_or(record.advertised_port);
    let base_path = http.base_path.clone();
    let mut health_path = http.health_path.clone();

    if let Some(health_url) = &http.health_url {
        // Parse as a full URL first; only on failure treat the value as a
        // health-path override. The URL form overrides scheme, host, port
        // and path atomically.
        match url::Url::parse(health_url) {
            Ok(parsed) if parsed.host_str().is_some() => {
                scheme = parsed.scheme().to_string();
                host = parsed.host_str().unwrap_or(&host).to_string();
                port = parsed
                    .port_or_known_default()
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "registration.http.health-url has no usable port: {health_url}"
                        ))
                    })?;
                health_path = parsed.path().to_string();
                return Ok(HttpEndpoint {
                    scheme,
                    host,
                    port,
                    base_path,
                    health_path,
                    tls_enabled: http.tls_enabled,
                });
            }
            _ => {
                health_path = health_url.clone();
            }
        }
    }

    if base_path_mismatch(&base_path, &health_path) {
        tracing::warn!(
            base_path = %base_path,
            health_path = %health_path,
            "Health path does not start with the base path; the joined check URL may be wrong"
        );
    }

    let joined = join_health_path(&base_path, &health_path);
    Ok(HttpEndpoint {
        scheme,
        host,
        port,
        base_path,
        health_path: joined,
        tls_enabled: http.tls_enabled,
    })
}

/// A non-default base path combined with an absolute, non-`/q/health`
/// health path that lives outside it is usually a misconfiguration.
pub(crate) fn base_path_mismatch(base_path: &str, health_path: &str) -> bool {
    let default_base = base_path.is_empty() || base_path == "/";
    !default_base
        && health_path.starts_with('/')
        && health_path != "/q/health"
        && !health_path.starts_with(base_path.trim_end_matches('/'))
}
