// SPDX-License-Identifier: MIT OR Apache-2.0

//! The registration record and the pure rules around it: service id
//! derivation, metadata sanitization and health-path joining.

use crate::config::ServiceType;
use std::collections::BTreeMap;

/// gRPC services that are infrastructure, never advertised.
pub const RESERVED_GRPC_SERVICES: &[&str] = &[
    "grpc.health.v1.Health",
    "grpc.reflection.v1.ServerReflection",
    "grpc.reflection.v1alpha.ServerReflection",
];

/// One HTTP surface of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub health_path: String,
    pub tls_enabled: bool,
}

/// The payload a process registers under its logical name.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    pub name: String,
    pub service_type: ServiceType,
    pub version: String,
    pub advertised_host: String,
    pub advertised_port: u16,
    pub internal_host: Option<String>,
    pub internal_port: Option<u16>,
    pub tls_enabled: bool,
    pub tags: Vec<String>,
    pub capabilities: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub http_endpoints: Vec<HttpEndpoint>,
    pub grpc_services: Vec<String>,
    pub http_schema: Option<String>,
    pub schema_version: Option<String>,
    pub schema_artifact_id: Option<String>,
}

impl RegistrationRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, advertised_host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            service_type: ServiceType::Service,
            version: "1.0.0".to_string(),
            advertised_host: advertised_host.into(),
            advertised_port: port,
            internal_host: None,
            internal_port: None,
            tls_enabled: false,
            tags: Vec::new(),
            capabilities: Vec::new(),
            metadata: BTreeMap::new(),
            http_endpoints: Vec::new(),
            grpc_services: Vec::new(),
            http_schema: None,
            schema_version: None,
            schema_artifact_id: None,
        }
    }

    /// Stable id for this record: identical across processes for a fixed
    /// `(name, advertised_host, advertised_port)`.
    #[must_use]
    pub fn service_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.name, self.advertised_host, self.advertised_port
        )
    }

    /// Where the backend should address the service: internal wins when both
    /// halves are present, advertised otherwise.
    #[must_use]
    pub fn backend_address(&self) -> (&str, u16) {
        match (&self.internal_host, self.internal_port) {
            (Some(host), Some(port)) => (host.as_str(), port),
            _ => (self.advertised_host.as_str(), self.advertised_port),
        }
    }

    /// Caller tags plus one `capability:<cap>` tag per capability.
    #[must_use]
    pub fn backend_tags(&self) -> Vec<String> {
        let mut tags = self.tags.clone();
        tags.extend(
            self.capabilities
                .iter()
                .map(|cap| format!("capability:{cap}")),
        );
        tags
    }

    /// The metadata map as sent to the backend: sanitized caller entries
    /// plus the identity rows and flattened HTTP endpoints.
    #[must_use]
    pub fn backend_metadata(&self) -> BTreeMap<String, String> {
        let mut meta = sanitize_metadata(&self.metadata);
        meta.insert("advertised-host".into(), self.advertised_host.clone());
        meta.insert("advertised-port".into(), self.advertised_port.to_string());
        meta.insert("version".into(), self.version.clone());
        meta.insert("service-type".into(), self.service_type.as_str().into());

        for (i, endpoint) in self.http_endpoints.iter().enumerate() {
            meta.insert(format!("http_endpoint_{i}_scheme"), endpoint.scheme.clone());
            meta.insert(format!("http_endpoint_{i}_host"), endpoint.host.clone());
            meta.insert(format!("http_endpoint_{i}_port"), endpoint.port.to_string());
            meta.insert(
                format!("http_endpoint_{i}_base_path"),
                endpoint.base_path.clone(),
            );
            meta.insert(
                format!("http_endpoint_{i}_health_path"),
                endpoint.health_path.clone(),
            );
            meta.insert(
                format!("http_endpoint_{i}_tls_enabled"),
                endpoint.tls_enabled.to_string(),
            );
        }
        meta
    }

    /// Basic validity: non-empty name, non-empty host, positive port.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.advertised_host.is_empty() && self.advertised_port > 0
    }
}

/// Consul disallows dots in meta keys; replace each with an underscore.
/// Values pass through untouched.
#[must_use]
pub fn sanitize_metadata(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(key, value)| (key.replace('.', "_"), value.clone()))
        .collect()
}

/// Whether a gRPC service name is infrastructure (health, reflection) and
/// must not be advertised.
#[must_use]
pub fn is_reserved_grpc_service(name: &str) -> bool {
    RESERVED_GRPC_SERVICES.contains(&name)
}

/// Join a base path and a health path.
///
/// Absolute URLs pass through verbatim. Otherwise both parts are anchored at
/// `/`, the base loses trailing slashes, and a health path already under the
/// base is not prefixed twice, which makes the join idempotent.
#[must_use]
pub fn join_health_path(base_path: &str, health_path: &str) -> String {
    if health_path.contains("://") {
        return health_path.to_string();
    }

    let mut base = base_path.trim_end_matches('/').to_string();
    if !base.starts_with('/') {
        base.insert(0, '/');
    }
    let mut health = health_path.to_string();
    if !health.starts_with('/') {
        health.insert(0, '/');
    }

    if base == "/" {
        return health;
    }
    if health == base || health.starts_with(&format!("{base}/")) {
        return health;
    }
    format!("{base}{health}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RegistrationRecord {
        RegistrationRecord::new("svc", "h", 9000)
    }

    #[test]
    fn service_id_is_stable() {
        assert_eq!(record().service_id(), "svc-h-9000");
        // Rebuilding the record yields the same id.
        assert_eq!(record().service_id(), record().service_id());
    }

    #[test]
    fn backend_address_prefers_internal() {
        let mut r = record();
        assert_eq!(r.backend_address(), ("h", 9000));

        r.internal_host = Some("10.0.0.5".into());
        // Port still missing: advertised wins.
        assert_eq!(r.backend_address(), ("h", 9000));

        r.internal_port = Some(9001);
        assert_eq!(r.backend_address(), ("10.0.0.5", 9001));
    }

    #[test]
    fn capability_tags_are_appended() {
        let mut r = record();
        r.tags = vec!["edge".into()];
        r.capabilities = vec!["search".into(), "index".into()];
        assert_eq!(
            r.backend_tags(),
            vec!["edge", "capability:search", "capability:index"]
        );
    }

    #[test]
    fn metadata_dots_become_underscores_values_untouched() {
        let mut meta = BTreeMap::new();
        meta.insert("http.port".to_string(), "8.0.8.0".to_string());
        meta.insert("plain".to_string(), "x".to_string());

        let sanitized = sanitize_metadata(&meta);
        assert_eq!(sanitized["http_port"], "8.0.8.0");
        assert_eq!(sanitized["plain"], "x");
        assert!(sanitized.keys().all(|k| !k.contains('.')));
    }

    #[test]
    fn backend_metadata_contains_identity_rows() {
        let mut r = record();
        r.version = "2.0.0".into();
        r.metadata.insert("grpc.port".into(), "9000".into());

        let meta = r.backend_metadata();
        assert_eq!(meta["advertised-host"], "h");
        assert_eq!(meta["advertised-port"], "9000");
        assert_eq!(meta["version"], "2.0.0");
        assert_eq!(meta["service-type"], "service");
        assert_eq!(meta["grpc_port"], "9000");
    }

    #[test]
    fn http_endpoints_are_flattened() {
        let mut r = record();
        r.http_endpoints.push(HttpEndpoint {
            scheme: "https".into(),
            host: "h".into(),
            port: 8443,
            base_path: "/api".into(),
            health_path: "/api/q/health".into(),
            tls_enabled: true,
        });

        let meta = r.backend_metadata();
        assert_eq!(meta["http_endpoint_0_scheme"], "https");
        assert_eq!(meta["http_endpoint_0_port"], "8443");
        assert_eq!(meta["http_endpoint_0_tls_enabled"], "true");
    }

    #[test]
    fn reserved_service_names_are_recognized() {
        assert!(is_reserved_grpc_service("grpc.health.v1.Health"));
        assert!(is_reserved_grpc_service(
            "grpc.reflection.v1alpha.ServerReflection"
        ));
        assert!(!is_reserved_grpc_service("my.pkg.Svc"));
    }

    #[test]
    fn join_passes_absolute_urls_through() {
        assert_eq!(
            join_health_path("/api", "https://other/health"),
            "https://other/health"
        );
    }

    #[test]
    fn join_anchors_and_concatenates() {
        assert_eq!(join_health_path("/api", "/q/health"), "/api/q/health");
        assert_eq!(join_health_path("api/", "q/health"), "/api/q/health");
        assert_eq!(join_health_path("/", "/q/health"), "/q/health");
        assert_eq!(join_health_path("", "/q/health"), "/q/health");
    }

    #[test]
    fn join_does_not_double_prefix() {
        assert_eq!(join_health_path("/api", "/api/q/health"), "/api/q/health");
        assert_eq!(join_health_path("/api", "/api"), "/api");
        // "/apiary" is not under "/api".
        assert_eq!(join_health_path("/api", "/apiary"), "/api/apiary");
    }

    #[test]
    fn join_is_idempotent_and_clean() {
        for (base, health) in [
            ("/api", "/q/health"),
            ("api", "health"),
            ("/a/b/", "/c"),
            ("/", "/x"),
        ] {
            let joined = join_health_path(base, health);
            assert!(joined.starts_with('/'), "{joined}");
            assert!(!joined.contains("//"), "{joined}");
            assert_eq!(join_health_path(base, &joined), joined);
        }
    }

    #[test]
    fn validity_checks_the_basics() {
        assert!(record().is_valid());
        assert!(!RegistrationRecord::new("", "h", 9000).is_valid());
        assert!(!RegistrationRecord::new("svc", "", 9000).is_valid());
        assert!(!RegistrationRecord::new("svc", "h", 0).is_valid());
    }
}
