// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable overriding the config file path.
pub const ENV_CONFIG_PATH: &str = "DYNAMIC_GRPC_CONFIG";

/// Environment variable overriding the active profile (`dev` or `production`).
pub const ENV_PROFILE: &str = "DYNAMIC_GRPC_PROFILE";

/// Environment variable overriding the global Consul agent host.
pub const ENV_CONSUL_HOST: &str = "DYNAMIC_GRPC_CONSUL_HOST";

/// Environment variable overriding the global Consul agent port.
pub const ENV_CONSUL_PORT: &str = "DYNAMIC_GRPC_CONSUL_PORT";

const HTTP2_LARGE_PAYLOAD_WINDOW: u32 = 100 * 1024 * 1024;

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    pub profile: Profile,
    pub application: ApplicationSettings,
    pub server: ServerSettings,
    pub dynamic_grpc: DynamicGrpcSettings,
    pub registration: RegistrationSettings,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    #[default]
    Dev,
    Production,
}

/// Identity of the embedding application; used as fallbacks by the metadata
/// collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApplicationSettings {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `server.*` keys: class, capabilities, host mode and HTTP/2 tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerSettings {
    pub class: ServerClass,
    pub capabilities: Vec<String>,
    pub host_mode: HostMode,
    pub http2: Http2Settings,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ServerClass {
    Core,
    #[default]
    Module,
    Connector,
    Engine,
}

impl ServerClass {
    /// Connectors and engines move large payloads; they get a 100 MiB
    /// connection window.
    #[must_use]
    pub fn default_connection_window(self) -> Option<u32> {
        match self {
            ServerClass::Connector | ServerClass::Engine => Some(HTTP2_LARGE_PAYLOAD_WINDOW),
            ServerClass::Core | ServerClass::Module => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HostMode {
    Production,
    #[default]
    Docker,
    Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct Http2Settings {
    pub connection_window_size: Option<u32>,
}

impl ServerSettings {
    /// Explicit window override wins; otherwise the class decides.
    #[must_use]
    pub fn effective_connection_window(&self) -> Option<u32> {
        self.http2
            .connection_window_size
            .or_else(|| self.class.default_connection_window())
    }
}

/// `dynamic-grpc.*` keys: the client-factory half.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct DynamicGrpcSettings {
    pub channel: ChannelCacheSettings,
    pub tls: TlsPolicy,
    pub auth: AuthPolicy,
    pub consul: ConsulSettings,
    /// Per-logical-name backend overrides, keyed by logical service name.
    pub services: HashMap<String, ServiceOverride>,
}

/// `dynamic-grpc.channel.*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChannelCacheSettings {
    #[serde(with = "super::duration")]
    pub idle_ttl: Duration,
    pub max_size: usize,
    #[serde(with = "super::duration")]
    pub shutdown_timeout: Duration,
    /// Applied to the gRPC clients this crate builds itself; stub factories
    /// read it through `ClientFactory::settings()`.
    pub max_message_size: usize,
}

impl Default for ChannelCacheSettings {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(300),
            max_size: 64,
            shutdown_timeout: Duration::from_secs(10),
            max_message_size: usize::pow(2, 31) - 1,
        }
    }
}

impl ChannelCacheSettings {
    #[must_use]
    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// `dynamic-grpc.tls.*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsPolicy {
    pub enabled: bool,
    /// Skip certificate verification entirely. Forbidden in the production
    /// profile.
    pub trust_all: bool,
    /// PEM files added to the trust store; system roots when empty.
    pub trust_certs: Vec<PathBuf>,
    /// Client certificate chain for mTLS.
    pub client_cert: Option<PathBuf>,
    /// Client private key for mTLS.
    pub client_key: Option<PathBuf>,
    pub verify_hostname: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            trust_all: false,
            trust_certs: Vec::new(),
            client_cert: None,
            client_key: None,
            verify_hostname: true,
        }
    }
}

impl TlsPolicy {
    /// mTLS is in effect when both halves of the client identity are present.
    #[must_use]
    pub fn is_mutual(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }
}

/// `dynamic-grpc.auth.*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthPolicy {
    pub enabled: bool,
    pub header_name: String,
    pub scheme_prefix: String,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            header_name: "authorization".to_string(),
            scheme_prefix: "Bearer ".to_string(),
        }
    }
}

/// `dynamic-grpc.consul.*`: the process-global Consul agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConsulSettings {
    pub host: String,
    pub port: u16,
    #[serde(with = "super::duration")]
    pub refresh_period: Duration,
    pub use_health_checks: bool,
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8500,
            refresh_period: Duration::from_secs(2),
            use_health_checks: true,
        }
    }
}

impl ConsulSettings {
    #[must_use]
    pub fn agent_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Static,
    Consul,
    Kubernetes,
}

/// `dynamic-grpc.services.<name>.*`: per-service discovery overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServiceOverride {
    /// Direct `host:port` override; wins over everything else.
    pub address: Option<String>,
    pub backend: Option<BackendKind>,
    /// Fixed address list for the static backend.
    pub addresses: Vec<String>,
    /// Consul service name when it differs from the logical name.
    pub service_name: Option<String>,
    /// Kubernetes namespace for DNS resolution.
    pub namespace: Option<String>,
    /// Target port for DNS-resolved backends.
    pub port: Option<u16>,
    pub secure: Option<bool>,
}

/// `registration.*` keys: the self-registration half.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistrationSettings {
    pub enabled: bool,
    pub mode: RegistrationMode,
    pub required: bool,
    #[serde(with = "super::duration")]
    pub required_timeout: Duration,
    pub service_name: Option<String>,
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub advertised_host: Option<String>,
    pub advertised_port: Option<u16>,
    pub internal_host: Option<String>,
    pub internal_port: Option<u16>,
    pub tls_enabled: bool,
    pub tags: Vec<String>,
    pub capabilities: Vec<String>,
    pub retry: RetrySettings,
    pub re_registration: ReRegistrationSettings,
    pub http: HttpRegistrationSettings,
    pub registration_service: RegistryEndpointSettings,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RegistrationMode::Direct,
            required: false,
            required_timeout: Duration::from_secs(60),
            service_name: None,
            version: None,
            service_type: ServiceType::Service,
            advertised_host: None,
            advertised_port: None,
            internal_host: None,
            internal_port: None,
            tls_enabled: false,
            tags: Vec::new(),
            capabilities: Vec::new(),
            retry: RetrySettings::default(),
            re_registration: ReRegistrationSettings::default(),
            http: HttpRegistrationSettings::default(),
            registration_service: RegistryEndpointSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationMode {
    /// Register straight into the Consul agent.
    #[default]
    Direct,
    /// Stream the record to a central registration service.
    Grpc,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    #[default]
    Service,
    Module,
}

impl ServiceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Service => "service",
            ServiceType::Module => "module",
        }
    }
}

/// `registration.retry.*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(with = "super::duration")]
    pub initial_delay: Duration,
    #[serde(with = "super::duration")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// `registration.re-registration.*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReRegistrationSettings {
    pub enabled: bool,
    #[serde(with = "super::duration")]
    pub interval: Duration,
}

impl Default for ReRegistrationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

/// `registration.http.*`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpRegistrationSettings {
    pub enabled: bool,
    pub scheme: String,
    pub advertised_host: Option<String>,
    pub advertised_port: Option<u16>,
    pub base_path: String,
    pub health_path: String,
    /// Full URL override; takes scheme/host/port/path over atomically when it
    /// parses as an absolute URL.
    pub health_url: Option<String>,
    pub tls_enabled: bool,
    pub schema: Option<String>,
    pub schema_version: Option<String>,
    pub schema_artifact_id: Option<String>,
}

impl Default for HttpRegistrationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            scheme: "http".to_string(),
            advertised_host: None,
            advertised_port: None,
            base_path: "/".to_string(),
            health_path: "/q/health".to_string(),
            health_url: None,
            tls_enabled: false,
            schema: None,
            schema_version: None,
            schema_artifact_id: None,
        }
    }
}

/// `registration.registration-service.*`: where the central registry lives
/// in gRPC mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistryEndpointSettings {
    /// Direct host; wins over `discovery-name` when set together with `port`.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub discovery_name: String,
    pub tls_enabled: bool,
    #[serde(with = "super::duration")]
    pub timeout: Duration,
}

impl Default for RegistryEndpointSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            discovery_name: "registration-service".to_string(),
            tls_enabled: false,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RegistryEndpointSettings {
    /// Direct wins when both a direct address and a discovery name are set.
    #[must_use]
    pub fn direct_address(&self) -> Option<(String, u16)> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }
}

impl Settings {
    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config YAML: {e}")))
    }

    /// Load settings from a specific path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::InvalidConfig(format!(
                "Failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Default config file path (`~/.config/dynamic-grpc/config.yaml`).
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| Error::InvalidConfig("Could not determine config directory".into()))?;
        Ok(base.join("dynamic-grpc").join("config.yaml"))
    }

    /// Load settings honoring the `DYNAMIC_GRPC_*` environment overrides.
    /// A missing config file yields defaults rather than an error.
    pub fn load_with_env() -> Result<Self> {
        let path = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => Self::default_path()?,
        };

        let mut settings = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            Self::default()
        };

        if let Ok(profile) = std::env::var(ENV_PROFILE) {
            match profile.as_str() {
                "production" => settings.profile = Profile::Production,
                "dev" | "" => settings.profile = Profile::Dev,
                other => {
                    return Err(Error::InvalidConfig(format!("Unknown profile: {other}")));
                }
            }
        }

        if let Ok(host) = std::env::var(ENV_CONSUL_HOST) {
            if !host.is_empty() {
                settings.dynamic_grpc.consul.host = host;
            }
        }
        if let Ok(port) = std::env::var(ENV_CONSUL_PORT) {
            if !port.is_empty() {
                settings.dynamic_grpc.consul.port = port
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("Invalid Consul port: {port}")))?;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Check the invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        if self.profile == Profile::Production && self.dynamic_grpc.tls.trust_all {
            return Err(Error::InvalidConfig(
                "dynamic-grpc.tls.trust-all is forbidden in the production profile".into(),
            ));
        }

        if self.server.host_mode == HostMode::Custom
            && (self.registration.advertised_host.is_none()
                || self.registration.internal_host.is_none())
        {
            return Err(Error::InvalidConfig(
                "server.host-mode=custom requires both registration.advertised-host \
                 and registration.internal-host"
                    .into(),
            ));
        }

        if self.registration.enabled {
            if matches!(self.registration.service_name.as_deref(), Some("")) {
                return Err(Error::InvalidConfig(
                    "registration.service-name must not be empty".into(),
                ));
            }
            if matches!(self.registration.advertised_port, Some(0)) {
                return Err(Error::InvalidConfig(
                    "registration.advertised-port must be positive".into(),
                ));
            }
            if self.registration.mode == RegistrationMode::Grpc
                && self.registration.registration_service.direct_address().is_none()
                && self.registration.registration_service.discovery_name.is_empty()
            {
                return Err(Error::InvalidConfig(
                    "registration.mode=grpc requires registration-service.host/port \
                     or a discovery-name"
                        .into(),
                ));
            }
        }

        for (name, service) in &self.dynamic_grpc.services {
            if matches!(service.port, Some(0)) {
                return Err(Error::InvalidConfig(format!(
                    "dynamic-grpc.services.{name}.port must be positive"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
profile: dev
application:
  name: orders-gateway
  version: 2.3.1
server:
  class: connector
  capabilities: [search, index]
  host-mode: docker
dynamic-grpc:
  channel:
    idle-ttl: 2m
    max-size: 16
    shutdown-timeout: 5s
  tls:
    enabled: true
    trust-certs: [/etc/pki/ca.pem]
  auth:
    enabled: true
  consul:
    host: consul.internal
    port: 8501
    refresh-period: 5s
  services:
    billing:
      address: 10.0.0.9:50051
    search:
      backend: kubernetes
      namespace: platform
      port: 9090
registration:
  enabled: true
  mode: direct
  required: true
  required-timeout: 30s
  service-name: orders
  advertised-host: orders.internal
  advertised-port: 9000
  tags: [edge]
  capabilities: [search]
  retry:
    max-attempts: 4
    initial-delay: 500ms
  re-registration:
    interval: 10s
  http:
    enabled: true
    base-path: /api
    health-path: /q/health
"#;

    #[test]
    fn parses_full_config() {
        let settings = Settings::from_yaml(SAMPLE_CONFIG).unwrap();

        assert_eq!(settings.application.name.as_deref(), Some("orders-gateway"));
        assert_eq!(settings.server.class, ServerClass::Connector);
        assert_eq!(
            settings.dynamic_grpc.channel.idle_ttl,
            Duration::from_secs(120)
        );
        assert_eq!(settings.dynamic_grpc.channel.max_size, 16);
        assert!(settings.dynamic_grpc.tls.enabled);
        assert_eq!(settings.dynamic_grpc.consul.port, 8501);
        assert_eq!(
            settings.dynamic_grpc.services["billing"].address.as_deref(),
            Some("10.0.0.9:50051")
        );
        assert_eq!(
            settings.dynamic_grpc.services["search"].backend,
            Some(BackendKind::Kubernetes)
        );
        assert!(settings.registration.required);
        assert_eq!(
            settings.registration.required_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(settings.registration.retry.max_attempts, 4);
        assert_eq!(
            settings.registration.retry.initial_delay,
            Duration::from_millis(500)
        );
        assert!(settings.registration.http.enabled);
    }

    #[test]
    fn defaults_are_usable() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.dynamic_grpc.channel.max_size, 64);
        assert_eq!(
            settings.dynamic_grpc.channel.max_message_size,
            2_147_483_647
        );
        assert_eq!(settings.registration.retry.multiplier, 2.0);
        assert!(!settings.registration.enabled);
    }

    #[test]
    fn connector_class_forces_large_window() {
        let settings = Settings::from_yaml(SAMPLE_CONFIG).unwrap();
        assert_eq!(
            settings.server.effective_connection_window(),
            Some(100 * 1024 * 1024)
        );

        let default = Settings::default();
        assert_eq!(default.server.effective_connection_window(), None);
    }

    #[test]
    fn explicit_window_beats_class_default() {
        let yaml = r#"
server:
  class: engine
  http2:
    connection-window-size: 65535
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.server.effective_connection_window(), Some(65535));
    }

    #[test]
    fn trust_all_is_rejected_in_production() {
        let yaml = r#"
profile: production
dynamic-grpc:
  tls:
    enabled: true
    trust-all: true
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn custom_host_mode_requires_both_hosts() {
        let yaml = r#"
server:
  host-mode: custom
registration:
  advertised-host: a.example
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert!(settings.validate().is_err());

        let yaml = r#"
server:
  host-mode: custom
registration:
  advertised-host: a.example
  internal-host: b.internal
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_advertised_port_is_rejected() {
        let yaml = r#"
registration:
  enabled: true
  advertised-port: 0
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn registry_direct_address_needs_host_and_port() {
        let mut endpoint = RegistryEndpointSettings::default();
        assert_eq!(endpoint.direct_address(), None);

        endpoint.host = Some("registry.internal".into());
        assert_eq!(endpoint.direct_address(), None);

        endpoint.port = Some(9100);
        assert_eq!(
            endpoint.direct_address(),
            Some(("registry.internal".to_string(), 9100))
        );
    }

    #[test]
    fn duration_fields_accept_integers() {
        let yaml = r#"
dynamic-grpc:
  channel:
    idle-ttl: 1500
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(
            settings.dynamic_grpc.channel.idle_ttl,
            Duration::from_millis(1500)
        );
    }
}
