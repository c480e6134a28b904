// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the dynamic client factory and the registration
//! lifecycle.
//!
//! Settings are plain serde structs with defaults, loadable from a YAML file
//! and overridable through a small set of environment variables.

mod duration;
mod settings;

pub use duration::parse_duration;
pub use settings::{
    ApplicationSettings, AuthPolicy, BackendKind, ChannelCacheSettings, ConsulSettings,
    DynamicGrpcSettings, HostMode, Http2Settings, HttpRegistrationSettings, Profile,
    RegistrationMode, RegistrationSettings, RegistryEndpointSettings, ReRegistrationSettings,
    RetrySettings, ServerClass, ServerSettings, ServiceOverride, ServiceType, Settings, TlsPolicy,
    ENV_CONFIG_PATH, ENV_CONSUL_HOST, ENV_CONSUL_PORT, ENV_PROFILE,
};
