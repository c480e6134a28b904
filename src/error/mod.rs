// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration violates an invariant. Fatal at startup.
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// A `host:port` pair failed validation.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The logical name was never defined in the resolver.
    #[error("Unknown service: {0}")]
    ServiceUnknown(String),

    /// The discovery backend failed with an I/O or protocol error.
    #[error("Discovery failed for {service}: {reason}")]
    DiscoveryFailure { service: String, reason: String },

    /// Discovery succeeded but no healthy instance exists.
    #[error("No healthy instances for service: {0}")]
    Unavailable(String),

    /// TLS or transport setup failed while building a channel.
    #[error("Failed to create channel for {service}: {reason}")]
    ChannelCreate { service: String, reason: String },

    /// The registry is unreachable or health checks are not yet passing.
    /// Feeds the retry loop.
    #[error("Transient registration failure: {0}")]
    RegistrationTransient(String),

    /// The registry rejected the record outright; retrying the same record
    /// cannot succeed.
    #[error("Permanent registration failure: {0}")]
    RegistrationPermanent(String),

    /// Cooperative cancellation; never surfaces as a failure state.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("API request failed: {0}")]
    Api(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl Error {
    /// Whether the registration state machine may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RegistrationTransient(_)
            | Error::DiscoveryFailure { .. }
            | Error::Unavailable(_)
            | Error::Transport(_) => true,
            Error::Api(status) => matches!(
                status.code(),
                tonic::Code::Unavailable
                    | tonic::Code::Unknown
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::Aborted
            ),
            _ => false,
        }
    }

    /// Short stable tag used for the `exceptions{exception,...}` counter.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "invalid_config",
            Error::InvalidAddress(_) => "invalid_address",
            Error::ServiceUnknown(_) => "service_unknown",
            Error::DiscoveryFailure { .. } => "discovery_failure",
            Error::Unavailable(_) => "unavailable",
            Error::ChannelCreate { .. } => "channel_create_failure",
            Error::RegistrationTransient(_) => "registration_transient",
            Error::RegistrationPermanent(_) => "registration_permanent",
            Error::Cancelled => "cancelled",
            Error::Api(_) => "grpc_status",
            Error::Transport(_) => "transport",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::RegistrationTransient("registry down".into()).is_retryable());
        assert!(Error::Unavailable("orders".into()).is_retryable());
        assert!(Error::DiscoveryFailure {
            service: "orders".into(),
            reason: "connection refused".into(),
        }
        .is_retryable());
        assert!(Error::Api(tonic::Status::unavailable("later")).is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!Error::RegistrationPermanent("bad record".into()).is_retryable());
        assert!(!Error::InvalidConfig("negative port".into()).is_retryable());
        assert!(!Error::Api(tonic::Status::invalid_argument("no")).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::ServiceUnknown("x".into()).kind(), "service_unknown");
        assert_eq!(
            Error::ChannelCreate {
                service: "x".into(),
                reason: "tls".into()
            }
            .kind(),
            "channel_create_failure"
        );
    }
}
