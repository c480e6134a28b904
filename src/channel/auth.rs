// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call authentication.
//!
//! The token travels as an explicit task-scoped context value rather than a
//! thread-local, so it survives `.await` points: wrap outbound work in
//! [`with_call_token`] and the channel's header injector picks it up.

use crate::config::AuthPolicy;
use crate::error::{Error, Result};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;

tokio::task_local! {
    static CALL_TOKEN: String;
}

/// Run `fut` with `token` as the ambient call token.
pub async fn with_call_token<F>(token: impl Into<String>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CALL_TOKEN.scope(token.into(), fut).await
}

/// The ambient call token of the current task, if any.
#[must_use]
pub fn current_call_token() -> Option<String> {
    CALL_TOKEN.try_with(Clone::clone).ok()
}

/// Source of per-call tokens.
pub trait CallTokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Reads the task-scoped token set by [`with_call_token`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AmbientTokenProvider;

impl CallTokenProvider for AmbientTokenProvider {
    fn token(&self) -> Option<String> {
        current_call_token()
    }
}

/// A fixed token, mostly for tests and service-to-service credentials.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(pub String);

impl CallTokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Injects `{scheme_prefix}{token}` under the configured header on every
/// outbound request that has an ambient token.
pub struct AuthInterceptor {
    header: HeaderName,
    scheme_prefix: String,
    provider: Arc<dyn CallTokenProvider>,
}

impl AuthInterceptor {
    /// Returns `None` when the policy is disabled.
    pub fn from_policy(
        policy: &AuthPolicy,
        provider: Arc<dyn CallTokenProvider>,
    ) -> Result<Option<Self>> {
        if !policy.enabled {
            return Ok(None);
        }
        let header = policy
            .header_name
            .parse::<HeaderName>()
            .map_err(|_| {
                Error::InvalidConfig(format!(
                    "dynamic-grpc.auth.header-name is not a valid header: {:?}",
                    policy.header_name
                ))
            })?;
        Ok(Some(Self {
            header,
            scheme_prefix: policy.scheme_prefix.clone(),
            provider,
        }))
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        let Some(token) = self.provider.token() else {
            return;
        };
        match HeaderValue::from_str(&format!("{}{}", self.scheme_prefix, token)) {
            Ok(value) => {
                headers.insert(self.header.clone(), value);
            }
            Err(_) => {
                tracing::warn!("Call token contains characters not valid in a header; skipping");
            }
        }
    }
}
