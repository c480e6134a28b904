// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{RegistrationLifecycle, RegistrationState};
use std::sync::Arc;

/// Boolean readiness derived from the lifecycle: up when registration is
/// disabled, not required, or completed.
#[derive(Clone)]
pub struct ReadinessGate {
    lifecycle: Arc<RegistrationLifecycle>,
}

/// Structured view for health endpoints and observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub up: bool,
    pub state: RegistrationState,
    pub service_id: Option<String>,
}

impl ReadinessGate {
    #[must_use]
    pub fn new(lifecycle: Arc<RegistrationLifecycle>) -> Self {
        Self { lifecycle }
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        let settings = self.lifecycle.settings();
        !settings.enabled
            || !settings.required
            || self.lifecycle.state() == RegistrationState::Registered
    }

    #[must_use]
    pub fn report(&self) -> ReadinessReport {
        ReadinessReport {
            up: self.is_up(),
            state: self.lifecycle.state(),
            service_id: self.lifecycle.service_id(),
        }
    }
}
