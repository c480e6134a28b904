// SPDX-License-Identifier: MIT OR Apache-2.0

//! The registration lifecycle: drive the registrar until `Registered`, retry
//! with backoff, enforce the required-timeout gate, re-register after losses,
//! and deregister on shutdown.

mod readiness;
mod state;

pub use readiness::{ReadinessGate, ReadinessReport};
pub use state::{RegistrationState, StateCell};

use crate::config::RegistrationSettings;
use crate::error::{Error, Result};
use crate::registry::{RegistrationEvent, RegistrationEvents, Registrar, RegistrationRecord};
use crate::runtime::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEREGISTER_DEADLINE: Duration = Duration::from_secs(10);

/// Invoked when required registration times out. The default handler ends
/// the process with a non-zero exit code.
pub trait FatalHandler: Send + Sync {
    fn fatal(&self, message: &str);
}

pub struct ExitFatalHandler;

impl FatalHandler for ExitFatalHandler {
    fn fatal(&self, message: &str) {
        tracing::error!("{message}");
        std::process::exit(1);
    }
}

enum Cycle {
    Registered(String, RegistrationEvents),
    Exhausted,
}

pub struct RegistrationLifecycle {
    settings: RegistrationSettings,
    record: RegistrationRecord,
    registrar: Arc<dyn Registrar>,
    /// Human-readable registry location for the required-timeout diagnostic.
    registry_endpoint: String,
    state: Arc<StateCell>,
    service_id: std::sync::Mutex<Option<String>>,
    fatal: Arc<dyn FatalHandler>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
    // Dedicated mutex: the required timer must never be scheduled twice.
    required_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RegistrationLifecycle {
    #[must_use]
    pub fn new(
        settings: RegistrationSettings,
        record: RegistrationRecord,
        registrar: Arc<dyn Registrar>,
        registry_endpoint: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_fatal_handler(
            settings,
            record,
            registrar,
            registry_endpoint,
            Arc::new(ExitFatalHandler),
        )
    }

    #[must_use]
    pub fn with_fatal_handler(
        settings: RegistrationSettings,
        record: RegistrationRecord,
        registrar: Arc<dyn Registrar>,
        registry_endpoint: impl Into<String>,
        fatal: Arc<dyn FatalHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            record,
            registrar,
            registry_endpoint: registry_endpoint.into(),
            state: Arc::new(StateCell::new()),
            service_id: std::sync::Mutex::new(None),
            fatal,
            driver: Mutex::new(None),
            required_timer: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &RegistrationSettings {
        &self.settings
    }

    #[must_use]
    pub fn record(&self) -> &RegistrationRecord {
        &self.record
    }

    #[must_use]
    pub fn state(&self) -> RegistrationState {
        self.state.get()
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn service_id(&self) -> Option<String> {
        self.service_id.lock().ok().and_then(|id| id.clone())
    }

    /// Begin registration. A no-op when registration is disabled or already
    /// started; at most one attempt is ever in flight.
    pub async fn start(self: Arc<Self>) {
        if !self.settings.enabled {
            tracing::info!("Registration disabled; not registering");
            return;
        }
        if !self.state.transition(
            RegistrationState::Unregistered,
            RegistrationState::Registering,
        ) {
            tracing::warn!(state = %self.state.get(), "Registration already started");
            return;
        }

        if self.settings.required {
            Arc::clone(&self).schedule_required_timer().await;
        }

        let handle = tokio::spawn(Arc::clone(&self).drive());
        *self.driver.lock().await = Some(handle);
    }

    /// Cancel every timer and pending attempt, then deregister bounded by
    /// the 10 s deadline.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.driver.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.required_timer.lock().await.take() {
            handle.abort();
        }

        if self.state.get() == RegistrationState::Registered {
            self.state.force(RegistrationState::Deregistering);
            match tokio::time::timeout(
                DEREGISTER_DEADLINE,
                self.registrar.unregister(&self.record),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Deregistration failed during shutdown");
                }
                Err(_) => {
                    tracing::warn!("Deregistration exceeded its deadline");
                }
            }
            self.state.force(RegistrationState::Deregistered);
        }
    }

    async fn schedule_required_timer(self: Arc<Self>) {
        let mut slot = self.required_timer.lock().await;
        if slot.is_some() {
            return;
        }
        let this = Arc::clone(&self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(this.settings.required_timeout).await;
            if this.state.get() != RegistrationState::Registered {
                let message = format!(
                    "Required registration of {:?} did not complete within {:?} \
                     (registry: {}); terminating",
                    this.record.name, this.settings.required_timeout, this.registry_endpoint
                );
                this.state.force(RegistrationState::Failed);
                this.fatal.fatal(&message);
            }
        }));
    }

    async fn cancel_required_timer(&self) {
        if let Some(handle) = self.required_timer.lock().await.take() {
            handle.abort();
        }
    }

    async fn drive(self: Arc<Self>) {
        let backoff = ExponentialBackoff::from_settings(&self.settings.retry);

        loop {
            self.state.force(RegistrationState::Registering);

            let mut attempt: u32 = 0;
            let outcome = loop {
                match self.attempt_once().await {
                    Ok((service_id, events)) => break Cycle::Registered(service_id, events),
                    Err(e) => {
                        if matches!(e, Error::RegistrationPermanent(_)) {
                            tracing::error!(error = %e, "Registration rejected by the registry");
                            break Cycle::Exhausted;
                        }
                        tracing::warn!(error = %e, attempt, "Registration attempt failed");
                        attempt += 1;
                        // Unbounded when required: the required-timeout is
                        // the bound there.
                        if !self.settings.required && attempt >= self.settings.retry.max_attempts
                        {
                            break Cycle::Exhausted;
                        }
                        tokio::time::sleep(backoff.delay(attempt - 1)).await;
                    }
                }
            };

            match outcome {
                Cycle::Registered(service_id, mut events) => {
                    self.cancel_required_timer().await;
                    if let Ok(mut slot) = self.service_id.lock() {
                        *slot = Some(service_id.clone());
                    }
                    self.state.force(RegistrationState::Registered);
                    tracing::info!(service_id = %service_id, "Registration complete");

                    // In gRPC mode the stream stays open; watch it. A clean
                    // close after the terminal event is not a failure.
                    match events.next().await {
                        None => return,
                        Some(event) => {
                            tracing::warn!(
                                ?event,
                                "Registration lost; scheduling re-registration"
                            );
                        }
                    }
                }
                Cycle::Exhausted => {
                    if !self.settings.re_registration.enabled {
                        self.state.force(RegistrationState::Failed);
                        tracing::error!("Registration failed; re-registration disabled");
                        return;
                    }
                    tracing::warn!(
                        interval = ?self.settings.re_registration.interval,
                        "Registration retries exhausted; will re-register"
                    );
                }
            }

            // Re-registration path: drop the cached registry channel so the
            // next attempt re-discovers it, then wait out the interval.
            self.registrar.reset().await;
            self.state.force(RegistrationState::Unregistered);
            tokio::time::sleep(self.settings.re_registration.interval).await;
        }
    }

    async fn attempt_once(&self) -> Result<(String, RegistrationEvents)> {
        let mut events = self.registrar.register(&self.record).await?;
        while let Some(event) = events.next().await {
            tracing::debug!(?event, "Registration event");
            match event {
                RegistrationEvent::Completed { service_id } => {
                    return Ok((service_id, events));
                }
                RegistrationEvent::Failed { message, permanent } => {
                    return Err(if permanent {
                        Error::RegistrationPermanent(message)
                    } else {
                        Error::RegistrationTransient(message)
                    });
                }
                RegistrationEvent::StreamLost { message } => {
                    return Err(Error::RegistrationTransient(message));
                }
                _ => {}
            }
        }
        Err(Error::RegistrationTransient(
            "registration stream ended before a terminal event".into(),
        ))
    }
}
