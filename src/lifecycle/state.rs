// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;

/// The registration state machine's closed state set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Deregistering,
    Deregistered,
    Failed,
}

impl RegistrationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Deregistering => "deregistering",
            RegistrationState::Deregistered => "deregistered",
            RegistrationState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single atomic state cell. Transitions are compare-and-set; observers
/// subscribe through a watch channel.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
    tx: watch::Sender<RegistrationState>,
}

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            state: AtomicU8::new(Self::encode(RegistrationState::Unregistered)),
            tx,
        }
    }

    fn encode(state: RegistrationState) -> u8 {
        match state {
            RegistrationState::Unregistered => 0,
            RegistrationState::Registering => 1,
            RegistrationState::Registered => 2,
            RegistrationState::Deregistering => 3,
            RegistrationState::Deregistered => 4,
            RegistrationState::Failed => 5,
        }
    }

    fn decode(value: u8) -> RegistrationState {
        match value {
            0 => RegistrationState::Unregistered,
            1 => RegistrationState::Registering,
            2 => RegistrationState::Registered,
            3 => RegistrationState::Deregistering,
            4 => RegistrationState::Deregistered,
            _ => RegistrationState::Failed,
        }
    }

    #[must_use]
    pub fn get(&self) -> RegistrationState {
        Self::decode(self.state.load(Ordering::Acquire))
    }

    /// Compare-and-set transition. Returns `false` when the current state is
    /// not `from`.
    pub fn transition(&self, from: RegistrationState, to: RegistrationState) -> bool {
        let swapped = self
            .state
            .compare_exchange(
                Self::encode(from),
                Self::encode(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            self.tx.send_replace(to);
            tracing::debug!(from = %from, to = %to, "Registration state transition");
        }
        swapped
    }

    /// Unconditional transition; used where the state machine re-enters a
    /// cycle regardless of the state it left behind.
    pub fn force(&self, to: RegistrationState) {
        self.state.store(Self::encode(to), Ordering::Release);
        self.tx.send_replace(to);
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
