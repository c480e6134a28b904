// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime pieces that sit above the individual components: retry backoff
//! and the orchestrator that wires everything together.

mod orchestrator;
mod retry;

pub use orchestrator::Orchestrator;
pub use retry::ExponentialBackoff;
