//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `orchestrator` - Operating mode state machine and batch loop
//! - `poller` - Sensor polling and edge detection
//! - `outputs` - Output gateway, the single writer of coils
//! - `inflight` - Items between entry and exit, stall watchdog
//! - `buzzer` - Beep request coalescing
//! - `notifier` - Alert queue and worker

pub mod buzzer;
pub mod inflight;
pub mod notifier;
pub mod orchestrator;
pub mod outputs;
pub mod poller;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use buzzer::BuzzerSequencer;
pub use inflight::{InFlightTracker, RunFailureSink};
pub use notifier::{create_notifier, Notifier};
pub use orchestrator::{dispatch_events, Collaborators, Orchestrator};
pub use outputs::OutputGateway;
pub use poller::{PollerEvent, SensorPoller};
