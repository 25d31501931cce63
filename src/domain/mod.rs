//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `SensorEvent` - debounced input transitions from the poller
//! - `OperatingMode` / `RunStatus` - orchestrator state as seen from outside
//! - `Profile` / `Product` / `Operator` - what a run is configured with
//! - `NewRun` / `RunEvent` - records handed to the run store

pub mod profile;
pub mod run;
pub mod types;

// Re-export commonly used types at module level
pub use profile::{CameraSettings, Operator, Product, Profile};
pub use run::{NewRun, RunEvent, RunEventKind, RunId, RunRecordStatus, Verdict};
pub use types::{
    Alarm, Alert, AlertLevel, IoHealth, ItemSerial, OperatingMode, RunStatus, SensorEvent,
    SensorId, SensorState,
};
