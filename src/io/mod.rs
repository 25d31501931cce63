//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `modbus` - Modbus RTU master for the discrete input/output modules
//! - `store` - Run records, item events and alerts (JSONL)
//! - `profiles` - Profile and operator lookup
//! - `camera` - Snapshot capture and camera settings over HTTP
//! - `inspector` - Quality inspection service client
//! - `audio` - Event sounds and narration through local players
//! - `http` - Shared HTTP client helpers
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod audio;
pub mod camera;
pub mod http;
pub mod inspector;
pub mod modbus;
pub mod profiles;
pub mod prometheus;
pub mod store;

// Re-export commonly used types
pub use modbus::{DiscreteBus, ModbusRtu, ModbusSettings};
pub use store::{JsonlRunStore, RunStore};
