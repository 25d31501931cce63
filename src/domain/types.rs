//! Shared types for the line controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Newtype wrapper for discrete input channel numbers (1-based, as wired)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SensorId(pub u8);

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical (polarity corrected) sensor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorState {
    /// Object in the sensor field
    Triggered,
    /// Field is clear
    Cleared,
}

impl SensorState {
    /// NPN sensors pull the line low when they see an object
    #[inline]
    pub fn from_raw_npn(raw_level: bool) -> Self {
        if raw_level {
            SensorState::Cleared
        } else {
            SensorState::Triggered
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorState::Triggered => "triggered",
            SensorState::Cleared => "cleared",
        }
    }
}

/// A debounced sensor transition, produced once by the poller
#[derive(Debug, Clone)]
pub struct SensorEvent {
    pub sensor_id: SensorId,
    pub new_state: SensorState,
    pub timestamp: Instant,
}

impl SensorEvent {
    #[inline]
    pub fn new(sensor_id: SensorId, new_state: SensorState) -> Self {
        Self { sensor_id, new_state, timestamp: Instant::now() }
    }
}

/// Opaque identifier of an item on the belt (UUIDv7, time-sortable)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemSerial(String);

impl ItemSerial {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemSerial {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ItemSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// High-level operating mode of the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Stopped,
    /// Profile loaded, conveyor not running
    Idle,
    Running,
    PostRunDelay,
    PausedBetweenBatches,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Stopped => "stopped",
            OperatingMode::Idle => "idle",
            OperatingMode::Running => "running",
            OperatingMode::PostRunDelay => "post_run_delay",
            OperatingMode::PausedBetweenBatches => "paused_between_batches",
        }
    }

    /// Modes that belong to an active batch loop
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperatingMode::Running | OperatingMode::PostRunDelay | OperatingMode::PausedBetweenBatches
        )
    }
}

/// Operator-visible alarm. Only one can be active at a time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alarm {
    pub message: String,
    pub set_at: DateTime<Utc>,
}

impl Alarm {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), set_at: Utc::now() }
    }
}

/// Connectivity of the discrete I/O bus as seen by the poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoHealth {
    Connected,
    #[default]
    Disconnected,
}

impl IoHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoHealth::Connected => "connected",
            IoHealth::Disconnected => "disconnected",
        }
    }
}

/// Point-in-time status snapshot published after every transition
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub mode: OperatingMode,
    pub active_profile: Option<String>,
    pub product_name: Option<String>,
    pub operator_name: Option<String>,
    pub batch_code: Option<String>,
    pub run_id: Option<u64>,
    pub run_progress: u32,
    pub target_count: u32,
    pub post_batch_delay_secs: u64,
    pub active_alarm_message: Option<String>,
    pub in_flight: usize,
    pub io_health: IoHealth,
}

/// Severity of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::str::FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(AlertLevel::Info),
            "warning" | "warn" => Ok(AlertLevel::Warning),
            "error" => Ok(AlertLevel::Error),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(format!("unknown alert level: {other}")),
        }
    }
}

/// Notification routed through the notification sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        Self { level, message: message.into(), details: None, at: Utc::now() }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npn_polarity() {
        assert_eq!(SensorState::from_raw_npn(false), SensorState::Triggered);
        assert_eq!(SensorState::from_raw_npn(true), SensorState::Cleared);
    }

    #[test]
    fn test_item_serials_are_unique() {
        let a = ItemSerial::generate();
        let b = ItemSerial::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_active_modes() {
        assert!(!OperatingMode::Stopped.is_active());
        assert!(!OperatingMode::Idle.is_active());
        assert!(OperatingMode::Running.is_active());
        assert!(OperatingMode::PostRunDelay.is_active());
        assert!(OperatingMode::PausedBetweenBatches.is_active());
    }

    #[test]
    fn test_alert_level_from_str() {
        assert_eq!("WARNING".parse::<AlertLevel>().unwrap(), AlertLevel::Warning);
        assert_eq!("critical".parse::<AlertLevel>().unwrap(), AlertLevel::Critical);
        assert!("loud".parse::<AlertLevel>().is_err());
    }

    #[test]
    fn test_status_serializes_mode_as_string() {
        let status = RunStatus { mode: OperatingMode::PostRunDelay, ..Default::default() };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mode"], "post_run_delay");
        assert_eq!(json["io_health"], "disconnected");
    }
}
