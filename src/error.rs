//! Error types
//!
//! Component errors are typed so the orchestrator can decide what is fatal
//! for a run and what is only logged. None of them cross the orchestrator's
//! public API, which reports `bool` / status snapshots instead.

use crate::domain::OperatingMode;
use thiserror::Error;

/// Discrete I/O bus failures (serial port, Modbus framing, device exceptions)
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("serial port {device} unavailable: {reason}")]
    PortUnavailable { device: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for slave {slave} (function 0x{function:02X})")]
    Timeout { slave: u8, function: u8 },

    #[error("bad response frame: {0}")]
    BadFrame(String),

    #[error("slave {slave} returned exception code 0x{code:02X}")]
    Exception { slave: u8, code: u8 },

    #[error("unknown output '{0}'")]
    UnknownOutput(String),
}

/// Run store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("run {0} not found")]
    UnknownRun(u64),
}

/// Failures of best-effort collaborators (camera, inspection, audio)
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} disabled")]
    Disabled(&'static str),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Why a start request was refused
#[derive(Debug, Error)]
pub enum StartError {
    #[error("cannot start while {}", .0.as_str())]
    AlreadyActive(OperatingMode),

    #[error("target count must be at least 1")]
    ZeroTarget,

    #[error("profile {0} not found")]
    ProfileNotFound(u32),

    #[error("profile {0} has no linked camera profile")]
    MissingCameraProfile(u32),

    #[error("operator {0} not found")]
    OperatorNotFound(u32),

    #[error("profile store error: {0}")]
    ProfileStore(StoreError),

    #[error("could not create run record: {0}")]
    Store(#[from] StoreError),

    #[error("start outputs failed: {0}")]
    Hardware(#[from] HardwareError),
}
