//! Run (batch) records as handed to the run store

use crate::domain::types::ItemSerial;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned by the run store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a persisted run record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRecordStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunRecordStatus::Running => "running",
            RunRecordStatus::Completed => "completed",
            RunRecordStatus::Failed => "failed",
            RunRecordStatus::Aborted => "aborted",
        }
    }
}

/// Everything needed to open a run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub batch_code: String,
    pub profile_id: u32,
    pub profile_name: String,
    pub product_name: String,
    pub operator_id: Option<u32>,
    pub operator_name: Option<String>,
    pub target_count: u32,
    pub started_at: DateTime<Utc>,
}

/// Result of the external quality inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject { reason: String },
}

impl Verdict {
    #[inline]
    pub fn is_reject(&self) -> bool {
        matches!(self, Verdict::Reject { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventKind {
    /// Item passed the exit sensor and was counted
    Counted,
    /// Entry image captured
    Captured { path: String },
    Inspected { verdict: Verdict },
    CaptureFailed { error: String },
}

/// One item-level event within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub serial: ItemSerial,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

impl RunEvent {
    pub fn new(serial: ItemSerial, kind: RunEventKind) -> Self {
        Self { serial, at: Utc::now(), kind }
    }

    #[inline]
    pub fn is_reject(&self) -> bool {
        matches!(&self.kind, RunEventKind::Inspected { verdict } if verdict.is_reject())
    }
}

/// Count rejects among the events of one run
pub fn reject_count(events: &[RunEvent]) -> usize {
    events.iter().filter(|e| e.is_reject()).count()
}
