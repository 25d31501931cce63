//! Run store - persists run records, item events and alerts
//!
//! Records are written in JSONL format (one JSON object per line). On open,
//! the existing file is replayed so run ids keep increasing across restarts
//! and `query_events` can answer for older runs.

use crate::domain::{Alert, NewRun, RunEvent, RunId, RunRecordStatus};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &NewRun) -> Result<RunId, StoreError>;
    async fn update_status(
        &self,
        id: RunId,
        status: RunRecordStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn record_event(&self, id: RunId, event: &RunEvent) -> Result<(), StoreError>;
    async fn query_events(&self, id: RunId) -> Result<Vec<RunEvent>, StoreError>;
    async fn log_alert(&self, alert: &Alert) -> Result<(), StoreError>;
}

/// One line of the JSONL file
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoreRecord {
    RunCreated { run_id: RunId, run: NewRun },
    RunStatus { run_id: RunId, status: RunRecordStatus, ended_at: Option<DateTime<Utc>> },
    Event { run_id: RunId, event: RunEvent },
    Alert { alert: Alert },
}

#[derive(Default)]
struct StoreIndex {
    last_id: u64,
    status: FxHashMap<u64, RunRecordStatus>,
    events: FxHashMap<u64, Vec<RunEvent>>,
}

impl StoreIndex {
    fn apply(&mut self, record: StoreRecord) {
        match record {
            StoreRecord::RunCreated { run_id, .. } => {
                self.last_id = self.last_id.max(run_id.0);
                self.status.insert(run_id.0, RunRecordStatus::Running);
            }
            StoreRecord::RunStatus { run_id, status, .. } => {
                self.status.insert(run_id.0, status);
            }
            StoreRecord::Event { run_id, event } => {
                self.events.entry(run_id.0).or_default().push(event);
            }
            StoreRecord::Alert { .. } => {}
        }
    }
}

/// JSONL-backed run store with an in-memory index
pub struct JsonlRunStore {
    file_path: Option<PathBuf>,
    index: Mutex<StoreIndex>,
}

impl JsonlRunStore {
    /// Open (or create on first write) the store at `file_path`
    pub fn open(file_path: &str) -> Result<Self, StoreError> {
        let path = PathBuf::from(file_path);
        let mut index = StoreIndex::default();

        if path.exists() {
            let file = std::fs::File::open(&path)?;
            let mut skipped = 0usize;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoreRecord>(&line) {
                    Ok(record) => index.apply(record),
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!(file = %path.display(), skipped = %skipped, "run_store_malformed_lines");
            }
        }

        info!(file = %path.display(), last_run_id = %index.last_id, "run_store_opened");
        Ok(Self { file_path: Some(path), index: Mutex::new(index) })
    }

    /// Store that keeps everything in memory only
    pub fn in_memory() -> Self {
        Self { file_path: None, index: Mutex::new(StoreIndex::default()) }
    }

    /// Current status of a run record, if known
    pub fn run_status(&self, id: RunId) -> Option<RunRecordStatus> {
        self.index.lock().status.get(&id.0).copied()
    }

    /// Append one record to the file (if any) and apply it to the index.
    /// The index lock is held across the write so line order matches index order.
    fn append(&self, record: StoreRecord) -> Result<(), StoreError> {
        let mut index = self.index.lock();
        self.append_locked(&mut index, record)
    }

    fn append_locked(&self, index: &mut StoreIndex, record: StoreRecord) -> Result<(), StoreError> {
        if let Some(path) = &self.file_path {
            let line = serde_json::to_string(&record)?;
            Self::append_line(path, &line)?;
        }
        index.apply(record);
        Ok(())
    }

    fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %path.display(), bytes = %line.len(), "run_store_written");
        Ok(())
    }
}

#[async_trait]
impl RunStore for JsonlRunStore {
    async fn create_run(&self, run: &NewRun) -> Result<RunId, StoreError> {
        let run_id = {
            let mut index = self.index.lock();
            let run_id = RunId(index.last_id + 1);
            self.append_locked(&mut index, StoreRecord::RunCreated { run_id, run: run.clone() })?;
            run_id
        };
        info!(
            run_id = %run_id,
            batch_code = %run.batch_code,
            profile = %run.profile_name,
            target = %run.target_count,
            "run_record_created"
        );
        Ok(run_id)
    }

    async fn update_status(
        &self,
        id: RunId,
        status: RunRecordStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if !self.index.lock().status.contains_key(&id.0) {
            return Err(StoreError::UnknownRun(id.0));
        }
        self.append(StoreRecord::RunStatus { run_id: id, status, ended_at })?;
        info!(run_id = %id, status = %status.as_str(), "run_record_updated");
        Ok(())
    }

    async fn record_event(&self, id: RunId, event: &RunEvent) -> Result<(), StoreError> {
        if !self.index.lock().status.contains_key(&id.0) {
            return Err(StoreError::UnknownRun(id.0));
        }
        self.append(StoreRecord::Event { run_id: id, event: event.clone() })
    }

    async fn query_events(&self, id: RunId) -> Result<Vec<RunEvent>, StoreError> {
        let index = self.index.lock();
        if !index.status.contains_key(&id.0) {
            return Err(StoreError::UnknownRun(id.0));
        }
        Ok(index.events.get(&id.0).cloned().unwrap_or_default())
    }

    async fn log_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.append(StoreRecord::Alert { alert: alert.clone() })
    }
}
