//! Per-item capture pipeline spawned on entry
//!
//! Runs off the state lock. Results only ever degrade to a `CaptureFailed`
//! record; nothing here can end a run.

use crate::domain::{ItemSerial, RunEvent, RunEventKind, RunId};
use crate::error::CollaboratorError;
use crate::infra::metrics::Metrics;
use crate::io::camera::Camera;
use crate::io::inspector::Inspector;
use crate::io::store::RunStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(super) struct CaptureJob {
    pub run_id: RunId,
    pub serial: ItemSerial,
    pub camera: Arc<dyn Camera>,
    pub inspector: Arc<dyn Inspector>,
    pub store: Arc<dyn RunStore>,
    pub metrics: Arc<Metrics>,
    pub camera_id: String,
    pub trigger_delay: Duration,
    pub camera_timeout: Duration,
    pub inspection_timeout: Duration,
}

impl CaptureJob {
    pub async fn run(self) {
        if !self.trigger_delay.is_zero() {
            tokio::time::sleep(self.trigger_delay).await;
        }

        let captured = tokio::time::timeout(
            self.camera_timeout,
            self.camera.capture(&self.camera_id, self.serial.as_str()),
        )
        .await;
        let image = match captured {
            Ok(Ok(image)) => image,
            Ok(Err(CollaboratorError::Disabled(_))) => return,
            Ok(Err(e)) => return self.capture_failed(e.to_string()).await,
            Err(_) => return self.capture_failed("capture timed out".to_string()).await,
        };
        self.metrics.record_capture(true);
        self.record(RunEventKind::Captured { path: image.path.display().to_string() }).await;

        let verdict =
            match tokio::time::timeout(self.inspection_timeout, self.inspector.inspect(&image)).await {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(CollaboratorError::Disabled(_))) => return,
                Ok(Err(e)) => {
                    warn!(serial = %self.serial, error = %e, "inspection_failed");
                    return;
                }
                Err(_) => {
                    warn!(serial = %self.serial, "inspection_timeout");
                    return;
                }
            };

        if verdict.is_reject() {
            self.metrics.record_inspection_reject();
            info!(run_id = %self.run_id, serial = %self.serial, verdict = ?verdict, "item_rejected");
        } else {
            debug!(run_id = %self.run_id, serial = %self.serial, "item_accepted");
        }
        self.record(RunEventKind::Inspected { verdict }).await;
    }

    async fn capture_failed(&self, error: String) {
        warn!(run_id = %self.run_id, serial = %self.serial, error = %error, "capture_failed");
        self.metrics.record_capture(false);
        self.record(RunEventKind::CaptureFailed { error }).await;
    }

    async fn record(&self, kind: RunEventKind) {
        let event = RunEvent::new(self.serial.clone(), kind);
        if let Err(e) = self.store.record_event(self.run_id, &event).await {
            warn!(run_id = %self.run_id, error = %e, "run_event_record_failed");
        }
    }
}
