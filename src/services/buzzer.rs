//! Buzzer sequencer
//!
//! Beep requests only ever push the OFF deadline later, so overlapping
//! requests merge into a single ON period. A tick loop is the only writer of
//! the buzzer coil.

use crate::services::outputs::{OutputGateway, BUZZER};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct BuzzerSequencer {
    gateway: Arc<OutputGateway>,
    off_deadline: Arc<Mutex<Option<Instant>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BuzzerSequencer {
    /// Spawn the tick loop
    pub fn start(gateway: Arc<OutputGateway>, tick: Duration) -> Self {
        let off_deadline = Arc::new(Mutex::new(None));
        let task = tokio::spawn(Self::run(gateway.clone(), off_deadline.clone(), tick));
        info!(tick_ms = %tick.as_millis(), "buzzer_sequencer_started");
        Self { gateway, off_deadline, task: Mutex::new(Some(task)) }
    }

    /// Keep the buzzer on for at least `duration` from now
    pub fn beep_for(&self, duration: Duration) {
        let requested = Instant::now() + duration;
        let mut deadline = self.off_deadline.lock();
        if deadline.map_or(true, |current| requested > current) {
            *deadline = Some(requested);
        }
    }

    async fn run(
        gateway: Arc<OutputGateway>,
        off_deadline: Arc<Mutex<Option<Instant>>>,
        tick: Duration,
    ) {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // None until a write succeeds
        let mut on: Option<bool> = None;
        loop {
            ticker.tick().await;
            let deadline = *off_deadline.lock();
            let want_on = deadline.is_some_and(|d| Instant::now() < d);
            if on == Some(want_on) {
                continue;
            }
            match gateway.write_output(BUZZER, want_on).await {
                Ok(()) => {
                    on = Some(want_on);
                    debug!(on = %want_on, "buzzer_switched");
                }
                Err(e) => warn!(error = %e, want_on = %want_on, "buzzer_write_failed"),
            }
        }
    }

    /// Stop the loop and force the buzzer off
    pub async fn shutdown(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        *self.off_deadline.lock() = None;
        if let Err(e) = self.gateway.write_output(BUZZER, false).await {
            warn!(error = %e, "buzzer_off_on_shutdown_failed");
        }
        info!("buzzer_sequencer_stopped");
    }
}

impl Drop for BuzzerSequencer {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
