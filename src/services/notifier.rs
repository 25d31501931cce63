//! Notification sink - drains alerts off the hot path
//!
//! Producers enqueue with `try_send` and never wait; a full queue drops the
//! alert and counts it. The worker logs each alert, persists it through the
//! run store and blinks the alert LED for warnings and above.

use crate::domain::{Alert, AlertLevel};
use crate::infra::config::NotificationsConfig;
use crate::infra::metrics::Metrics;
use crate::io::store::RunStore;
use crate::services::outputs::OutputGateway;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Cloneable producer handle
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Alert>,
    metrics: Arc<Metrics>,
}

impl Notifier {
    /// Enqueue an alert. Returns false if the queue was full or closed.
    pub fn send(&self, alert: Alert) -> bool {
        match self.tx.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                self.metrics.record_alert_dropped();
                warn!(level = %alert.level.as_str(), message = %alert.message, "alert_dropped_queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                warn!(level = %alert.level.as_str(), message = %alert.message, "alert_dropped_sink_closed");
                false
            }
        }
    }

    pub fn notify(&self, level: AlertLevel, message: impl Into<String>) -> bool {
        self.send(Alert::new(level, message))
    }
}

#[derive(Debug, Clone)]
pub struct BlinkPattern {
    pub output: String,
    pub on: Duration,
    pub off: Duration,
}

impl BlinkPattern {
    pub fn from_config(config: &NotificationsConfig) -> Self {
        Self {
            output: config.blink_output.clone(),
            on: Duration::from_millis(config.blink_on_ms),
            off: Duration::from_millis(config.blink_off_ms),
        }
    }

    /// Number of blinks for an alert level
    pub fn blinks_for(level: AlertLevel) -> u32 {
        match level {
            AlertLevel::Info => 0,
            AlertLevel::Warning => 1,
            AlertLevel::Error => 2,
            AlertLevel::Critical => 3,
        }
    }
}

pub struct NotificationWorker {
    rx: mpsc::Receiver<Alert>,
    store: Arc<dyn RunStore>,
    gateway: Option<Arc<OutputGateway>>,
    blink: BlinkPattern,
    metrics: Arc<Metrics>,
}

impl NotificationWorker {
    /// Run until shutdown or until every producer is gone. Alerts already
    /// queued at shutdown are still logged and persisted, without blinking.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(output = %self.blink.output, "notification_worker_started");

        loop {
            let alert = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                alert = self.rx.recv() => alert,
            };
            let Some(alert) = alert else {
                info!("notification_worker_stopped");
                return;
            };
            self.handle(alert, true).await;
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Some(alert) = self.rx.recv().await {
            self.handle(alert, false).await;
            drained += 1;
        }
        info!(drained = %drained, "notification_worker_stopped");
    }

    async fn handle(&self, alert: Alert, blink: bool) {
        self.metrics.record_alert(alert.level);
        let details = alert.details.as_ref().map(|d| d.to_string()).unwrap_or_default();
        match alert.level {
            AlertLevel::Info => info!(message = %alert.message, details = %details, "alert"),
            AlertLevel::Warning => warn!(message = %alert.message, details = %details, "alert"),
            AlertLevel::Error | AlertLevel::Critical => {
                error!(level = %alert.level.as_str(), message = %alert.message, details = %details, "alert")
            }
        }

        if let Err(e) = self.store.log_alert(&alert).await {
            warn!(error = %e, "alert_log_failed");
        }

        if blink {
            self.blink(BlinkPattern::blinks_for(alert.level)).await;
        }
    }

    /// Blink the alert LED around whatever its owner last commanded
    async fn blink(&self, count: u32) {
        let Some(gateway) = &self.gateway else {
            return;
        };
        let output = &self.blink.output;

        let mut settled = true;
        for _ in 0..count {
            settled = false;
            if gateway.overlay_output(output, true).await.is_err() {
                break;
            }
            tokio::time::sleep(self.blink.on).await;
            if gateway.overlay_output(output, false).await.is_err() {
                break;
            }
            settled = true;
            tokio::time::sleep(self.blink.off).await;
        }

        if !settled {
            let _ = gateway.overlay_output(output, false).await;
        }
    }
}

/// Create the notification channel and worker
///
/// Returns the producer handle (cloned into every component that raises
/// alerts) and the worker (to be spawned)
pub fn create_notifier(
    store: Arc<dyn RunStore>,
    gateway: Option<Arc<OutputGateway>>,
    config: &NotificationsConfig,
    metrics: Arc<Metrics>,
) -> (Notifier, NotificationWorker) {
    let (tx, rx) = mpsc::channel(config.queue_size.max(1));
    let notifier = Notifier { tx, metrics: metrics.clone() };
    let worker =
        NotificationWorker { rx, store, gateway, blink: BlinkPattern::from_config(config), metrics };
    (notifier, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::OutputsConfig;
    use crate::io::store::JsonlRunStore;
    use crate::services::test_support::FakeBus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let config = NotificationsConfig { queue_size: 2, ..Default::default() };
        let (notifier, _worker) =
            create_notifier(Arc::new(JsonlRunStore::in_memory()), None, &config, metrics.clone());

        assert!(notifier.notify(AlertLevel::Info, "one"));
        assert!(notifier.notify(AlertLevel::Info, "two"));
        assert!(!notifier.notify(AlertLevel::Info, "three"));
        assert_eq!(metrics.alerts_dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_blinks_and_restores_led() {
        let bus = Arc::new(FakeBus::new(4, 8));
        let metrics = Arc::new(Metrics::new());
        let outputs = OutputsConfig::default();
        let gateway = Arc::new(OutputGateway::new(bus.clone(), &outputs, 3, metrics.clone()));
        gateway.write_output("led_red", true).await.unwrap();

        let (notifier, worker) = create_notifier(
            Arc::new(JsonlRunStore::in_memory()),
            Some(gateway.clone()),
            &NotificationsConfig::default(),
            metrics,
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        notifier.notify(AlertLevel::Critical, "stalled product: x");
        tokio::time::sleep(Duration::from_secs(2)).await;

        let red: Vec<bool> = bus.writes_to(outputs.led_red).iter().map(|(v, _)| *v).collect();
        // initial on, then three off/on blinks
        assert_eq!(red, vec![true, false, true, false, true, false, true]);
        assert_eq!(bus.coil(outputs.led_red), Some(true));

        drop(notifier);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_does_not_blink() {
        let bus = Arc::new(FakeBus::new(4, 8));
        let metrics = Arc::new(Metrics::new());
        let outputs = OutputsConfig::default();
        let gateway = Arc::new(OutputGateway::new(bus.clone(), &outputs, 3, metrics.clone()));
        let (notifier, worker) = create_notifier(
            Arc::new(JsonlRunStore::in_memory()),
            Some(gateway),
            &NotificationsConfig::default(),
            metrics,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        notifier.notify(AlertLevel::Info, "run started");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(bus.writes_to(outputs.led_red).is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blink_settles_on_latest_command() {
        let bus = Arc::new(FakeBus::new(4, 8));
        let metrics = Arc::new(Metrics::new());
        let outputs = OutputsConfig::default();
        let gateway = Arc::new(OutputGateway::new(bus.clone(), &outputs, 3, metrics.clone()));
        gateway.write_output("led_red", true).await.unwrap();

        let (notifier, worker) = create_notifier(
            Arc::new(JsonlRunStore::in_memory()),
            Some(gateway.clone()),
            &NotificationsConfig::default(),
            metrics,
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        notifier.notify(AlertLevel::Critical, "stalled product: x");
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Line restarted while the first blink is still on
        gateway.write_output("led_red", false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(bus.coil(outputs.led_red), Some(false));
        assert_eq!(gateway.last_commanded("led_red"), Some(false));

        drop(notifier);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_alerts_survive_shutdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let store = Arc::new(JsonlRunStore::open(path.to_str().unwrap()).unwrap());
        let (notifier, worker) = create_notifier(
            store,
            None,
            &NotificationsConfig::default(),
            Arc::new(Metrics::new()),
        );
        for message in ["a", "b", "c"] {
            assert!(notifier.notify(AlertLevel::Error, message));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        worker.run(shutdown_rx).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let messages: Vec<String> = content
            .lines()
            .map(|line| {
                let record: serde_json::Value = serde_json::from_str(line).unwrap();
                record["alert"]["message"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
        assert!(!notifier.notify(AlertLevel::Info, "late"));
    }
}
