//! In-flight tracker - items between the entry and exit sensors
//!
//! Items are matched strictly FIFO: an exit always removes the oldest entry.
//! Each item carries its own stall deadline. A single watchdog task sleeps
//! until the earliest deadline; removal on exit and removal on stall happen
//! under the same lock, so exactly one of them wins for any item.

use crate::domain::ItemSerial;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Receiver of run-ending failures detected outside the orchestrator
#[async_trait]
pub trait RunFailureSink: Send + Sync {
    async fn trigger_run_failure(&self, reason: String);
}

#[derive(Debug, Clone)]
pub struct InFlightItem {
    pub serial: ItemSerial,
    pub entry_time: Instant,
    pub deadline: Instant,
}

#[derive(Default)]
struct TrackerState {
    items: VecDeque<InFlightItem>,
    /// Set between an entry Triggered and the next entry Cleared
    entry_blocked_since: Option<Instant>,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    wake: Notify,
    max_transit_ms: AtomicU64,
    sink: Mutex<Option<Weak<dyn RunFailureSink>>>,
    metrics: Arc<Metrics>,
}

impl TrackerInner {
    fn max_transit(&self) -> Duration {
        Duration::from_millis(self.max_transit_ms.load(Ordering::Relaxed))
    }

    fn push(&self, serial: ItemSerial, entry_time: Instant) {
        let deadline = entry_time + self.max_transit();
        let in_flight = {
            let mut state = self.state.lock();
            state.items.push_back(InFlightItem { serial: serial.clone(), entry_time, deadline });
            state.items.len()
        };
        self.wake.notify_one();
        self.metrics.record_item_entered();
        self.metrics.set_in_flight(in_flight);
        info!(serial = %serial, in_flight = %in_flight, "item_entered");
    }

    /// Remove `serial` if it is still in flight and report the stall
    async fn stall(&self, serial: &ItemSerial) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.items.iter().position(|item| &item.serial == serial) {
                Some(pos) => state.items.remove(pos),
                None => None,
            }
        };
        let Some(item) = removed else {
            return false;
        };

        warn!(
            serial = %item.serial,
            in_transit_ms = %item.entry_time.elapsed().as_millis(),
            "item_stalled"
        );
        self.metrics.record_item_stalled();

        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        match sink {
            Some(sink) => sink.trigger_run_failure(format!("stalled product: {}", item.serial)).await,
            None => warn!(serial = %item.serial, "stall_without_failure_sink"),
        }
        true
    }

    /// Serials whose deadline has passed, oldest first
    fn expired(&self, now: Instant) -> Vec<ItemSerial> {
        self.state
            .lock()
            .items
            .iter()
            .filter(|item| item.deadline <= now)
            .map(|item| item.serial.clone())
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().items.iter().map(|item| item.deadline).min()
    }
}

async fn watchdog(inner: Arc<TrackerInner>) {
    loop {
        match inner.next_deadline() {
            None => inner.wake.notified().await,
            Some(deadline) => {
                tokio::select! {
                    _ = inner.wake.notified() => continue,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                for serial in inner.expired(Instant::now()) {
                    inner.stall(&serial).await;
                }
            }
        }
    }
}

pub struct InFlightTracker {
    inner: Arc<TrackerInner>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl InFlightTracker {
    pub fn new(max_transit: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState::default()),
                wake: Notify::new(),
                max_transit_ms: AtomicU64::new(max_transit.as_millis() as u64),
                sink: Mutex::new(None),
                metrics,
            }),
            watchdog: Mutex::new(None),
        }
    }

    /// Connect the failure sink and start the stall watchdog
    pub fn start_watchdog(&self, sink: Weak<dyn RunFailureSink>) {
        *self.inner.sink.lock() = Some(sink);
        let mut watchdog_handle = self.watchdog.lock();
        if watchdog_handle.is_none() {
            *watchdog_handle = Some(tokio::spawn(watchdog(self.inner.clone())));
        }
    }

    /// Applies to items entering from now on
    pub fn set_max_transit(&self, max_transit: Duration) {
        self.inner.max_transit_ms.store(max_transit.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn on_entry(&self, serial: ItemSerial) {
        self.inner.push(serial, Instant::now());
    }

    /// Entry sensor triggered. Returns the new serial, or `None` while the
    /// sensor is still blocked by the previous item.
    pub fn register_entry(&self, timestamp: Instant) -> Option<ItemSerial> {
        {
            let mut state = self.inner.state.lock();
            if state.entry_blocked_since.is_some() {
                debug!("entry_duplicate_suppressed");
                return None;
            }
            state.entry_blocked_since = Some(timestamp);
        }
        let serial = ItemSerial::generate();
        self.inner.push(serial.clone(), timestamp);
        Some(serial)
    }

    /// Entry sensor cleared. Returns how long it was blocked.
    pub fn entry_cleared(&self, timestamp: Instant) -> Option<Duration> {
        let since = self.inner.state.lock().entry_blocked_since.take()?;
        Some(timestamp.saturating_duration_since(since))
    }

    /// FIFO: the oldest in-flight item leaves
    pub fn on_exit(&self) -> Option<ItemSerial> {
        let (item, in_flight) = {
            let mut state = self.inner.state.lock();
            let item = state.items.pop_front();
            (item, state.items.len())
        };
        let item = item?;
        self.inner.wake.notify_one();
        self.inner.metrics.set_in_flight(in_flight);
        info!(
            serial = %item.serial,
            transit_ms = %item.entry_time.elapsed().as_millis(),
            in_flight = %in_flight,
            "item_exited"
        );
        Some(item.serial)
    }

    pub async fn stall(&self, serial: &ItemSerial) -> bool {
        self.inner.stall(serial).await
    }

    /// Drop all items, deadlines and the entry-blocked flag
    pub fn reset(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            let dropped = state.items.len();
            state.items.clear();
            state.entry_blocked_since = None;
            dropped
        };
        self.inner.wake.notify_one();
        self.inner.metrics.set_in_flight(0);
        if dropped > 0 {
            info!(dropped = %dropped, "tracker_reset");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_entry_blocked(&self) -> bool {
        self.inner.state.lock().entry_blocked_since.is_some()
    }
}

impl Drop for InFlightTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }
}
