//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::{AlertLevel, OperatingMode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    // Rank of the sample, at least the first one
    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Numeric encoding of the operating mode for the Prometheus gauge
pub fn mode_gauge_value(mode: OperatingMode) -> u64 {
    match mode {
        OperatingMode::Stopped => 0,
        OperatingMode::Idle => 1,
        OperatingMode::Running => 2,
        OperatingMode::PostRunDelay => 3,
        OperatingMode::PausedBetweenBatches => 4,
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Sensor events handled by the orchestrator (monotonic)
    sensor_events_total: AtomicU64,
    sensor_events_since_report: AtomicU64,
    /// Time from poller edge detection to orchestrator handling (reset on report)
    event_latency_sum_us: AtomicU64,
    event_latency_max_us: AtomicU64,
    event_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Input polls (monotonic)
    polls_ok: AtomicU64,
    polls_failed: AtomicU64,
    /// Poll round-trip latency histogram (reset on report)
    poll_latency_buckets: [AtomicU64; NUM_BUCKETS],
    poll_latency_max_us: AtomicU64,
    /// Coil writes (monotonic)
    coil_writes_ok: AtomicU64,
    coil_writes_failed: AtomicU64,
    /// Item lifecycle (monotonic)
    items_entered: AtomicU64,
    items_counted: AtomicU64,
    items_stalled: AtomicU64,
    exits_without_item: AtomicU64,
    size_mismatches: AtomicU64,
    /// Run lifecycle (monotonic)
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_aborted: AtomicU64,
    /// Capture pipeline (monotonic)
    captures_ok: AtomicU64,
    captures_failed: AtomicU64,
    inspection_rejects: AtomicU64,
    /// Notifications by level: info, warning, error, critical (monotonic)
    alerts: [AtomicU64; 4],
    /// Notifications dropped due to a full queue (monotonic)
    alerts_dropped: AtomicU64,
    /// Point-in-time gauges
    mode: AtomicU64,
    in_flight: AtomicU64,
    run_progress: AtomicU64,
    io_connected: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sensor_events_total: AtomicU64::new(0),
            sensor_events_since_report: AtomicU64::new(0),
            event_latency_sum_us: AtomicU64::new(0),
            event_latency_max_us: AtomicU64::new(0),
            event_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            polls_ok: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            poll_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            poll_latency_max_us: AtomicU64::new(0),
            coil_writes_ok: AtomicU64::new(0),
            coil_writes_failed: AtomicU64::new(0),
            items_entered: AtomicU64::new(0),
            items_counted: AtomicU64::new(0),
            items_stalled: AtomicU64::new(0),
            exits_without_item: AtomicU64::new(0),
            size_mismatches: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_aborted: AtomicU64::new(0),
            captures_ok: AtomicU64::new(0),
            captures_failed: AtomicU64::new(0),
            inspection_rejects: AtomicU64::new(0),
            alerts: std::array::from_fn(|_| AtomicU64::new(0)),
            alerts_dropped: AtomicU64::new(0),
            mode: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            run_progress: AtomicU64::new(0),
            io_connected: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a sensor event handled, with latency since it was detected
    #[inline]
    pub fn record_sensor_event(&self, latency_us: u64) {
        self.sensor_events_total.fetch_add(1, Ordering::Relaxed);
        self.sensor_events_since_report.fetch_add(1, Ordering::Relaxed);
        self.event_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.event_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.event_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_poll(&self, ok: bool, latency_us: u64) {
        if ok {
            self.polls_ok.fetch_add(1, Ordering::Relaxed);
            self.poll_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
            update_atomic_max(&self.poll_latency_max_us, latency_us);
        } else {
            self.polls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_coil_write(&self, ok: bool) {
        if ok {
            self.coil_writes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.coil_writes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_item_entered(&self) {
        self.items_entered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_item_counted(&self) {
        self.items_counted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_item_stalled(&self) {
        self.items_stalled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit_without_item(&self) {
        self.exits_without_item.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_size_mismatch(&self) {
        self.size_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_run_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_run_aborted(&self) {
        self.runs_aborted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_capture(&self, ok: bool) {
        if ok {
            self.captures_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.captures_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_inspection_reject(&self) {
        self.inspection_rejects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert(&self, level: AlertLevel) {
        self.alerts[level as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a notification dropped due to a full queue (lock-free)
    #[inline]
    pub fn record_alert_dropped(&self) {
        self.alerts_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_mode(&self, mode: OperatingMode) {
        self.mode.store(mode_gauge_value(mode), Ordering::Relaxed);
    }

    #[inline]
    pub fn set_in_flight(&self, count: usize) {
        self.in_flight.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_run_progress(&self, count: u32) {
        self.run_progress.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_io_connected(&self, connected: bool) {
        self.io_connected.store(connected as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn sensor_events_total(&self) -> u64 {
        self.sensor_events_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn items_stalled(&self) -> u64 {
        self.items_stalled.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn alerts_dropped(&self) -> u64 {
        self.alerts_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn coil_writes_failed(&self) -> u64 {
        self.coil_writes_failed.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let events_count = self.sensor_events_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.event_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.event_latency_max_us.swap(0, Ordering::Relaxed);
        let event_lat_buckets = swap_buckets(&self.event_latency_buckets);
        let poll_lat_buckets = swap_buckets(&self.poll_latency_buckets);
        let poll_lat_max = self.poll_latency_max_us.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if events_count > 0 { latency_sum / events_count } else { 0 };

        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

        MetricsSummary {
            sensor_events_total: load(&self.sensor_events_total),
            events_per_sec,
            event_lat_avg_us: avg_latency,
            event_lat_max_us: latency_max,
            event_lat_p99_us: percentile_from_buckets(&event_lat_buckets, 0.99),
            event_lat_buckets,
            polls_ok: load(&self.polls_ok),
            polls_failed: load(&self.polls_failed),
            poll_lat_p50_us: percentile_from_buckets(&poll_lat_buckets, 0.50),
            poll_lat_p99_us: percentile_from_buckets(&poll_lat_buckets, 0.99),
            poll_lat_max_us: poll_lat_max,
            coil_writes_ok: load(&self.coil_writes_ok),
            coil_writes_failed: load(&self.coil_writes_failed),
            items_entered: load(&self.items_entered),
            items_counted: load(&self.items_counted),
            items_stalled: load(&self.items_stalled),
            exits_without_item: load(&self.exits_without_item),
            size_mismatches: load(&self.size_mismatches),
            runs_started: load(&self.runs_started),
            runs_completed: load(&self.runs_completed),
            runs_failed: load(&self.runs_failed),
            runs_aborted: load(&self.runs_aborted),
            captures_ok: load(&self.captures_ok),
            captures_failed: load(&self.captures_failed),
            inspection_rejects: load(&self.inspection_rejects),
            alerts: std::array::from_fn(|i| load(&self.alerts[i])),
            alerts_dropped: load(&self.alerts_dropped),
            mode: load(&self.mode),
            in_flight: load(&self.in_flight),
            run_progress: load(&self.run_progress),
            io_connected: load(&self.io_connected) == 1,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub sensor_events_total: u64,
    pub events_per_sec: f64,
    pub event_lat_avg_us: u64,
    pub event_lat_max_us: u64,
    pub event_lat_p99_us: u64,
    /// Detection → handling latency buckets (same bounds as BUCKET_BOUNDS)
    pub event_lat_buckets: [u64; NUM_BUCKETS],
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub poll_lat_p50_us: u64,
    pub poll_lat_p99_us: u64,
    pub poll_lat_max_us: u64,
    pub coil_writes_ok: u64,
    pub coil_writes_failed: u64,
    pub items_entered: u64,
    pub items_counted: u64,
    pub items_stalled: u64,
    pub exits_without_item: u64,
    pub size_mismatches: u64,
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_aborted: u64,
    pub captures_ok: u64,
    pub captures_failed: u64,
    pub inspection_rejects: u64,
    /// Indexed by `AlertLevel as usize`
    pub alerts: [u64; 4],
    pub alerts_dropped: u64,
    /// See `mode_gauge_value`
    pub mode: u64,
    pub in_flight: u64,
    pub run_progress: u64,
    pub io_connected: bool,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            sensor_events = %self.sensor_events_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            event_p99_us = %self.event_lat_p99_us,
            polls_ok = %self.polls_ok,
            polls_failed = %self.polls_failed,
            poll_p99_us = %self.poll_lat_p99_us,
            coil_writes_failed = %self.coil_writes_failed,
            items_counted = %self.items_counted,
            items_stalled = %self.items_stalled,
            in_flight = %self.in_flight,
            runs_completed = %self.runs_completed,
            runs_failed = %self.runs_failed,
            alerts_dropped = %self.alerts_dropped,
            io_connected = %self.io_connected,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.sensor_events_total(), 0);
        assert_eq!(metrics.alerts_dropped(), 0);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_sensor_event(100);
        metrics.record_sensor_event(200);
        metrics.record_sensor_event(300);
        metrics.record_item_counted();
        metrics.record_alert(AlertLevel::Critical);
        metrics.set_mode(OperatingMode::Running);
        metrics.set_in_flight(2);

        let summary = metrics.report();

        assert_eq!(summary.sensor_events_total, 3);
        assert_eq!(summary.event_lat_avg_us, 200);
        assert_eq!(summary.event_lat_max_us, 300);
        assert_eq!(summary.items_counted, 1);
        assert_eq!(summary.alerts, [0, 0, 0, 1]);
        assert_eq!(summary.mode, 2);
        assert_eq!(summary.in_flight, 2);

        // Periodic counters reset, monotonic ones survive
        assert_eq!(metrics.sensor_events_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.event_latency_max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.report().sensor_events_total, 3);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report();
        assert_eq!(summary.event_lat_avg_us, 0);
        assert_eq!(summary.poll_lat_p99_us, 0);
        assert!(!summary.io_connected);
    }

    #[test]
    fn test_poll_failures_do_not_touch_latency() {
        let metrics = Metrics::new();
        metrics.record_poll(false, 99_999);
        metrics.record_poll(true, 150);
        let summary = metrics.report();
        assert_eq!(summary.polls_failed, 1);
        assert_eq!(summary.polls_ok, 1);
        assert_eq!(summary.poll_lat_max_us, 150);
        assert_eq!(summary.poll_lat_p99_us, 200);
    }

    #[test]
    fn test_percentile_with_few_samples() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[1] = 1;
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 200);
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 200);

        buckets[0] = 1;
        buckets[3] = 1;
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 200);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 800);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_sensor_event(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.sensor_events_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_mode_gauge_values_are_distinct() {
        let modes = [
            OperatingMode::Stopped,
            OperatingMode::Idle,
            OperatingMode::Running,
            OperatingMode::PostRunDelay,
            OperatingMode::PausedBetweenBatches,
        ];
        let values: std::collections::HashSet<u64> =
            modes.iter().map(|m| mode_gauge_value(*m)).collect();
        assert_eq!(values.len(), modes.len());
    }
}
