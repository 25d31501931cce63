//! Sensor poller - turns periodic input reads into edge events
//!
//! Each tick reads every discrete input, corrects NPN polarity and emits one
//! event per monitored channel whose state changed. Connectivity is reported
//! on edges only. While the bus is unreachable every sensor is assumed clear.

use crate::domain::{IoHealth, SensorEvent, SensorId, SensorState};
use crate::infra::metrics::Metrics;
use crate::io::modbus::DiscreteBus;
use crate::services::outputs::OutputGateway;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// What the poller hands to the dispatcher, in order
#[derive(Debug, Clone)]
pub enum PollerEvent {
    Sensor(SensorEvent),
    Health(IoHealth),
}

/// Last coil read-back, shared for status reporting
pub type CoilSnapshot = Arc<RwLock<Option<Vec<bool>>>>;

pub struct SensorPoller {
    bus: Arc<dyn DiscreteBus>,
    /// Monitored 1-based channels (entry, exit)
    channels: SmallVec<[SensorId; 2]>,
    poll_interval: Duration,
    /// Corrected state per channel, `true` = triggered
    last_states: FxHashMap<u8, bool>,
    health: Option<IoHealth>,
    event_tx: mpsc::Sender<PollerEvent>,
    gateway: Option<Arc<OutputGateway>>,
    coils: CoilSnapshot,
    metrics: Arc<Metrics>,
}

impl SensorPoller {
    pub fn new(
        bus: Arc<dyn DiscreteBus>,
        channels: &[SensorId],
        poll_interval: Duration,
        event_tx: mpsc::Sender<PollerEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            bus,
            channels: channels.iter().copied().collect(),
            poll_interval,
            last_states: channels.iter().map(|c| (c.0, false)).collect(),
            health: None,
            event_tx,
            gateway: None,
            coils: Arc::new(RwLock::new(None)),
            metrics,
        }
    }

    /// Also read back the output coils every tick
    pub fn with_coil_readback(mut self, gateway: Arc<OutputGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn coil_snapshot(&self) -> CoilSnapshot {
        self.coils.clone()
    }

    /// Read the inputs once. `None` on I/O error.
    pub async fn poll_once(&self) -> Option<FxHashMap<u8, bool>> {
        let started = Instant::now();
        match self.bus.read_inputs().await {
            Ok(raw) => {
                self.metrics.record_poll(true, started.elapsed().as_micros() as u64);
                let states = self
                    .channels
                    .iter()
                    .map(|c| {
                        // Missing channels read as idle level
                        let level = raw.get(c.0 as usize - 1).copied().unwrap_or(true);
                        (c.0, SensorState::from_raw_npn(level) == SensorState::Triggered)
                    })
                    .collect();
                trace!(raw = ?raw, poll_us = %started.elapsed().as_micros(), "inputs_polled");
                Some(states)
            }
            Err(e) => {
                self.metrics.record_poll(false, 0);
                debug!(error = %e, "inputs_poll_failed");
                None
            }
        }
    }

    async fn set_health(&mut self, health: IoHealth) -> bool {
        if self.health == Some(health) {
            return true;
        }
        match health {
            IoHealth::Connected => info!("io_connected"),
            IoHealth::Disconnected => warn!("io_disconnected"),
        }
        self.health = Some(health);
        self.metrics.set_io_connected(health == IoHealth::Connected);
        self.emit(PollerEvent::Health(health)).await
    }

    async fn emit(&self, event: PollerEvent) -> bool {
        self.event_tx.send(event).await.is_ok()
    }

    /// One poll cycle. Returns false once the dispatcher is gone.
    pub async fn tick(&mut self) -> bool {
        let Some(states) = self.poll_once().await else {
            if !self.set_health(IoHealth::Disconnected).await {
                return false;
            }
            // Assume every triggered sensor cleared
            for channel in self.channels.clone() {
                if self.last_states.insert(channel.0, false) == Some(true) {
                    info!(sensor = %channel, "sensor_cleared_assumed");
                    let event = SensorEvent::new(channel, SensorState::Cleared);
                    if !self.emit(PollerEvent::Sensor(event)).await {
                        return false;
                    }
                }
            }
            return true;
        };

        if !self.set_health(IoHealth::Connected).await {
            return false;
        }

        for channel in self.channels.clone() {
            let triggered = states.get(&channel.0).copied().unwrap_or(false);
            if self.last_states.insert(channel.0, triggered) == Some(triggered) {
                continue;
            }
            let state = if triggered { SensorState::Triggered } else { SensorState::Cleared };
            debug!(sensor = %channel, state = %state.as_str(), "sensor_edge");
            if !self.emit(PollerEvent::Sensor(SensorEvent::new(channel, state))).await {
                return false;
            }
        }

        if let Some(gateway) = &self.gateway {
            match gateway.read_all_coils().await {
                Ok(coils) => *self.coils.write() = Some(coils),
                Err(e) => debug!(error = %e, "coil_readback_failed"),
            }
        }
        true
    }

    /// Start the polling loop
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            channels = ?self.channels.iter().map(|c| c.0).collect::<Vec<_>>(),
            poll_interval_ms = %self.poll_interval.as_millis(),
            "sensor_poller_started"
        );

        let mut poll_timer = interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = poll_timer.tick() => {}
            }

            if !self.tick().await {
                warn!("sensor_dispatcher_gone");
                break;
            }
        }

        self.bus.close().await;
        info!("sensor_poller_stopped");
    }
}
