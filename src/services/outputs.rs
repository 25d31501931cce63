//! Hardware output gateway - the single writer of discrete output coils
//!
//! Maps symbolic output names to coil addresses, tracks write health and
//! remembers the last value commanded per coil. Indicator blinks go through
//! `overlay_output`, which toggles around the commanded value without
//! changing it, so an LED always settles on what its owner last asked for.

use crate::error::HardwareError;
use crate::infra::config::OutputsConfig;
use crate::infra::metrics::Metrics;
use crate::io::modbus::DiscreteBus;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const CONVEYOR: &str = "conveyor";
pub const GATE: &str = "gate";
pub const DIVERTER: &str = "diverter";
pub const LED_GREEN: &str = "led_green";
pub const LED_RED: &str = "led_red";
pub const BUZZER: &str = "buzzer";
pub const CAMERA_LIGHT: &str = "camera_light";

/// Outputs driven to reach the safe state, in order
pub const SAFE_STATE: [(&str, bool); 5] =
    [(GATE, false), (DIVERTER, false), (CONVEYOR, false), (LED_GREEN, false), (LED_RED, true)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayHealth {
    Healthy,
    Unhealthy,
}

/// Failed writes from `apply_safe_state`, by output name
pub type SafeStateFailures = SmallVec<[(&'static str, HardwareError); 4]>;

pub struct OutputGateway {
    bus: Arc<dyn DiscreteBus>,
    addresses: FxHashMap<String, u16>,
    unhealthy_after: u32,
    consecutive_failures: AtomicU32,
    last_commanded: Mutex<FxHashMap<u16, bool>>,
    /// Serializes commanded and overlay writes
    write_lock: tokio::sync::Mutex<()>,
    metrics: Arc<Metrics>,
}

impl OutputGateway {
    pub fn new(
        bus: Arc<dyn DiscreteBus>,
        outputs: &OutputsConfig,
        unhealthy_after: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        let addresses =
            outputs.entries().iter().map(|(name, addr)| (name.to_string(), *addr)).collect();
        Self {
            bus,
            addresses,
            unhealthy_after: unhealthy_after.max(1),
            consecutive_failures: AtomicU32::new(0),
            last_commanded: Mutex::new(FxHashMap::default()),
            write_lock: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    /// Resolve an output name (case-insensitive) to its coil address
    pub fn address_of(&self, name: &str) -> Option<u16> {
        self.addresses.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn health(&self) -> GatewayHealth {
        if self.consecutive_failures.load(Ordering::Relaxed) >= self.unhealthy_after {
            GatewayHealth::Unhealthy
        } else {
            GatewayHealth::Healthy
        }
    }

    /// Last value written to the named output, if any
    pub fn last_commanded(&self, name: &str) -> Option<bool> {
        let address = self.address_of(name)?;
        self.last_commanded.lock().get(&address).copied()
    }

    fn record_outcome<T>(&self, result: &Result<T, HardwareError>) {
        match result {
            Ok(_) => {
                let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if previous >= self.unhealthy_after {
                    info!(after_failures = %previous, "output_gateway_recovered");
                }
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == self.unhealthy_after {
                    error!(failures = %failures, error = %e, "output_gateway_unhealthy");
                }
            }
        }
    }

    pub async fn read_all_coils(&self) -> Result<Vec<bool>, HardwareError> {
        let result = self.bus.read_coils().await;
        self.record_outcome(&result);
        result
    }

    fn resolve(&self, name: &str) -> Result<u16, HardwareError> {
        self.address_of(name).ok_or_else(|| HardwareError::UnknownOutput(name.to_string()))
    }

    /// Single write, no retries
    pub async fn write_coil(&self, address: u16, value: bool) -> Result<(), HardwareError> {
        let _guard = self.write_lock.lock().await;
        let result = self.bus_write(address, value).await;
        if result.is_ok() {
            self.last_commanded.lock().insert(address, value);
        }
        result
    }

    pub async fn write_output(&self, name: &str, value: bool) -> Result<(), HardwareError> {
        self.write_coil(self.resolve(name)?, value).await
    }

    /// Drive an output to the inverse of its commanded value (`inverted`) or
    /// back to it. The commanded value is read under the write lock and left
    /// untouched.
    pub async fn overlay_output(&self, name: &str, inverted: bool) -> Result<(), HardwareError> {
        let address = self.resolve(name)?;
        let _guard = self.write_lock.lock().await;
        let commanded = self.last_commanded.lock().get(&address).copied().unwrap_or(false);
        self.bus_write(address, commanded ^ inverted).await
    }

    async fn bus_write(&self, address: u16, value: bool) -> Result<(), HardwareError> {
        let result = self.bus.write_coil(address, value).await;
        self.record_outcome(&result);
        self.metrics.record_coil_write(result.is_ok());
        match &result {
            Ok(()) => debug!(address = %address, value = %value, "coil_written"),
            Err(e) => warn!(address = %address, value = %value, error = %e, "coil_write_failed"),
        }
        result
    }

    /// Gate, diverter, conveyor and green LED off, red LED on.
    /// Every write is attempted; failures are collected, never retried.
    pub async fn apply_safe_state(&self) -> SafeStateFailures {
        let mut failures = SafeStateFailures::new();
        for (name, value) in SAFE_STATE {
            if let Err(e) = self.write_output(name, value).await {
                failures.push((name, e));
            }
        }
        if failures.is_empty() {
            info!("safe_state_applied");
        } else {
            error!(failed = %failures.len(), "safe_state_incomplete");
        }
        failures
    }
}
