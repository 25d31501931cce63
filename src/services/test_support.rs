//! In-memory fakes shared by the service tests

use crate::domain::{CameraSettings, Verdict};
use crate::error::{CollaboratorError, HardwareError};
use crate::io::audio::Announcer;
use crate::io::camera::{Camera, CapturedImage};
use crate::io::inspector::Inspector;
use crate::io::modbus::DiscreteBus;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;

/// Discrete bus backed by two vectors. Inputs hold raw levels, so `true`
/// means an idle NPN sensor.
pub struct FakeBus {
    inputs: Mutex<Vec<bool>>,
    coils: Mutex<Vec<bool>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<(u16, bool, Instant)>>,
}

impl FakeBus {
    pub fn new(input_count: usize, coil_count: usize) -> Self {
        Self {
            inputs: Mutex::new(vec![true; input_count]),
            coils: Mutex::new(vec![false; coil_count]),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Put an object in front of a 1-based channel
    pub fn block(&self, channel: u8) {
        self.inputs.lock()[channel as usize - 1] = false;
    }

    pub fn unblock(&self, channel: u8) {
        self.inputs.lock()[channel as usize - 1] = true;
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.coils.lock().get(address as usize).copied()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Successful writes to one coil, oldest first
    pub fn writes_to(&self, address: u16) -> Vec<(bool, Instant)> {
        self.writes
            .lock()
            .iter()
            .filter(|(addr, _, _)| *addr == address)
            .map(|(_, value, at)| (*value, *at))
            .collect()
    }
}

#[async_trait]
impl DiscreteBus for FakeBus {
    async fn read_inputs(&self) -> Result<Vec<bool>, HardwareError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(HardwareError::Timeout { slave: 1, function: 0x02 });
        }
        Ok(self.inputs.lock().clone())
    }

    async fn read_coils(&self) -> Result<Vec<bool>, HardwareError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(HardwareError::Timeout { slave: 2, function: 0x01 });
        }
        Ok(self.coils.lock().clone())
    }

    async fn write_coil(&self, address: u16, on: bool) -> Result<(), HardwareError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(HardwareError::Timeout { slave: 2, function: 0x05 });
        }
        let mut coils = self.coils.lock();
        let Some(slot) = coils.get_mut(address as usize) else {
            return Err(HardwareError::Exception { slave: 2, code: 0x02 });
        };
        *slot = on;
        self.writes.lock().push((address, on, Instant::now()));
        Ok(())
    }
}

/// Camera returning a fixed image; records applied settings
#[derive(Default)]
pub struct FakeCamera {
    pub applied: Mutex<Vec<CameraSettings>>,
    pub captures: Mutex<Vec<String>>,
}

#[async_trait]
impl Camera for FakeCamera {
    async fn capture(&self, camera_id: &str, tag: &str) -> Result<CapturedImage, CollaboratorError> {
        self.captures.lock().push(tag.to_string());
        Ok(CapturedImage {
            path: PathBuf::from(format!("captures/{camera_id}_{tag}.jpg")),
            bytes: Bytes::from_static(b"\xFF\xD8\xFF\xD9"),
        })
    }

    async fn apply_settings(&self, settings: &CameraSettings) -> Result<(), CollaboratorError> {
        self.applied.lock().push(settings.clone());
        Ok(())
    }
}

/// Inspector answering with one fixed verdict
pub struct FixedInspector(pub Verdict);

#[async_trait]
impl Inspector for FixedInspector {
    async fn inspect(&self, _image: &CapturedImage) -> Result<Verdict, CollaboratorError> {
        Ok(self.0.clone())
    }
}

/// Announcer recording what it was asked to play
#[derive(Default)]
pub struct RecordingAnnouncer {
    pub events: Mutex<Vec<String>>,
    pub narrations: Mutex<Vec<String>>,
}

#[async_trait]
impl Announcer for RecordingAnnouncer {
    async fn play_event(&self, name: &str) -> Result<(), CollaboratorError> {
        self.events.lock().push(name.to_string());
        Ok(())
    }

    async fn narrate(&self, text: &str) -> Result<(), CollaboratorError> {
        self.narrations.lock().push(text.to_string());
        Ok(())
    }
}
