//! Production profiles, products and operators
//!
//! A profile links a product (what is being counted) with the camera
//! settings used while inspecting it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub autofocus: bool,
    #[serde(default)]
    pub exposure: i32,
    #[serde(default)]
    pub gain: f32,
    #[serde(default)]
    pub white_balance_temp: i32,
    #[serde(default)]
    pub brightness: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    /// Expected entry sensor block time window for one item
    #[serde(default)]
    pub min_sensor_block_time_ms: Option<u64>,
    #[serde(default)]
    pub max_sensor_block_time_ms: Option<u64>,
}

impl Product {
    /// Returns a human readable complaint when the block time is outside the
    /// product's window. Products without a complete window accept anything.
    pub fn check_block_time(&self, blocked: Duration) -> Option<String> {
        let (min, max) = (self.min_sensor_block_time_ms?, self.max_sensor_block_time_ms?);
        let blocked_ms = blocked.as_millis() as u64;
        if (min..=max).contains(&blocked_ms) {
            return None;
        }
        Some(format!(
            "Product size mismatch! Blocked for {blocked_ms}ms. Expected: {min}-{max}ms."
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: u32,
    pub name: String,
    pub product: Product,
    /// Linked camera profile; a profile without one cannot be started
    #[serde(default)]
    pub camera: Option<CameraSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub id: u32,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(min: Option<u64>, max: Option<u64>) -> Product {
        Product {
            name: "BL-CARRY-BAGS".to_string(),
            min_sensor_block_time_ms: min,
            max_sensor_block_time_ms: max,
        }
    }

    #[test]
    fn test_block_time_within_window() {
        let p = product(Some(100), Some(400));
        assert!(p.check_block_time(Duration::from_millis(100)).is_none());
        assert!(p.check_block_time(Duration::from_millis(400)).is_none());
    }

    #[test]
    fn test_block_time_outside_window() {
        let p = product(Some(100), Some(400));
        let msg = p.check_block_time(Duration::from_millis(950)).unwrap();
        assert!(msg.contains("950ms"));
        assert!(msg.contains("100-400ms"));
    }

    #[test]
    fn test_block_time_without_window() {
        assert!(product(None, Some(10)).check_block_time(Duration::from_secs(5)).is_none());
        assert!(product(None, None).check_block_time(Duration::ZERO).is_none());
    }
}
