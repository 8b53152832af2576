//! Scan session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::decoder::DecodeFormats;
use crate::error::{Result, ScanError};
use crate::geometry::ScannerType;

/// Camera id meaning "no preference": the driver picks its default camera.
pub const NO_REQUESTED_CAMERA: i32 = -1;

/// Settings for one scan session.
///
/// Every field has a default, so hosts may pass a partial document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Shape of the scan area.
    pub scanner_type: ScannerType,
    /// Camera to open; negative means no preference.
    pub camera_id: i32,
    /// Formats the decoder looks for.
    pub formats: DecodeFormats,
    /// Number of decode workers.
    pub pool_capacity: usize,
    /// Extra in-flight decode tasks allowed beyond the pool capacity.
    pub in_flight_slack: usize,
    /// How often the pipeline considers requesting another frame.
    pub poll_interval_ms: u64,
    /// Period of the auto-focus cycle while previewing.
    pub autofocus_interval_ms: u64,
    /// Initial preview display orientation in degrees.
    pub display_orientation: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            scanner_type: ScannerType::Qr,
            camera_id: NO_REQUESTED_CAMERA,
            formats: DecodeFormats::all(),
            pool_capacity: 15,
            in_flight_slack: 5,
            poll_interval_ms: 300,
            autofocus_interval_ms: 5000,
            display_orientation: 0,
        }
    }
}

impl ScanConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn autofocus_interval(&self) -> Duration {
        Duration::from_millis(self.autofocus_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(ScanError::InvalidConfig(
                "pool_capacity must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ScanError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.autofocus_interval_ms == 0 {
            return Err(ScanError::InvalidConfig(
                "autofocus_interval_ms must be positive".into(),
            ));
        }
        if self.display_orientation % 90 != 0 || self.display_orientation >= 360 {
            return Err(ScanError::InvalidConfig(format!(
                "display_orientation must be 0, 90, 180 or 270, got {}",
                self.display_orientation
            )));
        }
        Ok(())
    }
}
