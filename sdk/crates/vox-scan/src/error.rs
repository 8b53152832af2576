//! Error types for the scanning component.

/// Errors reported to the host.
///
/// Only starting a session can fail from the host's point of view. Everything
/// that goes wrong after the camera is open is absorbed and logged.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The camera driver returned no handle for the requested camera.
    #[error("camera {camera_id} failed to open: driver returned no handle")]
    CameraOpen { camera_id: i32 },

    /// A configuration value is out of range.
    #[error("invalid scan configuration: {0}")]
    InvalidConfig(String),

    /// The background decode runtime could not be created.
    #[error("failed to start decode runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Failures reported by a camera driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("camera rejected parameters: {0}")]
    ParametersRejected(String),

    #[error("camera driver failure: {0}")]
    Failure(String),
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
