//! Error handling for the camera controller.

use std::time::Duration;

use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum CameraError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown or detached device
    #[error("Device error: {0}")]
    Device(String),

    /// Hardware control read/write errors
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Generic application errors
    #[error("Application error: {0}")]
    App(String),
}

/// Application result type
pub type CameraResult<T> = std::result::Result<T, CameraError>;

/// Why a controller load attempt ended without a usable session.
///
/// The `Display` text is what ends up in [`crate::device::ControllerState::Failed`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The platform driver faulted or panicked while opening the session.
    #[error("native fault: {0}")]
    NativeFault(String),

    /// The init branch lost the race against the advisory timeout.
    #[error("camera initialization timed out after {}ms", .0.as_millis())]
    InitTimeout(Duration),

    /// The hard ceiling expired while still loading.
    #[error("camera initialization timed out (> {}ms), watchdog gave up", .0.as_millis())]
    WatchdogTimeout(Duration),

    /// A session opened but exposes no usable controls.
    #[error("unable to initialize camera controls.")]
    UnsupportedDevice,
}
