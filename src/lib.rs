#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod config;
pub mod controls;
pub mod device;
pub mod device_monitor;
pub mod error;
pub mod loader;
#[cfg(feature = "native")]
pub mod nokhwa_backend;
pub mod observable;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod simulated;

pub use error::{CameraError, CameraResult, LoadError};
