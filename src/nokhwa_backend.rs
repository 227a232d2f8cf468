//! Capture backend for real cameras, built on nokhwa.
//!
//! A nokhwa `Camera` has to stay on the thread that created it, so every
//! opened session gets a dedicated worker thread that owns the camera and
//! serves control reads and writes over a channel. Dropping the session closes
//! the channel, which ends the thread and releases the device.

use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{
        ApiBackend, CameraIndex, CameraInfo as NokhwaCameraInfo, ControlValueDescription,
        ControlValueSetter, KnownCameraControl, RequestedFormat, RequestedFormatType,
    },
};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::backend::{CaptureBackend, DiscoveredDevice};
use crate::controls::{ControlKind, ControlRange, ControlSession};
use crate::device::{DeviceIdentity, NativeRef, hardware_id};
use crate::{CameraError, CameraResult};

/// Platform camera access through nokhwa.
#[derive(Debug, Clone, Copy)]
pub struct NokhwaBackend {
    api: ApiBackend,
}

impl Default for NokhwaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NokhwaBackend {
    pub fn new() -> Self {
        Self {
            api: Self::select_best_backend(),
        }
    }

    /// Select the best API backend for the current platform
    fn select_best_backend() -> ApiBackend {
        #[cfg(target_os = "linux")]
        return ApiBackend::Video4Linux;

        #[cfg(target_os = "windows")]
        return ApiBackend::MediaFoundation;

        #[cfg(target_os = "macos")]
        return ApiBackend::AVFoundation;

        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        return ApiBackend::Auto;
    }

    fn discovered(position: usize, camera_info: &NokhwaCameraInfo) -> DiscoveredDevice {
        let index = camera_info
            .index()
            .as_index()
            .unwrap_or(position as u32);
        let name = camera_info.human_name();
        let unique_id = hardware_id(&name, camera_info.description(), index);
        debug!(
            "Camera {index}: {name} ({}) -> {unique_id}",
            camera_info.description()
        );

        DiscoveredDevice::new(
            DeviceIdentity::new(name, unique_id),
            NativeRef::new(index.to_string()),
        )
    }
}

impl CaptureBackend for NokhwaBackend {
    fn enumerate(&self) -> CameraResult<Vec<DiscoveredDevice>> {
        let cameras = nokhwa::query(self.api).map_err(|e| {
            error!("Failed to query cameras: {e}");
            CameraError::Hardware(format!("Failed to query cameras: {e}"))
        })?;

        let devices: Vec<DiscoveredDevice> = cameras
            .iter()
            .enumerate()
            .map(|(position, info)| Self::discovered(position, info))
            .collect();

        debug!("Detected {} cameras with {:?}", devices.len(), self.api);
        Ok(devices)
    }

    fn open_session(
        &self,
        identity: &DeviceIdentity,
        native: &NativeRef,
    ) -> Result<Box<dyn ControlSession>, String> {
        let index: u32 = native
            .locator()
            .parse()
            .map_err(|_| format!("invalid camera index '{}'", native.locator()))?;

        let (request_sender, request_receiver) = mpsc::channel();
        let (ready_sender, ready_receiver) = mpsc::channel();
        let name = identity.to_string();

        thread::Builder::new()
            .name(format!("camera-{index}"))
            .spawn(move || camera_worker(index, name, ready_sender, request_receiver))
            .map_err(|e| format!("failed to start camera thread: {e}"))?;

        let controls = ready_receiver
            .recv()
            .map_err(|_| "camera thread exited during initialization".to_string())??;

        info!("Opened {identity} with {} controls", controls.len());
        Ok(Box::new(NokhwaSession {
            controls,
            requests: request_sender,
        }))
    }
}

enum SessionRequest {
    Read {
        kind: ControlKind,
        respond_to: mpsc::Sender<CameraResult<i64>>,
    },
    Write {
        kind: ControlKind,
        value: i64,
        respond_to: mpsc::Sender<CameraResult<()>>,
    },
}

fn known_control(kind: ControlKind) -> KnownCameraControl {
    match kind {
        ControlKind::ExposureTime => KnownCameraControl::Exposure,
        ControlKind::WhiteBalance => KnownCameraControl::WhiteBalance,
        ControlKind::FocusAbsolute => KnownCameraControl::Focus,
        ControlKind::Gain => KnownCameraControl::Gain,
    }
}

fn control_kind(known: KnownCameraControl) -> Option<ControlKind> {
    match known {
        KnownCameraControl::Exposure => Some(ControlKind::ExposureTime),
        KnownCameraControl::WhiteBalance => Some(ControlKind::WhiteBalance),
        KnownCameraControl::Focus => Some(ControlKind::FocusAbsolute),
        KnownCameraControl::Gain => Some(ControlKind::Gain),
        _ => None,
    }
}

fn integer_value(description: &ControlValueDescription) -> Option<i64> {
    match description {
        ControlValueDescription::IntegerRange { value, .. }
        | ControlValueDescription::Integer { value, .. } => Some(*value),
        _ => None,
    }
}

fn integer_range(description: &ControlValueDescription) -> Option<ControlRange> {
    match description {
        ControlValueDescription::IntegerRange {
            min,
            max,
            step,
            default,
            ..
        } => Some(ControlRange {
            min: *min,
            max: *max,
            step: *step,
            default: *default,
        }),
        _ => None,
    }
}

fn supported_controls(camera: &Camera) -> Result<Vec<(ControlKind, ControlRange)>, String> {
    let controls = camera
        .camera_controls()
        .map_err(|e| format!("failed to query controls: {e}"))?;

    Ok(controls
        .iter()
        .filter_map(|control| {
            let kind = control_kind(control.control())?;
            let range = integer_range(&control.value())?;
            Some((kind, range))
        })
        .collect())
}

fn camera_worker(
    index: u32,
    name: String,
    ready: mpsc::Sender<Result<Vec<(ControlKind, ControlRange)>, String>>,
    requests: mpsc::Receiver<SessionRequest>,
) {
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
    let mut camera = match Camera::new(CameraIndex::Index(index), format) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(format!("failed to open camera: {e}")));
            return;
        }
    };

    let controls = supported_controls(&camera);
    let opened = controls.is_ok();
    if ready.send(controls).is_err() || !opened {
        // Caller gave up waiting, or there is nothing to serve
        return;
    }

    debug!("Camera worker for {name} running");
    while let Ok(request) = requests.recv() {
        match request {
            SessionRequest::Read { kind, respond_to } => {
                let result = camera
                    .camera_control(known_control(kind))
                    .map_err(|e| CameraError::Hardware(format!("Failed to read {kind}: {e}")))
                    .and_then(|control| {
                        integer_value(&control.value()).ok_or_else(|| {
                            CameraError::Hardware(format!("{kind} is not an integer control"))
                        })
                    });
                let _ = respond_to.send(result);
            }
            SessionRequest::Write {
                kind,
                value,
                respond_to,
            } => {
                let result = camera
                    .set_camera_control(known_control(kind), ControlValueSetter::Integer(value))
                    .map_err(|e| CameraError::Hardware(format!("Failed to write {kind}: {e}")));
                let _ = respond_to.send(result);
            }
        }
    }

    debug!("Camera worker for {name} exiting");
}

/// Control session served by a camera worker thread.
pub struct NokhwaSession {
    controls: Vec<(ControlKind, ControlRange)>,
    requests: mpsc::Sender<SessionRequest>,
}

impl NokhwaSession {
    fn worker_gone() -> CameraError {
        warn!("Camera worker thread is gone");
        CameraError::Hardware("Camera worker thread is gone".to_string())
    }
}

impl ControlSession for NokhwaSession {
    fn supported_controls(&self) -> Vec<(ControlKind, ControlRange)> {
        self.controls.clone()
    }

    fn read_control(&mut self, kind: ControlKind) -> CameraResult<i64> {
        let (respond_to, response) = mpsc::channel();
        self.requests
            .send(SessionRequest::Read { kind, respond_to })
            .map_err(|_| Self::worker_gone())?;
        response.recv().map_err(|_| Self::worker_gone())?
    }

    fn write_control(&mut self, kind: ControlKind, value: i64) -> CameraResult<()> {
        let (respond_to, response) = mpsc::channel();
        self.requests
            .send(SessionRequest::Write {
                kind,
                value,
                respond_to,
            })
            .map_err(|_| Self::worker_gone())?;
        response.recv().map_err(|_| Self::worker_gone())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_mapping_round_trips() {
        for kind in [
            ControlKind::ExposureTime,
            ControlKind::WhiteBalance,
            ControlKind::FocusAbsolute,
            ControlKind::Gain,
        ] {
            assert_eq!(control_kind(known_control(kind)), Some(kind));
        }
        assert_eq!(control_kind(KnownCameraControl::Brightness), None);
    }

    #[test]
    fn test_integer_range_extraction() {
        let description = ControlValueDescription::IntegerRange {
            min: 3,
            max: 2047,
            value: 250,
            step: 1,
            default: 166,
        };
        assert_eq!(integer_value(&description), Some(250));
        assert_eq!(
            integer_range(&description),
            Some(ControlRange {
                min: 3,
                max: 2047,
                step: 1,
                default: 166,
            })
        );
    }
}
