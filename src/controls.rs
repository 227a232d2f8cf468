//! Hardware control facade over an opened control session.
//!
//! A [`ControlSession`] is whatever the platform hands back once a device has
//! been opened for control access. [`DeviceController`] wraps it, keeps the
//! last read value of each supported control, and stages pending writes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::{CameraError, CameraResult};

/// The hardware controls this crate knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    ExposureTime,
    WhiteBalance,
    FocusAbsolute,
    Gain,
}

/// Controls refreshed by [`DeviceController::refresh`].
pub const REFRESHED_CONTROLS: [ControlKind; 3] = [
    ControlKind::ExposureTime,
    ControlKind::WhiteBalance,
    ControlKind::FocusAbsolute,
];

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlKind::ExposureTime => "exposure",
            ControlKind::WhiteBalance => "white_balance",
            ControlKind::FocusAbsolute => "focus",
            ControlKind::Gain => "gain",
        };
        f.write_str(name)
    }
}

impl FromStr for ControlKind {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "exposure" | "exposure_time" => Ok(ControlKind::ExposureTime),
            "white_balance" | "wb" => Ok(ControlKind::WhiteBalance),
            "focus" | "focus_absolute" => Ok(ControlKind::FocusAbsolute),
            "gain" => Ok(ControlKind::Gain),
            other => Err(CameraError::Hardware(format!("Unknown control: {other}"))),
        }
    }
}

/// Range reported by the hardware for a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRange {
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub default: i64,
}

impl ControlRange {
    /// Clamp into `[min, max]` and snap down onto the step grid.
    ///
    /// Hardware may report any `i64` bounds, including an inverted or full-width
    /// range, so the grid offset is computed in `i128`.
    pub fn clamp(&self, value: i64) -> i64 {
        let (low, high) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        let clamped = value.clamp(low, high);
        if self.step > 1 {
            let step = i128::from(self.step);
            let offset = (i128::from(clamped) - i128::from(low)) / step * step;
            // low <= low + offset <= clamped, so this always fits
            i64::try_from(i128::from(low) + offset).unwrap_or(clamped)
        } else {
            clamped
        }
    }
}

/// Platform control session for one device.
///
/// Calls may block on the device; callers run them off the async executor.
pub trait ControlSession: Send + 'static {
    /// Controls the device exposes, with their ranges.
    fn supported_controls(&self) -> Vec<(ControlKind, ControlRange)>;

    fn read_control(&mut self, kind: ControlKind) -> CameraResult<i64>;

    fn write_control(&mut self, kind: ControlKind, value: i64) -> CameraResult<()>;
}

/// One supported control with its last known and staged values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub kind: ControlKind,
    pub range: ControlRange,
    pub current: i64,
    pub pending: Option<i64>,
}

/// Capability set built from an opened session.
pub struct DeviceController {
    session: Box<dyn ControlSession>,
    controls: BTreeMap<ControlKind, Control>,
}

/// Controller shared between the registry and background read/write tasks.
pub type SharedController = Arc<Mutex<DeviceController>>;

/// Lock a shared controller, recovering from a poisoned lock.
pub fn lock_controller(controller: &SharedController) -> MutexGuard<'_, DeviceController> {
    controller.lock().unwrap_or_else(|e| {
        error!("Device controller mutex poisoned: {e}");
        e.into_inner()
    })
}

impl fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceController")
            .field("controls", &self.controls)
            .finish_non_exhaustive()
    }
}

impl DeviceController {
    /// Build the facade, or `None` when the session has nothing usable.
    pub fn from_session(mut session: Box<dyn ControlSession>) -> Option<Self> {
        let mut controls = BTreeMap::new();
        for (kind, range) in session.supported_controls() {
            if range.min > range.max {
                debug!("Ignoring {kind} with inverted range {range:?}");
                continue;
            }
            let current = session.read_control(kind).unwrap_or(range.default);
            controls.insert(
                kind,
                Control {
                    kind,
                    range,
                    current,
                    pending: None,
                },
            );
        }

        if controls.is_empty() {
            return None;
        }

        Some(Self { session, controls })
    }

    pub fn control(&self, kind: ControlKind) -> Option<&Control> {
        self.controls.get(&kind)
    }

    pub fn controls(&self) -> impl Iterator<Item = &Control> {
        self.controls.values()
    }

    pub fn supports(&self, kind: ControlKind) -> bool {
        self.controls.contains_key(&kind)
    }

    /// Re-read a single control from hardware.
    pub fn update(&mut self, kind: ControlKind) -> CameraResult<i64> {
        let Some(control) = self.controls.get_mut(&kind) else {
            return Err(CameraError::Hardware(format!("{kind} is not supported")));
        };
        let value = self.session.read_control(kind)?;
        control.current = value;
        Ok(value)
    }

    /// Re-read exposure, white balance and focus, skipping unsupported ones.
    ///
    /// Stops at the first hardware error.
    pub fn refresh(&mut self) -> CameraResult<()> {
        for kind in REFRESHED_CONTROLS {
            if self.supports(kind) {
                self.update(kind)?;
            }
        }
        Ok(())
    }

    /// Stage a value for the next [`write_values`](Self::write_values).
    ///
    /// Returns the value actually staged after clamping.
    pub fn set_pending(&mut self, kind: ControlKind, value: i64) -> CameraResult<i64> {
        let Some(control) = self.controls.get_mut(&kind) else {
            return Err(CameraError::Hardware(format!("{kind} is not supported")));
        };
        let staged = control.range.clamp(value);
        control.pending = Some(staged);
        Ok(staged)
    }

    /// Push every staged value to hardware.
    ///
    /// Values that fail to write stay staged. Returns how many were written.
    pub fn write_values(&mut self) -> CameraResult<usize> {
        let mut written = 0;
        let mut first_error = None;

        for control in self.controls.values_mut() {
            let Some(value) = control.pending else {
                continue;
            };
            match self.session.write_control(control.kind, value) {
                Ok(()) => {
                    control.current = value;
                    control.pending = None;
                    written += 1;
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeSession {
        ranges: Vec<(ControlKind, ControlRange)>,
        values: HashMap<ControlKind, i64>,
        fail_writes: bool,
    }

    impl ControlSession for FakeSession {
        fn supported_controls(&self) -> Vec<(ControlKind, ControlRange)> {
            self.ranges.clone()
        }

        fn read_control(&mut self, kind: ControlKind) -> CameraResult<i64> {
            self.values
                .get(&kind)
                .copied()
                .ok_or_else(|| CameraError::Hardware(format!("no value for {kind}")))
        }

        fn write_control(&mut self, kind: ControlKind, value: i64) -> CameraResult<()> {
            if self.fail_writes {
                return Err(CameraError::Hardware("stalled".to_string()));
            }
            self.values.insert(kind, value);
            Ok(())
        }
    }

    const RANGE: ControlRange = ControlRange {
        min: 0,
        max: 100,
        step: 5,
        default: 50,
    };

    fn session(fail_writes: bool) -> Box<dyn ControlSession> {
        Box::new(FakeSession {
            ranges: vec![(ControlKind::ExposureTime, RANGE), (ControlKind::Gain, RANGE)],
            values: HashMap::from([(ControlKind::ExposureTime, 20)]),
            fail_writes,
        })
    }

    #[test]
    fn test_control_kind_parsing() {
        assert_eq!(
            "Exposure"
                .parse::<ControlKind>()
                .expect("Test operation should succeed"),
            ControlKind::ExposureTime
        );
        assert_eq!(
            "white-balance"
                .parse::<ControlKind>()
                .expect("Test operation should succeed"),
            ControlKind::WhiteBalance
        );
        assert!("zoom".parse::<ControlKind>().is_err());
        assert_eq!(ControlKind::FocusAbsolute.to_string(), "focus");
    }

    #[test]
    fn test_range_clamp_full_width() {
        let wide = ControlRange {
            min: i64::MIN,
            max: i64::MAX,
            step: 2,
            default: 0,
        };
        assert_eq!(wide.clamp(i64::MAX), i64::MAX - 1);
        assert_eq!(wide.clamp(i64::MIN), i64::MIN);
        assert_eq!(wide.clamp(1), 0);
        assert_eq!(wide.clamp(-1), -2);

        let inverted = ControlRange {
            min: 100,
            max: 0,
            step: 1,
            default: 50,
        };
        assert_eq!(inverted.clamp(150), 100);
        assert_eq!(inverted.clamp(-5), 0);
    }

    #[test]
    fn test_range_clamp() {
        assert_eq!(RANGE.clamp(-3), 0);
        assert_eq!(RANGE.clamp(101), 100);
        assert_eq!(RANGE.clamp(33), 30);
    }

    #[test]
    fn test_from_session_reads_initial_values() {
        let controller =
            DeviceController::from_session(session(false)).expect("Test operation should succeed");
        assert_eq!(
            controller
                .control(ControlKind::ExposureTime)
                .map(|c| c.current),
            Some(20)
        );
        // Unreadable controls fall back to the hardware default
        assert_eq!(controller.control(ControlKind::Gain).map(|c| c.current), Some(50));
        assert!(!controller.supports(ControlKind::FocusAbsolute));
    }

    #[test]
    fn test_from_session_without_controls() {
        let empty = Box::new(FakeSession {
            ranges: vec![],
            values: HashMap::new(),
            fail_writes: false,
        });
        assert!(DeviceController::from_session(empty).is_none());
    }

    #[test]
    fn test_write_values_clears_pending() {
        let mut controller =
            DeviceController::from_session(session(false)).expect("Test operation should succeed");
        assert_eq!(
            controller
                .set_pending(ControlKind::Gain, 77)
                .expect("Test operation should succeed"),
            75
        );
        assert_eq!(
            controller
                .write_values()
                .expect("Test operation should succeed"),
            1
        );
        let gain = controller
            .control(ControlKind::Gain)
            .expect("Test operation should succeed");
        assert_eq!(gain.current, 75);
        assert_eq!(gain.pending, None);
    }

    #[test]
    fn test_failed_write_keeps_pending() {
        let mut controller =
            DeviceController::from_session(session(true)).expect("Test operation should succeed");
        controller
            .set_pending(ControlKind::ExposureTime, 40)
            .expect("Test operation should succeed");
        assert!(controller.write_values().is_err());
        assert_eq!(
            controller
                .control(ControlKind::ExposureTime)
                .and_then(|c| c.pending),
            Some(40)
        );
    }

    #[test]
    fn test_set_pending_unsupported() {
        let mut controller =
            DeviceController::from_session(session(false)).expect("Test operation should succeed");
        assert!(controller.set_pending(ControlKind::FocusAbsolute, 1).is_err());
    }
}
