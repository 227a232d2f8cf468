//! In-process capture backend with scripted per-device behavior.
//!
//! Drives the registry without hardware: the CLI's `--simulate` mode and the
//! test suite both use it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::backend::{CaptureBackend, DiscoveredDevice};
use crate::controls::{ControlKind, ControlRange, ControlSession};
use crate::device::{DeviceIdentity, NativeRef};
use crate::{CameraError, CameraResult};

/// Upper bound on how long a [`HangGate`] keeps a worker thread parked.
const MAX_HANG: Duration = Duration::from_secs(60);

/// Blocks simulated initialization until released.
#[derive(Debug, Clone, Default)]
pub struct HangGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl HangGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let (released, condvar) = &*self.inner;
        *released.lock().unwrap_or_else(|e| e.into_inner()) = true;
        condvar.notify_all();
    }

    fn wait(&self) {
        let (released, condvar) = &*self.inner;
        let deadline = Instant::now() + MAX_HANG;
        let mut guard = released.lock().unwrap_or_else(|e| e.into_inner());
        while !*guard {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            guard = match condvar.wait_timeout(guard, remaining) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

/// What happens when a simulated device is opened.
#[derive(Debug, Clone)]
pub enum SimBehavior {
    /// Open successfully after `delay`.
    Succeed { delay: Duration },
    /// Report a native fault.
    Fail(String),
    /// Panic inside the driver call.
    Panic(String),
    /// Block until the gate is released, then succeed.
    Hang(HangGate),
    /// Open a session that exposes no controls.
    Unsupported,
}

impl SimBehavior {
    pub fn instant() -> Self {
        SimBehavior::Succeed {
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct SimulatedDevice {
    identity: DeviceIdentity,
    native: NativeRef,
    behavior: SimBehavior,
}

/// Scriptable [`CaptureBackend`].
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    devices: Mutex<Vec<SimulatedDevice>>,
    next_native: AtomicUsize,
    open_attempts: AtomicUsize,
    io_failure: Arc<AtomicBool>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A couple of well-behaved cameras for demos.
    pub fn demo() -> Self {
        let backend = Self::new();
        backend.attach(
            "Simulated FaceTime HD Camera",
            "sim:0001",
            SimBehavior::Succeed {
                delay: Duration::from_millis(150),
            },
        );
        backend.attach("Simulated USB Webcam", "sim:0002", SimBehavior::instant());
        backend
    }

    pub fn with_device(self, name: &str, unique_id: &str, behavior: SimBehavior) -> Self {
        self.attach(name, unique_id, behavior);
        self
    }

    fn devices(&self) -> MutexGuard<'_, Vec<SimulatedDevice>> {
        self.devices.lock().unwrap_or_else(|e| {
            error!("Simulated device list mutex poisoned: {e}");
            e.into_inner()
        })
    }

    /// Plug in a device and return what the platform would announce.
    pub fn attach(&self, name: &str, unique_id: &str, behavior: SimBehavior) -> DiscoveredDevice {
        let index = self.next_native.fetch_add(1, Ordering::SeqCst);
        let device = SimulatedDevice {
            identity: DeviceIdentity::new(name, unique_id),
            native: NativeRef::new(format!("sim-native-{index}")),
            behavior,
        };
        let discovered = DiscoveredDevice::new(device.identity.clone(), device.native.clone());
        self.devices().push(device);
        discovered
    }

    /// Unplug a device, returning its native reference if it was present.
    pub fn detach(&self, unique_id: &str) -> Option<NativeRef> {
        let mut devices = self.devices();
        let index = devices
            .iter()
            .position(|d| d.identity.unique_id == unique_id)?;
        Some(devices.remove(index).native)
    }

    pub fn set_behavior(&self, unique_id: &str, behavior: SimBehavior) {
        if let Some(device) = self
            .devices()
            .iter_mut()
            .find(|d| d.identity.unique_id == unique_id)
        {
            device.behavior = behavior;
        }
    }

    /// Make every opened session fail its reads and writes.
    pub fn set_io_failure(&self, failing: bool) {
        self.io_failure.store(failing, Ordering::SeqCst);
    }

    /// How many times `open_session` has been called.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for SimulatedBackend {
    fn enumerate(&self) -> CameraResult<Vec<DiscoveredDevice>> {
        Ok(self
            .devices()
            .iter()
            .map(|d| DiscoveredDevice::new(d.identity.clone(), d.native.clone()))
            .collect())
    }

    fn open_session(
        &self,
        identity: &DeviceIdentity,
        native: &NativeRef,
    ) -> Result<Box<dyn ControlSession>, String> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);

        let behavior = self
            .devices()
            .iter()
            .find(|d| &d.native == native)
            .map(|d| d.behavior.clone())
            .ok_or_else(|| format!("{} is no longer attached", identity.unique_id))?;

        debug!("Opening simulated session for {identity} ({behavior:?})");
        let session = SimulatedSession::new(self.io_failure.clone());
        match behavior {
            SimBehavior::Succeed { delay } => {
                std::thread::sleep(delay);
                Ok(Box::new(session))
            }
            SimBehavior::Fail(message) => Err(message),
            SimBehavior::Panic(message) => panic!("{message}"),
            SimBehavior::Hang(gate) => {
                gate.wait();
                Ok(Box::new(session))
            }
            SimBehavior::Unsupported => Ok(Box::new(SimulatedSession {
                ranges: Vec::new(),
                ..session
            })),
        }
    }
}

/// Control session holding values in memory.
#[derive(Debug)]
pub struct SimulatedSession {
    ranges: Vec<(ControlKind, ControlRange)>,
    values: HashMap<ControlKind, i64>,
    io_failure: Arc<AtomicBool>,
}

impl SimulatedSession {
    fn new(io_failure: Arc<AtomicBool>) -> Self {
        let ranges = vec![
            (
                ControlKind::ExposureTime,
                ControlRange {
                    min: 3,
                    max: 2047,
                    step: 1,
                    default: 250,
                },
            ),
            (
                ControlKind::WhiteBalance,
                ControlRange {
                    min: 2800,
                    max: 6500,
                    step: 10,
                    default: 4600,
                },
            ),
            (
                ControlKind::FocusAbsolute,
                ControlRange {
                    min: 0,
                    max: 250,
                    step: 5,
                    default: 0,
                },
            ),
            (
                ControlKind::Gain,
                ControlRange {
                    min: 0,
                    max: 255,
                    step: 1,
                    default: 0,
                },
            ),
        ];
        let values = ranges.iter().map(|(k, r)| (*k, r.default)).collect();
        Self {
            ranges,
            values,
            io_failure,
        }
    }

    fn check_io(&self) -> CameraResult<()> {
        if self.io_failure.load(Ordering::SeqCst) {
            return Err(CameraError::Hardware("simulated USB stall".to_string()));
        }
        Ok(())
    }
}

impl ControlSession for SimulatedSession {
    fn supported_controls(&self) -> Vec<(ControlKind, ControlRange)> {
        self.ranges.clone()
    }

    fn read_control(&mut self, kind: ControlKind) -> CameraResult<i64> {
        self.check_io()?;
        self.values
            .get(&kind)
            .copied()
            .ok_or_else(|| CameraError::Hardware(format!("{kind} is not supported")))
    }

    fn write_control(&mut self, kind: ControlKind, value: i64) -> CameraResult<()> {
        self.check_io()?;
        if !self.ranges.iter().any(|(k, _)| *k == kind) {
            return Err(CameraError::Hardware(format!("{kind} is not supported")));
        }
        self.values.insert(kind, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach() {
        let backend = SimulatedBackend::new();
        let a = backend.attach("A", "a", SimBehavior::instant());
        backend.attach("B", "b", SimBehavior::instant());
        assert_eq!(backend.enumerate().expect("Test operation should succeed").len(), 2);

        assert_eq!(backend.detach("a"), Some(a.native));
        assert_eq!(backend.detach("a"), None);
        let remaining = backend.enumerate().expect("Test operation should succeed");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].identity.unique_id, "b");
    }

    #[test]
    fn test_open_counts_attempts() {
        let backend =
            SimulatedBackend::new().with_device("A", "a", SimBehavior::Fail("nope".into()));
        let device = backend.enumerate().expect("Test operation should succeed")[0].clone();
        let result = backend.open_session(&device.identity, &device.native);
        assert_eq!(result.err().as_deref(), Some("nope"));
        assert_eq!(backend.open_attempts(), 1);
    }

    #[test]
    fn test_unsupported_session_has_no_controls() {
        let backend = SimulatedBackend::new().with_device("A", "a", SimBehavior::Unsupported);
        let device = backend.enumerate().expect("Test operation should succeed")[0].clone();
        let session = backend
            .open_session(&device.identity, &device.native)
            .expect("Test operation should succeed");
        assert!(session.supported_controls().is_empty());
    }

    #[test]
    fn test_hang_gate_release() {
        let gate = HangGate::new();
        let waiter = gate.clone();
        let thread = std::thread::spawn(move || waiter.wait());
        gate.release();
        thread.join().expect("Test operation should succeed");
    }
}
