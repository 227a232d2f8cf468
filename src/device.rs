//! Device identity and the per-device handle.
//!
//! A [`DeviceHandle`] exists for as long as its camera is attached. It owns the
//! platform reference, the loaded controller (if any) and the lifecycle state
//! the loader drives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::controls::{SharedController, lock_controller};
use crate::observable::{Change, Observable};
use crate::protocol::DeviceSnapshot;

/// Human readable name plus the platform's stable unique identifier.
///
/// Equality and hashing only look at `unique_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub unique_id: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, unique_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_id: unique_id.into(),
        }
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_id.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.unique_id)
    }
}

/// Opaque platform locator for an attached capture device.
///
/// Only the backend that produced it knows what it means.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeRef(String);

impl NativeRef {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn locator(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a device's controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ControllerState {
    #[default]
    Idle,
    Loading,
    Loaded,
    Failed(String),
}

impl ControllerState {
    pub fn is_failed(&self) -> bool {
        matches!(self, ControllerState::Failed(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ControllerState::Loading)
    }

    /// What to tell the user when loading failed.
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            ControllerState::Failed(_) => {
                Some("Try reconnecting the camera or selecting a different device.")
            }
            _ => None,
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => f.write_str("idle"),
            ControllerState::Loading => f.write_str("loading"),
            ControllerState::Loaded => f.write_str("loaded"),
            ControllerState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// One attached camera.
#[derive(Debug)]
pub struct DeviceHandle {
    identity: DeviceIdentity,
    native: NativeRef,
    attached_at: DateTime<Utc>,
    state: Observable<ControllerState>,
    session: Observable<Option<SharedController>>,
    generation: u64,
    in_flight: Option<AbortHandle>,
}

impl DeviceHandle {
    pub fn new(identity: DeviceIdentity, native: NativeRef) -> Self {
        Self {
            identity,
            native,
            attached_at: Utc::now(),
            state: Observable::default(),
            session: Observable::default(),
            generation: 0,
            in_flight: None,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn unique_id(&self) -> &str {
        &self.identity.unique_id
    }

    pub fn native(&self) -> &NativeRef {
        &self.native
    }

    pub fn matches_native(&self, native: &NativeRef) -> bool {
        &self.native == native
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    pub fn state(&self) -> &ControllerState {
        self.state.get()
    }

    pub fn session(&self) -> Option<SharedController> {
        self.session.get().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True iff a controller is loaded.
    pub fn is_configurable(&self) -> bool {
        self.session.get().is_some()
    }

    pub fn has_load_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<Change<ControllerState>> {
        self.state.subscribe()
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<Change<Option<SharedController>>> {
        self.session.subscribe()
    }

    /// Refresh exposure, white balance and focus from hardware in the background.
    ///
    /// Best effort: failures are logged, never returned.
    pub fn read_values(&self) -> Option<JoinHandle<()>> {
        let controller = self.session()?;
        let device = self.identity.unique_id.clone();
        Some(tokio::task::spawn_blocking(move || {
            match lock_controller(&controller).refresh() {
                Ok(()) => debug!("Refreshed control values for {device}"),
                Err(e) => warn!("Failed to read control values from {device}: {e}"),
            }
        }))
    }

    /// Push staged control values to hardware in the background.
    pub fn write_values(&self) -> Option<JoinHandle<()>> {
        let controller = self.session()?;
        let device = self.identity.unique_id.clone();
        Some(tokio::task::spawn_blocking(move || {
            match lock_controller(&controller).write_values() {
                Ok(written) => debug!("Wrote {written} control values to {device}"),
                Err(e) => warn!("Failed to write control values to {device}: {e}"),
            }
        }))
    }

    pub fn snapshot(&self, selected: bool) -> DeviceSnapshot {
        DeviceSnapshot {
            name: self.identity.name.clone(),
            unique_id: self.identity.unique_id.clone(),
            state: self.state().clone(),
            configurable: self.is_configurable(),
            selected,
            attached_at: self.attached_at,
        }
    }

    pub(crate) fn set_state(&mut self, state: ControllerState) {
        if *self.state.get() != state {
            self.state.set(state);
        }
    }

    pub(crate) fn set_session(&mut self, session: Option<SharedController>) {
        if self.session.get().is_none() && session.is_none() {
            return;
        }
        self.session.set(session);
    }

    /// Start a new attempt and return its generation.
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub(crate) fn set_in_flight(&mut self, task: Option<AbortHandle>) {
        if let Some(previous) = self.in_flight.take() {
            previous.abort();
        }
        self.in_flight = task;
    }

    /// Drop the in-flight marker without aborting the task it points at.
    pub(crate) fn clear_in_flight(&mut self) {
        self.in_flight = None;
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

/// Derive a stable identifier from what the platform tells us about a camera.
///
/// Prefers `usb:VID:PID:serial`; without VID/PID it falls back to the
/// description plus the enumeration index.
pub fn hardware_id(name: &str, description: &str, index: u32) -> String {
    let mut parts = vec!["usb".to_string()];

    match (
        capture_hex(r"(?i)vid[_:]([0-9a-f]{4})", description),
        capture_hex(r"(?i)pid[_:]([0-9a-f]{4})", description),
    ) {
        (Some(vid), Some(pid)) => {
            parts.push(format!("{vid}:{pid}"));
            match capture_hex(r"(?i)s[en]r?[_:]([0-9a-f]+)", description) {
                Some(serial) => parts.push(serial),
                None => parts.push(name.replace(' ', "_").to_lowercase()),
            }
        }
        _ => {
            let desc = if description.is_empty() { name } else { description };
            parts.push(format!("{}:{index}", desc.replace(' ', "_").to_lowercase()));
        }
    }

    parts.join(":")
}

fn capture_hex(pattern: &str, haystack: &str) -> Option<String> {
    regex::Regex::new(pattern)
        .ok()?
        .captures(haystack)?
        .get(1)
        .map(|m| m.as_str().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_equality_ignores_name() {
        let a = DeviceIdentity::new("FaceTime HD", "0x1234");
        let b = DeviceIdentity::new("Renamed Camera", "0x1234");
        let c = DeviceIdentity::new("FaceTime HD", "0x5678");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<DeviceIdentity> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_controller_state_guidance() {
        assert!(ControllerState::Loaded.guidance().is_none());
        assert!(
            ControllerState::Failed("boom".to_string())
                .guidance()
                .is_some_and(|g| g.contains("reconnecting"))
        );
        assert_eq!(
            ControllerState::Failed("boom".to_string()).to_string(),
            "failed: boom"
        );
    }

    #[test]
    fn test_controller_state_serialization() {
        let json = serde_json::to_string(&ControllerState::Failed("stall".to_string()))
            .expect("Failed to serialize");
        assert_eq!(json, r#"{"state":"failed","reason":"stall"}"#);
        let json = serde_json::to_string(&ControllerState::Loading).expect("Failed to serialize");
        assert_eq!(json, r#"{"state":"loading"}"#);
    }

    #[test]
    fn test_new_handle_is_idle() {
        let handle = DeviceHandle::new(DeviceIdentity::new("Cam", "cam-1"), NativeRef::new("0"));
        assert_eq!(*handle.state(), ControllerState::Idle);
        assert!(!handle.is_configurable());
        assert!(!handle.has_load_in_flight());
        assert_eq!(handle.generation(), 0);
        assert!(handle.matches_native(&NativeRef::new("0")));
        assert!(!handle.matches_native(&NativeRef::new("1")));
    }

    #[test]
    fn test_read_write_without_session_are_noops() {
        let handle = DeviceHandle::new(DeviceIdentity::new("Cam", "cam-1"), NativeRef::new("0"));
        assert!(handle.read_values().is_none());
        assert!(handle.write_values().is_none());
    }

    #[test]
    fn test_set_state_emits_only_on_change() {
        let mut handle =
            DeviceHandle::new(DeviceIdentity::new("Cam", "cam-1"), NativeRef::new("0"));
        let mut rx = handle.subscribe_state();
        handle.set_state(ControllerState::Idle);
        handle.set_state(ControllerState::Loading);
        let change = rx.try_recv().expect("Test operation should succeed");
        assert_eq!(change.old, ControllerState::Idle);
        assert_eq!(change.new, ControllerState::Loading);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_hardware_id_with_vid_pid_serial() {
        let id = hardware_id("Logitech C920", "USB VID_046D PID_082D SN_ABC123", 0);
        assert_eq!(id, "usb:046D:082D:ABC123");
    }

    #[test]
    fn test_hardware_id_without_serial_uses_name() {
        let id = hardware_id("Logitech C920", "vid:046d pid:082d", 2);
        assert_eq!(id, "usb:046D:082D:logitech_c920");
    }

    #[test]
    fn test_hardware_id_fallback() {
        assert_eq!(
            hardware_id("Integrated Camera", "Video4Linux Device", 1),
            "usb:video4linux_device:1"
        );
        assert_eq!(hardware_id("Integrated Camera", "", 0), "usb:integrated_camera:0");
    }
}
