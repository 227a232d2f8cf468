//! Platform seam: device enumeration and control session construction.

use crate::controls::ControlSession;
use crate::device::{DeviceIdentity, NativeRef};
use crate::CameraResult;

/// A camera reported by enumeration.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub identity: DeviceIdentity,
    pub native: NativeRef,
}

impl DiscoveredDevice {
    pub fn new(identity: DeviceIdentity, native: NativeRef) -> Self {
        Self { identity, native }
    }
}

/// Access to the platform's capture devices.
///
/// Both methods may block; the registry calls [`open_session`](Self::open_session)
/// on the blocking thread pool and never on its own task.
pub trait CaptureBackend: Send + Sync + 'static {
    /// Currently attached capture devices, in platform order.
    fn enumerate(&self) -> CameraResult<Vec<DiscoveredDevice>>;

    /// Open a control session. The error string describes the native fault.
    fn open_session(
        &self,
        identity: &DeviceIdentity,
        native: &NativeRef,
    ) -> Result<Box<dyn ControlSession>, String>;
}
