use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::{ControllerState, DeviceIdentity, NativeRef};

/// Hot-plug notification from the platform.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attached {
        identity: DeviceIdentity,
        native: NativeRef,
    },
    Detached(NativeRef),
}

/// Broadcast by the registry to anyone rendering its state.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device was attached or detached.
    DevicesChanged,
    SelectionChanged {
        old: Option<DeviceIdentity>,
        new: Option<DeviceIdentity>,
    },
    ControllerStateChanged {
        device: DeviceIdentity,
        old: ControllerState,
        new: ControllerState,
    },
}

/// Point-in-time view of one device for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub unique_id: String,
    pub state: ControllerState,
    pub configurable: bool,
    pub selected: bool,
    pub attached_at: DateTime<Utc>,
}

#[test]
fn test_device_snapshot_serialization() {
    let snapshot = DeviceSnapshot {
        name: "Cam".to_string(),
        unique_id: "usb:046D:082D:1".to_string(),
        state: ControllerState::Loaded,
        configurable: true,
        selected: false,
        attached_at: Utc::now(),
    };
    let json: serde_json::Value =
        serde_json::to_value(&snapshot).expect("Failed to serialize");
    assert_eq!(json["state"]["state"], "loaded");
    assert_eq!(json["configurable"], true);
    assert_eq!(json["unique_id"], "usb:046D:082D:1");
}
