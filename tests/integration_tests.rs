//! Integration tests for the device registry with simulated cameras

use camera_controller::config::{FileSelectionStore, SelectionStore, Settings};
use camera_controller::controls::{ControlKind, lock_controller};
use camera_controller::device::ControllerState;
use camera_controller::device_monitor::start_device_monitor;
use camera_controller::protocol::RegistryEvent;
use camera_controller::registry::{RegistryHandle, start_device_registry};
use camera_controller::simulated::{HangGate, SimBehavior, SimulatedBackend};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_test::assert_ok;

/// Test configuration for integration tests
fn create_test_settings() -> Settings {
    Settings {
        race_timeout_ms: 300,
        watchdog_timeout_ms: 600,
        poll_interval_ms: 20,
        debug: true,
    }
}

fn create_test_backend() -> Arc<SimulatedBackend> {
    Arc::new(
        SimulatedBackend::new()
            .with_device("Front Camera", "usb:046D:082D:FRONT", SimBehavior::instant())
            .with_device(
                "Side Camera",
                "usb:046D:082D:SIDE",
                SimBehavior::Succeed {
                    delay: Duration::from_millis(20),
                },
            ),
    )
}

fn start_registry(
    backend: Arc<SimulatedBackend>,
    store: Arc<FileSelectionStore>,
) -> RegistryHandle {
    start_device_registry(backend, store, &create_test_settings())
        .expect("Failed to start device registry")
}

async fn wait_for<F>(registry: &RegistryHandle, mut predicate: F)
where
    F: FnMut(&[camera_controller::protocol::DeviceSnapshot]) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            let devices = registry
                .list_devices()
                .await
                .expect("Failed to list devices");
            if predicate(devices.as_slice()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition was not reached in time");
}

#[tokio::test]
async fn test_selection_survives_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(FileSelectionStore::new(temp_dir.path().join("config.json")));

    let registry = start_registry(create_test_backend(), store.clone());
    let selected = assert_ok!(registry.selected().await).expect("Should default to first camera");
    assert_eq!(selected.unique_id, "usb:046D:082D:FRONT");

    assert_ok!(registry.select("usb:046D:082D:SIDE").await);
    assert_ok!(registry.shutdown().await);
    assert_eq!(store.last_selected().as_deref(), Some("usb:046D:082D:SIDE"));

    let registry = start_registry(create_test_backend(), store.clone());
    let selected = assert_ok!(registry.selected().await).expect("Selection should be restored");
    assert_eq!(selected.unique_id, "usb:046D:082D:SIDE");
    assert_ok!(registry.shutdown().await);
}

#[tokio::test]
async fn test_load_read_and_write_controls() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(FileSelectionStore::new(temp_dir.path().join("config.json")));
    let registry = start_registry(create_test_backend(), store);

    let state = assert_ok!(
        registry
            .load_and_wait("usb:046D:082D:SIDE", Duration::from_secs(2))
            .await
    );
    assert_eq!(state, ControllerState::Loaded);

    let controller = assert_ok!(registry.controller("usb:046D:082D:SIDE").await)
        .expect("Loaded device should have a controller");
    {
        let mut controller = lock_controller(&controller);
        let staged = controller
            .set_pending(ControlKind::WhiteBalance, 5003)
            .expect("White balance should be supported");
        assert_eq!(staged, 5000);
    }

    assert!(assert_ok!(registry.write_values("usb:046D:082D:SIDE").await));
    timeout(Duration::from_secs(2), async {
        loop {
            let written = lock_controller(&controller)
                .control(ControlKind::WhiteBalance)
                .is_some_and(|c| c.pending.is_none() && c.current == 5000);
            if written {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Staged value should be written");

    assert!(assert_ok!(registry.read_values("usb:046D:082D:SIDE").await));
    assert_ok!(registry.shutdown().await);
}

#[tokio::test]
async fn test_hotplug_with_monitor() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(FileSelectionStore::new(temp_dir.path().join("config.json")));
    let backend = create_test_backend();
    let registry = start_registry(backend.clone(), store);
    let mut events = registry.subscribe();
    let monitor = start_device_monitor(backend.clone(), registry.clone(), &create_test_settings());

    backend.attach("Top Camera", "usb:1234:5678:TOP", SimBehavior::instant());
    wait_for(&registry, |devices| devices.len() == 3).await;

    backend.detach("usb:046D:082D:FRONT");
    wait_for(&registry, |devices| {
        devices.len() == 2 && devices.iter().all(|d| d.unique_id != "usb:046D:082D:FRONT")
    })
    .await;

    // Detaching the selected camera clears the selection
    assert!(assert_ok!(registry.selected().await).is_none());

    let mut saw_selection_cleared = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RegistryEvent::SelectionChanged { new: None, .. }) {
            saw_selection_cleared = true;
        }
    }
    assert!(saw_selection_cleared);

    assert_ok!(registry.shutdown().await);
    timeout(Duration::from_secs(2), monitor)
        .await
        .expect("Monitor should stop with the registry")
        .expect("Monitor task should not panic");
}

#[tokio::test]
async fn test_unplug_during_load_discards_result() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(FileSelectionStore::new(temp_dir.path().join("config.json")));
    let backend = Arc::new(SimulatedBackend::new().with_device(
        "Slow Camera",
        "slow",
        SimBehavior::Succeed {
            delay: Duration::from_millis(150),
        },
    ));
    let registry = start_registry(backend.clone(), store);

    assert!(assert_ok!(registry.ensure_loaded("slow").await));
    let native = backend.detach("slow").expect("Device should be attached");
    assert!(assert_ok!(registry.device_detached(native).await));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(assert_ok!(registry.list_devices().await).is_empty());
    assert!(registry.device("slow").await.is_err());
    assert_ok!(registry.shutdown().await);
}

#[tokio::test]
async fn test_hang_then_recover_on_retry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(FileSelectionStore::new(temp_dir.path().join("config.json")));
    let gate = HangGate::new();
    let backend = Arc::new(SimulatedBackend::new().with_device(
        "Stuck Camera",
        "stuck",
        SimBehavior::Hang(gate.clone()),
    ));
    let registry = start_registry(backend.clone(), store);

    let state = assert_ok!(registry.load_and_wait("stuck", Duration::from_secs(2)).await);
    assert!(state.is_failed(), "{state:?}");
    assert!(!assert_ok!(registry.is_configurable("stuck").await));

    gate.release();
    backend.set_behavior("stuck", SimBehavior::instant());
    assert!(assert_ok!(registry.retry("stuck").await));

    let state = assert_ok!(registry.load_and_wait("stuck", Duration::from_secs(2)).await);
    assert_eq!(state, ControllerState::Loaded);
    assert_ok!(registry.shutdown().await);
}

#[tokio::test]
async fn test_shutdown_invalidates_in_flight_loads() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(FileSelectionStore::new(temp_dir.path().join("config.json")));
    let gate = HangGate::new();
    let backend = Arc::new(SimulatedBackend::new().with_device(
        "Stuck Camera",
        "stuck",
        SimBehavior::Hang(gate.clone()),
    ));
    let registry = start_registry(backend, store);
    let mut states = assert_ok!(registry.subscribe_state("stuck").await);

    assert!(assert_ok!(registry.ensure_loaded("stuck").await));
    assert_ok!(registry.shutdown().await);

    let mut last = None;
    while let Ok(change) = states.try_recv() {
        last = Some(change.new);
    }
    assert_eq!(last, Some(ControllerState::Idle));
    assert!(registry.is_closed() || registry.list_devices().await.is_err());
    gate.release();
}
