//! Hot-plug detection by periodic re-enumeration.
//!
//! Each scan is diffed against the previous one by unique identifier and the
//! differences are forwarded to the registry as attach/detach notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::backend::{CaptureBackend, DiscoveredDevice};
use crate::config::Settings;
use crate::device::NativeRef;
use crate::protocol::DeviceEvent;
use crate::registry::RegistryHandle;
use crate::{CameraError, CameraResult};

/// What changed between two scans
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanDiff {
    pub attached: usize,
    pub detached: usize,
}

impl ScanDiff {
    pub fn is_empty(&self) -> bool {
        self.attached == 0 && self.detached == 0
    }
}

pub struct DeviceMonitor {
    backend: Arc<dyn CaptureBackend>,
    registry: RegistryHandle,
    poll_interval: Duration,
    known: HashMap<String, NativeRef>,
    seeded: bool,
}

impl DeviceMonitor {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        registry: RegistryHandle,
        settings: &Settings,
    ) -> Self {
        Self {
            backend,
            registry,
            poll_interval: settings.poll_interval(),
            known: HashMap::new(),
            seeded: false,
        }
    }

    /// Start from what the registry already holds so the first diff is against
    /// its enumeration, not an empty map.
    async fn seed(&mut self) -> CameraResult<()> {
        if self.seeded {
            return Ok(());
        }
        self.known = self.registry.native_refs().await?.into_iter().collect();
        self.seeded = true;
        debug!("Device monitor seeded with {} devices", self.known.len());
        Ok(())
    }

    async fn enumerate(&self) -> CameraResult<Vec<DiscoveredDevice>> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.enumerate())
            .await
            .map_err(|e| CameraError::App(format!("Device enumeration task failed: {e}")))?
    }

    /// Enumerate once and report the differences to the registry.
    pub async fn scan_once(&mut self) -> CameraResult<ScanDiff> {
        self.seed().await?;
        let devices = self.enumerate().await?;
        let mut diff = ScanDiff::default();

        let current: HashMap<String, DiscoveredDevice> = devices
            .into_iter()
            .map(|d| (d.identity.unique_id.clone(), d))
            .collect();

        // A device that came back under a new native reference is detached first
        let gone: Vec<(String, NativeRef)> = self
            .known
            .iter()
            .filter(|(id, native)| current.get(*id).is_none_or(|d| &d.native != *native))
            .map(|(id, native)| (id.clone(), native.clone()))
            .collect();

        for (unique_id, native) in gone {
            info!("Device disconnected: {unique_id}");
            self.known.remove(&unique_id);
            if self
                .registry
                .apply_device_event(DeviceEvent::Detached(native))
                .await?
            {
                diff.detached += 1;
            }
        }

        for (unique_id, device) in current {
            if self.known.contains_key(&unique_id) {
                continue;
            }
            debug!("Device seen: {}", device.identity);
            self.known.insert(unique_id, device.native.clone());
            let event = DeviceEvent::Attached {
                identity: device.identity,
                native: device.native,
            };
            if self.registry.apply_device_event(event).await? {
                diff.attached += 1;
            }
        }

        Ok(diff)
    }

    /// Poll until the registry goes away.
    pub async fn run(mut self) {
        info!(
            "Starting device monitor, polling every {}ms",
            self.poll_interval.as_millis()
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.registry.is_closed() {
                break;
            }

            match self.scan_once().await {
                Ok(diff) if !diff.is_empty() => debug!("Device scan: {diff:?}"),
                Ok(_) => {}
                Err(e) if self.registry.is_closed() => {
                    debug!("Registry closed: {e}");
                    break;
                }
                Err(e) => warn!("Device scan failed: {e}"),
            }
        }

        info!("Device monitor stopped");
    }
}

/// Start polling for hot-plug changes in a separate task
pub fn start_device_monitor(
    backend: Arc<dyn CaptureBackend>,
    registry: RegistryHandle,
    settings: &Settings,
) -> JoinHandle<()> {
    let monitor = DeviceMonitor::new(backend, registry, settings);
    tokio::spawn(monitor.run())
}
