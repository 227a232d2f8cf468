//! Timeout guarded, generation checked controller loading.
//!
//! [`ControllerLoader::ensure_loaded`] starts an attempt and returns at once.
//! The attempt runs the blocking native init on tokio's blocking pool, races
//! it against a short timeout, and arms an independent watchdog. Neither task
//! touches the handle: both report back as [`LoadEvent`]s, which the owner of
//! the handle feeds to [`ControllerLoader::apply`] on its own task. Every event
//! carries the generation it was started under and is dropped if the handle
//! has moved on since.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::backend::CaptureBackend;
use crate::config::Settings;
use crate::controls::DeviceController;
use crate::device::{ControllerState, DeviceHandle, DeviceIdentity, NativeRef};
use crate::error::LoadError;

/// Completion reported back to the task that owns the handle.
#[derive(Debug)]
pub enum LoadEvent {
    /// Init finished, failed, or lost the race.
    Resolved {
        device_id: String,
        generation: u64,
        outcome: Result<DeviceController, LoadError>,
    },
    /// The hard ceiling for `generation` elapsed.
    WatchdogExpired { device_id: String, generation: u64 },
}

impl LoadEvent {
    pub fn device_id(&self) -> &str {
        match self {
            LoadEvent::Resolved { device_id, .. }
            | LoadEvent::WatchdogExpired { device_id, .. } => device_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            LoadEvent::Resolved { generation, .. }
            | LoadEvent::WatchdogExpired { generation, .. } => *generation,
        }
    }
}

pub struct ControllerLoader {
    backend: Arc<dyn CaptureBackend>,
    race_timeout: Duration,
    watchdog_timeout: Duration,
    events: mpsc::UnboundedSender<LoadEvent>,
}

impl ControllerLoader {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        race_timeout: Duration,
        watchdog_timeout: Duration,
        events: mpsc::UnboundedSender<LoadEvent>,
    ) -> Self {
        Self {
            backend,
            race_timeout,
            watchdog_timeout,
            events,
        }
    }

    pub fn from_settings(
        backend: Arc<dyn CaptureBackend>,
        settings: &Settings,
        events: mpsc::UnboundedSender<LoadEvent>,
    ) -> Self {
        Self::new(
            backend,
            settings.race_timeout(),
            settings.watchdog_timeout(),
            events,
        )
    }

    /// Start loading the device's controller unless there is nothing to do.
    ///
    /// No-op (returns `false`) when a controller is already loaded, an
    /// attempt is in flight, or the device is `Failed`.
    pub fn ensure_loaded(&self, device: &mut DeviceHandle) -> bool {
        if device.is_configurable() {
            debug!("Controller for {} already loaded", device.identity());
            return false;
        }
        if device.has_load_in_flight() || device.state().is_loading() {
            debug!("Controller for {} already loading", device.identity());
            return false;
        }
        if device.state().is_failed() {
            debug!(
                "Controller for {} previously failed, waiting for an explicit retry",
                device.identity()
            );
            return false;
        }

        let generation = device.next_generation();
        device.set_state(ControllerState::Loading);
        info!(
            "Loading controller for {} (generation {generation})",
            device.identity()
        );

        let task = tokio::spawn(Self::race_init(
            self.backend.clone(),
            device.identity().clone(),
            device.native().clone(),
            generation,
            self.race_timeout,
            self.events.clone(),
        ));
        device.set_in_flight(Some(task.abort_handle()));

        let events = self.events.clone();
        let device_id = device.unique_id().to_string();
        let watchdog = self.watchdog_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(watchdog).await;
            // Receiver gone means the registry shut down
            let _ = events.send(LoadEvent::WatchdogExpired {
                device_id,
                generation,
            });
        });

        true
    }

    async fn race_init(
        backend: Arc<dyn CaptureBackend>,
        identity: DeviceIdentity,
        native: NativeRef,
        generation: u64,
        race_timeout: Duration,
        events: mpsc::UnboundedSender<LoadEvent>,
    ) {
        let device_id = identity.unique_id.clone();
        let init = tokio::task::spawn_blocking(move || {
            open_controller(backend.as_ref(), &identity, &native)
        });

        // On timeout the blocking init keeps running; its result is dropped with the handle
        // and the runtime abandons the thread at shutdown (see `runtime::block_on_bounded`).
        let outcome = match tokio::time::timeout(race_timeout, init).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(LoadError::NativeFault(join_error_message(e))),
            Err(_) => Err(LoadError::InitTimeout(race_timeout)),
        };

        if events
            .send(LoadEvent::Resolved {
                device_id: device_id.clone(),
                generation,
                outcome,
            })
            .is_err()
        {
            debug!("Dropping load result for {device_id}, registry is gone");
        }
    }

    /// Apply a completion to its device. Returns `false` if it was stale.
    pub fn apply(&self, device: &mut DeviceHandle, event: LoadEvent) -> bool {
        match event {
            LoadEvent::Resolved {
                generation,
                outcome,
                ..
            } => {
                if generation != device.generation() {
                    debug!(
                        "Discarding stale load result for {} (generation {generation}, current {})",
                        device.identity(),
                        device.generation()
                    );
                    return false;
                }

                device.clear_in_flight();
                match outcome {
                    Ok(controller) => {
                        info!("Controller loaded for {}", device.identity());
                        device.set_session(Some(Arc::new(Mutex::new(controller))));
                        device.set_state(ControllerState::Loaded);
                    }
                    Err(e) => {
                        warn!("Failed to load controller for {}: {e}", device.identity());
                        device.set_session(None);
                        device.set_state(ControllerState::Failed(e.to_string()));
                    }
                }
                true
            }
            LoadEvent::WatchdogExpired { generation, .. } => {
                if generation != device.generation()
                    || device.is_configurable()
                    || !device.state().is_loading()
                {
                    return false;
                }

                let error = LoadError::WatchdogTimeout(self.watchdog_timeout);
                warn!("Watchdog fired for {}: {error}", device.identity());
                device.set_state(ControllerState::Failed(error.to_string()));
                // Invalidate so a late completion is ignored
                device.next_generation();
                device.set_in_flight(None);
                true
            }
        }
    }

    /// Cancel an in-flight attempt and return the device to `Idle`.
    ///
    /// Returns `false` if nothing was loading.
    pub fn invalidate(&self, device: &mut DeviceHandle) -> bool {
        if !device.has_load_in_flight() && !device.state().is_loading() {
            return false;
        }

        let superseded = device.generation();
        device.next_generation();
        device.set_in_flight(None);
        device.set_state(ControllerState::Idle);
        debug!(
            "Invalidated load of {} (generation {superseded})",
            device.identity()
        );
        true
    }

    /// Clear a `Failed` state so the next [`ensure_loaded`](Self::ensure_loaded) tries again.
    pub fn retry(&self, device: &mut DeviceHandle) -> bool {
        if !device.state().is_failed() {
            return false;
        }
        info!("Re-arming controller load for {}", device.identity());
        device.set_state(ControllerState::Idle);
        true
    }
}

fn open_controller(
    backend: &dyn CaptureBackend,
    identity: &DeviceIdentity,
    native: &NativeRef,
) -> Result<DeviceController, LoadError> {
    let session = backend
        .open_session(identity, native)
        .map_err(LoadError::NativeFault)?;
    DeviceController::from_session(session).ok_or(LoadError::UnsupportedDevice)
}

fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "initialization task was cancelled".to_string();
    }
    panic_message(error.into_panic())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic during initialization".to_string()
    }
}
