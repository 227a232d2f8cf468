//! Live registry of attached cameras and the current selection.
//!
//! [`DeviceRegistry`] runs as a single task that owns every [`DeviceHandle`].
//! Hot-plug notifications, selection changes, load requests and loader
//! completions are all messages to that task, so device state is only ever
//! mutated in one place. Callers talk to it through the cloneable
//! [`RegistryHandle`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backend::CaptureBackend;
use crate::config::{SelectionStore, Settings};
use crate::controls::SharedController;
use crate::device::{ControllerState, DeviceHandle, DeviceIdentity, NativeRef};
use crate::loader::{ControllerLoader, LoadEvent};
use crate::observable::Change;
use crate::protocol::{DeviceEvent, DeviceSnapshot, RegistryEvent};
use crate::{CameraError, CameraResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Requests handled by the registry task
#[derive(Debug)]
pub enum RegistryRequest {
    /// Snapshot of every attached device
    ListDevices {
        respond_to: oneshot::Sender<Vec<DeviceSnapshot>>,
    },
    /// Unique id and native reference of every attached device
    ListNative {
        respond_to: oneshot::Sender<Vec<(String, NativeRef)>>,
    },
    /// Snapshot of one device
    GetDevice {
        unique_id: String,
        respond_to: oneshot::Sender<CameraResult<DeviceSnapshot>>,
    },
    /// Identity of the selected device
    GetSelected {
        respond_to: oneshot::Sender<Option<DeviceIdentity>>,
    },
    /// Select a device and persist the choice
    Select {
        unique_id: String,
        respond_to: oneshot::Sender<CameraResult<()>>,
    },
    /// Platform reported a new device
    DeviceAttached {
        identity: DeviceIdentity,
        native: NativeRef,
        respond_to: oneshot::Sender<bool>,
    },
    /// Platform reported a device going away
    DeviceDetached {
        native: NativeRef,
        respond_to: oneshot::Sender<bool>,
    },
    /// Start loading a device's controller
    EnsureLoaded {
        unique_id: String,
        respond_to: oneshot::Sender<CameraResult<bool>>,
    },
    /// Clear a failed load so it can be attempted again
    Retry {
        unique_id: String,
        respond_to: oneshot::Sender<CameraResult<bool>>,
    },
    /// The loaded controller, if any
    GetController {
        unique_id: String,
        respond_to: oneshot::Sender<CameraResult<Option<SharedController>>>,
    },
    /// Refresh control values from hardware
    ReadValues {
        unique_id: String,
        respond_to: oneshot::Sender<CameraResult<bool>>,
    },
    /// Push staged control values to hardware
    WriteValues {
        unique_id: String,
        respond_to: oneshot::Sender<CameraResult<bool>>,
    },
    /// Subscribe to a device's lifecycle state
    SubscribeState {
        unique_id: String,
        respond_to: oneshot::Sender<CameraResult<broadcast::Receiver<Change<ControllerState>>>>,
    },
    /// Subscribe to a device's controller being loaded or dropped
    SubscribeSession {
        unique_id: String,
        respond_to:
            oneshot::Sender<CameraResult<broadcast::Receiver<Change<Option<SharedController>>>>>,
    },
    /// Invalidate everything and stop
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Handle for communicating with the device registry
#[derive(Clone)]
pub struct RegistryHandle {
    request_sender: mpsc::UnboundedSender<RegistryRequest>,
    events: broadcast::Sender<RegistryEvent>,
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryRequest,
    ) -> CameraResult<T> {
        let (sender, receiver) = oneshot::channel();
        self.request_sender
            .send(make(sender))
            .map_err(|_| CameraError::App("Device registry channel closed".to_string()))?;
        receiver
            .await
            .map_err(|_| CameraError::App("Device registry response failed".to_string()))
    }

    /// True once the registry task has stopped.
    pub fn is_closed(&self) -> bool {
        self.request_sender.is_closed()
    }

    /// Registry-wide change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn list_devices(&self) -> CameraResult<Vec<DeviceSnapshot>> {
        self.request(|respond_to| RegistryRequest::ListDevices { respond_to })
            .await
    }

    /// Native references the registry currently holds, keyed by unique id.
    pub async fn native_refs(&self) -> CameraResult<Vec<(String, NativeRef)>> {
        self.request(|respond_to| RegistryRequest::ListNative { respond_to })
            .await
    }

    pub async fn device(&self, unique_id: &str) -> CameraResult<DeviceSnapshot> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::GetDevice {
            unique_id,
            respond_to,
        })
        .await?
    }

    pub async fn selected(&self) -> CameraResult<Option<DeviceIdentity>> {
        self.request(|respond_to| RegistryRequest::GetSelected { respond_to })
            .await
    }

    /// Select a device. Does not start loading it.
    pub async fn select(&self, unique_id: &str) -> CameraResult<()> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::Select {
            unique_id,
            respond_to,
        })
        .await?
    }

    /// Returns `true` if the device was new.
    pub async fn device_attached(
        &self,
        identity: DeviceIdentity,
        native: NativeRef,
    ) -> CameraResult<bool> {
        self.request(|respond_to| RegistryRequest::DeviceAttached {
            identity,
            native,
            respond_to,
        })
        .await
    }

    /// Returns `true` if a matching device was removed.
    pub async fn device_detached(&self, native: NativeRef) -> CameraResult<bool> {
        self.request(|respond_to| RegistryRequest::DeviceDetached { native, respond_to })
            .await
    }

    /// Forward a platform hot-plug notification.
    pub async fn apply_device_event(&self, event: DeviceEvent) -> CameraResult<bool> {
        match event {
            DeviceEvent::Attached { identity, native } => {
                self.device_attached(identity, native).await
            }
            DeviceEvent::Detached(native) => self.device_detached(native).await,
        }
    }

    /// Kick off a controller load. Returns `true` if an attempt was started;
    /// the outcome arrives through the state subscriptions.
    pub async fn ensure_loaded(&self, unique_id: &str) -> CameraResult<bool> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::EnsureLoaded {
            unique_id,
            respond_to,
        })
        .await?
    }

    /// [`ensure_loaded`](Self::ensure_loaded) for the current selection.
    pub async fn ensure_selected_loaded(&self) -> CameraResult<bool> {
        match self.selected().await? {
            Some(identity) => self.ensure_loaded(&identity.unique_id).await,
            None => Err(CameraError::Device("No camera selected".to_string())),
        }
    }

    pub async fn retry(&self, unique_id: &str) -> CameraResult<bool> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::Retry {
            unique_id,
            respond_to,
        })
        .await?
    }

    pub async fn controller(&self, unique_id: &str) -> CameraResult<Option<SharedController>> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::GetController {
            unique_id,
            respond_to,
        })
        .await?
    }

    pub async fn is_configurable(&self, unique_id: &str) -> CameraResult<bool> {
        Ok(self.device(unique_id).await?.configurable)
    }

    /// Returns `false` when there is no controller to read from.
    pub async fn read_values(&self, unique_id: &str) -> CameraResult<bool> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::ReadValues {
            unique_id,
            respond_to,
        })
        .await?
    }

    /// Returns `false` when there is no controller to write to.
    pub async fn write_values(&self, unique_id: &str) -> CameraResult<bool> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::WriteValues {
            unique_id,
            respond_to,
        })
        .await?
    }

    pub async fn subscribe_state(
        &self,
        unique_id: &str,
    ) -> CameraResult<broadcast::Receiver<Change<ControllerState>>> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::SubscribeState {
            unique_id,
            respond_to,
        })
        .await?
    }

    pub async fn subscribe_session(
        &self,
        unique_id: &str,
    ) -> CameraResult<broadcast::Receiver<Change<Option<SharedController>>>> {
        let unique_id = unique_id.to_string();
        self.request(|respond_to| RegistryRequest::SubscribeSession {
            unique_id,
            respond_to,
        })
        .await?
    }

    /// Load the device's controller and wait until it settles or `limit` passes.
    ///
    /// Returns the state at that point; `Loading` means the limit was hit.
    pub async fn load_and_wait(
        &self,
        unique_id: &str,
        limit: Duration,
    ) -> CameraResult<ControllerState> {
        let mut changes = self.subscribe_state(unique_id).await?;
        self.ensure_loaded(unique_id).await?;

        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let state = self.device(unique_id).await?.state;
            if !state.is_loading() {
                return Ok(state);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, changes.recv()).await {
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(CameraError::Device(format!("{unique_id} was detached")));
                }
                Err(_) => return Ok(state),
            }
        }
    }

    /// Invalidate all loads and stop the registry task.
    pub async fn shutdown(&self) -> CameraResult<()> {
        self.request(|respond_to| RegistryRequest::Shutdown { respond_to })
            .await
    }
}

/// Owner of all device handles and the selection.
pub struct DeviceRegistry {
    devices: Vec<DeviceHandle>,
    selected: Option<String>,
    loader: ControllerLoader,
    store: Arc<dyn SelectionStore>,
    request_receiver: mpsc::UnboundedReceiver<RegistryRequest>,
    load_events: mpsc::UnboundedReceiver<LoadEvent>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Enumerate attached devices and restore the last selection.
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        store: Arc<dyn SelectionStore>,
        settings: &Settings,
    ) -> CameraResult<(DeviceRegistry, RegistryHandle)> {
        settings.validate()?;

        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let (load_sender, load_events) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut devices: Vec<DeviceHandle> = Vec::new();
        for discovered in backend.enumerate()? {
            if devices
                .iter()
                .any(|d| d.identity() == &discovered.identity)
            {
                debug!("Skipping duplicate enumeration of {}", discovered.identity);
                continue;
            }
            devices.push(DeviceHandle::new(discovered.identity, discovered.native));
        }

        let restored = store
            .last_selected()
            .filter(|id| devices.iter().any(|d| d.unique_id() == id));
        let selected = restored.or_else(|| devices.first().map(|d| d.unique_id().to_string()));

        info!(
            "Found {} capture devices, selected {:?}",
            devices.len(),
            selected
        );

        let registry = DeviceRegistry {
            devices,
            selected,
            loader: ControllerLoader::from_settings(backend, settings, load_sender),
            store,
            request_receiver,
            load_events,
            events: events.clone(),
        };

        let handle = RegistryHandle {
            request_sender,
            events,
        };

        Ok((registry, handle))
    }

    /// Run the registry event loop
    pub async fn run(mut self) -> CameraResult<()> {
        info!("Starting device registry");

        loop {
            tokio::select! {
                request = self.request_receiver.recv() => match request {
                    Some(RegistryRequest::Shutdown { respond_to }) => {
                        self.teardown();
                        if respond_to.send(()).is_err() {
                            debug!("Failed to send shutdown response");
                        }
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("All registry handles dropped");
                        self.teardown();
                        break;
                    }
                },
                Some(event) = self.load_events.recv() => self.apply_load_event(event),
            }
        }

        info!("Device registry stopped");
        Ok(())
    }

    fn handle_request(&mut self, request: RegistryRequest) {
        match request {
            RegistryRequest::ListDevices { respond_to } => {
                if respond_to.send(self.snapshots()).is_err() {
                    debug!("Failed to send device list response");
                }
            }
            RegistryRequest::ListNative { respond_to } => {
                let natives = self
                    .devices
                    .iter()
                    .map(|d| (d.unique_id().to_string(), d.native().clone()))
                    .collect();
                if respond_to.send(natives).is_err() {
                    debug!("Failed to send native reference response");
                }
            }
            RegistryRequest::GetDevice {
                unique_id,
                respond_to,
            } => {
                let result = self
                    .find(&unique_id)
                    .map(|d| d.snapshot(self.is_selected(d.unique_id())));
                if respond_to.send(result).is_err() {
                    debug!("Failed to send device response");
                }
            }
            RegistryRequest::GetSelected { respond_to } => {
                if respond_to.send(self.selected_identity()).is_err() {
                    debug!("Failed to send selection response");
                }
            }
            RegistryRequest::Select {
                unique_id,
                respond_to,
            } => {
                let result = self.select(&unique_id);
                if respond_to.send(result).is_err() {
                    debug!("Failed to send select response");
                }
            }
            RegistryRequest::DeviceAttached {
                identity,
                native,
                respond_to,
            } => {
                let added = self.on_device_attached(identity, native);
                if respond_to.send(added).is_err() {
                    debug!("Failed to send attach response");
                }
            }
            RegistryRequest::DeviceDetached { native, respond_to } => {
                let removed = self.on_device_detached(&native);
                if respond_to.send(removed).is_err() {
                    debug!("Failed to send detach response");
                }
            }
            RegistryRequest::EnsureLoaded {
                unique_id,
                respond_to,
            } => {
                let result =
                    self.transition(&unique_id, |loader, device| loader.ensure_loaded(device));
                if respond_to.send(result).is_err() {
                    debug!("Failed to send ensure loaded response");
                }
            }
            RegistryRequest::Retry {
                unique_id,
                respond_to,
            } => {
                let result = self.transition(&unique_id, |loader, device| loader.retry(device));
                if respond_to.send(result).is_err() {
                    debug!("Failed to send retry response");
                }
            }
            RegistryRequest::GetController {
                unique_id,
                respond_to,
            } => {
                let result = self.find(&unique_id).map(|d| d.session());
                if respond_to.send(result).is_err() {
                    debug!("Failed to send controller response");
                }
            }
            RegistryRequest::ReadValues {
                unique_id,
                respond_to,
            } => {
                let result = self.find(&unique_id).map(|d| d.read_values().is_some());
                if respond_to.send(result).is_err() {
                    debug!("Failed to send read values response");
                }
            }
            RegistryRequest::WriteValues {
                unique_id,
                respond_to,
            } => {
                let result = self.find(&unique_id).map(|d| d.write_values().is_some());
                if respond_to.send(result).is_err() {
                    debug!("Failed to send write values response");
                }
            }
            RegistryRequest::SubscribeState {
                unique_id,
                respond_to,
            } => {
                let result = self.find(&unique_id).map(|d| d.subscribe_state());
                if respond_to.send(result).is_err() {
                    debug!("Failed to send state subscription");
                }
            }
            RegistryRequest::SubscribeSession {
                unique_id,
                respond_to,
            } => {
                let result = self.find(&unique_id).map(|d| d.subscribe_session());
                if respond_to.send(result).is_err() {
                    debug!("Failed to send session subscription");
                }
            }
            RegistryRequest::Shutdown { respond_to } => {
                // Handled by run(); reaching here means a second shutdown raced the first
                let _ = respond_to.send(());
            }
        }
    }

    fn find(&self, unique_id: &str) -> CameraResult<&DeviceHandle> {
        self.devices
            .iter()
            .find(|d| d.unique_id() == unique_id)
            .ok_or_else(|| CameraError::Device(format!("Camera not found: {unique_id}")))
    }

    fn is_selected(&self, unique_id: &str) -> bool {
        self.selected.as_deref() == Some(unique_id)
    }

    fn selected_identity(&self) -> Option<DeviceIdentity> {
        let selected = self.selected.as_deref()?;
        self.devices
            .iter()
            .find(|d| d.unique_id() == selected)
            .map(|d| d.identity().clone())
    }

    fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .iter()
            .map(|d| d.snapshot(self.is_selected(d.unique_id())))
            .collect()
    }

    fn broadcast(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Run a loader operation on one device and publish any state change.
    fn transition<R>(
        &mut self,
        unique_id: &str,
        operation: impl FnOnce(&ControllerLoader, &mut DeviceHandle) -> R,
    ) -> CameraResult<R> {
        let Some(device) = self.devices.iter_mut().find(|d| d.unique_id() == unique_id) else {
            return Err(CameraError::Device(format!("Camera not found: {unique_id}")));
        };

        let old = device.state().clone();
        let result = operation(&self.loader, device);
        if *device.state() != old {
            let _ = self.events.send(RegistryEvent::ControllerStateChanged {
                device: device.identity().clone(),
                old,
                new: device.state().clone(),
            });
        }
        Ok(result)
    }

    fn apply_load_event(&mut self, event: LoadEvent) {
        let device_id = event.device_id().to_string();
        if self
            .transition(&device_id, |loader, device| loader.apply(device, event))
            .is_err()
        {
            debug!("Discarding load event for detached device {device_id}");
        }
    }

    fn on_device_attached(&mut self, identity: DeviceIdentity, native: NativeRef) -> bool {
        // The same camera can be announced more than once
        if self.devices.iter().any(|d| d.identity() == &identity) {
            debug!("Ignoring duplicate attach for {identity}");
            return false;
        }

        info!("Device attached: {identity}");
        self.devices.push(DeviceHandle::new(identity, native));
        self.broadcast(RegistryEvent::DevicesChanged);
        true
    }

    fn on_device_detached(&mut self, native: &NativeRef) -> bool {
        let Some(index) = self.devices.iter().position(|d| d.matches_native(native)) else {
            debug!("Ignoring detach for unknown device {}", native.locator());
            return false;
        };

        let mut device = self.devices.remove(index);
        self.loader.invalidate(&mut device);
        info!("Device detached: {}", device.identity());

        if self.is_selected(device.unique_id()) {
            self.selected = None;
            self.broadcast(RegistryEvent::SelectionChanged {
                old: Some(device.identity().clone()),
                new: None,
            });
        }
        self.broadcast(RegistryEvent::DevicesChanged);
        true
    }

    fn select(&mut self, unique_id: &str) -> CameraResult<()> {
        let new_identity = self.find(unique_id)?.identity().clone();

        if self.is_selected(unique_id) {
            debug!("{new_identity} is already selected");
            return Ok(());
        }

        let old_identity = self.selected_identity();
        if let Some(old) = &old_identity {
            // Leaving a device abandons whatever it was loading
            self.transition(&old.unique_id, |loader, device| loader.invalidate(device))?;
        }
        // Reselection is the explicit action that re-arms a failed device
        self.transition(unique_id, |loader, device| loader.retry(device))?;

        self.selected = Some(unique_id.to_string());
        info!("Selected {new_identity}");

        // Written in order on this task so a later select can never be overtaken
        if let Err(e) = self.store.set_last_selected(unique_id) {
            warn!("Failed to persist selected device {unique_id}: {e}");
        }

        self.broadcast(RegistryEvent::SelectionChanged {
            old: old_identity,
            new: Some(new_identity),
        });
        Ok(())
    }

    fn teardown(&mut self) {
        for device in &mut self.devices {
            self.loader.invalidate(device);
        }
        let count = self.devices.len();
        self.devices.clear();
        self.selected = None;
        debug!("Released {count} devices");
    }
}

/// Start the device registry in a separate task
pub fn start_device_registry(
    backend: Arc<dyn CaptureBackend>,
    store: Arc<dyn SelectionStore>,
    settings: &Settings,
) -> CameraResult<RegistryHandle> {
    let (registry, handle) = DeviceRegistry::new(backend, store, settings)?;

    tokio::spawn(async move {
        if let Err(e) = registry.run().await {
            error!("Device registry error: {e}");
        }
    });

    Ok(handle)
}
