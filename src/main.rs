use camera_controller::backend::CaptureBackend;
use camera_controller::config::{FileSelectionStore, Settings};
use camera_controller::controls::{ControlKind, lock_controller};
use camera_controller::device::ControllerState;
use camera_controller::device_monitor::start_device_monitor;
use camera_controller::protocol::RegistryEvent;
use camera_controller::registry::{RegistryHandle, start_device_registry};
use camera_controller::runtime::{SHUTDOWN_GRACE, block_on_bounded};
use camera_controller::simulated::SimulatedBackend;
use camera_controller::{CameraError, CameraResult};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "camera-controller")]
#[command(about = "Camera device manager with guarded controller loading")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Use simulated cameras instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached cameras
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Select a camera and remember it
    Select {
        /// Unique identifier of the camera
        id: String,
    },
    /// Load a camera's controller and show its controls
    Controls {
        /// Unique identifier of the camera (defaults to the selected one)
        id: Option<String>,
    },
    /// Set a control value
    Set {
        /// Control name (exposure, white_balance, focus, gain)
        control: ControlKind,
        /// New value, clamped to the control's range
        #[arg(allow_negative_numbers = true)]
        value: i64,
        /// Unique identifier of the camera (defaults to the selected one)
        #[arg(long)]
        device: Option<String>,
    },
    /// Follow hot-plug and controller events until Ctrl-C
    Watch,
}

fn create_backend(simulate: bool) -> CameraResult<Arc<dyn CaptureBackend>> {
    if simulate {
        return Ok(Arc::new(SimulatedBackend::demo()));
    }

    #[cfg(feature = "native")]
    return Ok(Arc::new(
        camera_controller::nokhwa_backend::NokhwaBackend::new(),
    ));

    #[cfg(not(feature = "native"))]
    {
        Err(CameraError::Config(
            "Built without the `native` feature, use --simulate".to_string(),
        ))
    }
}

fn main() -> CameraResult<()> {
    let cli = Cli::parse();
    // A hung camera init must not keep the process alive after the command is done
    block_on_bounded(run(cli), SHUTDOWN_GRACE)?
}

async fn run(cli: Cli) -> CameraResult<()> {
    // Initialize configuration
    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let debug_enabled = cli.debug || settings.debug;
    let log_level = if debug_enabled {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    if debug_enabled {
        debug!("Debug mode enabled");
    }

    let backend = create_backend(cli.simulate)?;
    let store = Arc::new(FileSelectionStore::default_location());
    debug!("Selection stored in {:?}", store.path());
    let registry = start_device_registry(backend.clone(), store, &settings)?;

    let result = match cli.command {
        Commands::List { json } => list_devices(&registry, json).await,
        Commands::Select { id } => select_device(&registry, &id).await,
        Commands::Controls { id } => show_controls(&registry, id, &settings).await,
        Commands::Set {
            control,
            value,
            device,
        } => set_control(&registry, control, value, device, &settings).await,
        Commands::Watch => watch(&registry, backend, &settings).await,
    };

    if let Err(e) = registry.shutdown().await {
        debug!("Registry already stopped: {e}");
    }
    result
}

async fn list_devices(registry: &RegistryHandle, json: bool) -> CameraResult<()> {
    let devices = registry.list_devices().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No cameras found");
        return Ok(());
    }

    for device in devices {
        let marker = if device.selected { "*" } else { " " };
        println!(
            "{marker} {:<36} {:<32} {}",
            device.name, device.unique_id, device.state
        );
    }
    Ok(())
}

async fn select_device(registry: &RegistryHandle, id: &str) -> CameraResult<()> {
    registry.select(id).await?;
    println!("Selected {id}");
    Ok(())
}

async fn resolve_device(registry: &RegistryHandle, id: Option<String>) -> CameraResult<String> {
    match id {
        Some(id) => Ok(id),
        None => registry
            .selected()
            .await?
            .map(|identity| identity.unique_id)
            .ok_or_else(|| CameraError::Device("No camera selected".to_string())),
    }
}

/// Load the controller and turn a failure into an error carrying the guidance.
async fn load_controller(
    registry: &RegistryHandle,
    id: &str,
    settings: &Settings,
) -> CameraResult<()> {
    // Wait a little past the watchdog so the outcome is always decided
    let limit = settings.watchdog_timeout() + Duration::from_millis(500);
    match registry.load_and_wait(id, limit).await? {
        ControllerState::Loaded => Ok(()),
        state @ ControllerState::Failed(_) => {
            eprintln!("Camera controls unavailable: {state}");
            if let Some(guidance) = state.guidance() {
                eprintln!("{guidance}");
            }
            Err(CameraError::Hardware(state.to_string()))
        }
        state => Err(CameraError::Hardware(format!(
            "Controller for {id} did not settle: {state}"
        ))),
    }
}

async fn show_controls(
    registry: &RegistryHandle,
    id: Option<String>,
    settings: &Settings,
) -> CameraResult<()> {
    let id = resolve_device(registry, id).await?;
    load_controller(registry, &id, settings).await?;

    let Some(controller) = registry.controller(&id).await? else {
        return Err(CameraError::Device(format!("{id} has no controller")));
    };

    println!("Controls for {id}:");
    let controller = lock_controller(&controller);
    for control in controller.controls() {
        println!(
            "  {:<14} {:>6}  (range {}..{}, step {}, default {})",
            control.kind.to_string(),
            control.current,
            control.range.min,
            control.range.max,
            control.range.step,
            control.range.default
        );
    }
    Ok(())
}

async fn set_control(
    registry: &RegistryHandle,
    control: ControlKind,
    value: i64,
    device: Option<String>,
    settings: &Settings,
) -> CameraResult<()> {
    let id = resolve_device(registry, device).await?;
    load_controller(registry, &id, settings).await?;

    let Some(controller) = registry.controller(&id).await? else {
        return Err(CameraError::Device(format!("{id} has no controller")));
    };

    let staged = lock_controller(&controller).set_pending(control, value)?;
    if staged != value {
        warn!("{control} value {value} clamped to {staged}");
    }

    // Write synchronously so the process does not exit before the hardware is updated
    let written = tokio::task::spawn_blocking(move || lock_controller(&controller).write_values())
        .await
        .map_err(|e| CameraError::App(format!("Control write task failed: {e}")))??;

    info!("Wrote {written} control values to {id}");
    println!("{control} = {staged}");
    Ok(())
}

async fn watch(
    registry: &RegistryHandle,
    backend: Arc<dyn CaptureBackend>,
    settings: &Settings,
) -> CameraResult<()> {
    let mut events = registry.subscribe();
    let monitor = start_device_monitor(backend, registry.clone(), settings);

    if let Err(e) = registry.ensure_selected_loaded().await {
        warn!("Not loading a controller: {e}");
    }

    println!("Watching for camera changes, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(registry, event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {missed} registry events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    monitor.abort();
    Ok(())
}

async fn print_event(registry: &RegistryHandle, event: RegistryEvent) {
    match event {
        RegistryEvent::DevicesChanged => match registry.list_devices().await {
            Ok(devices) => {
                let names: Vec<String> = devices.into_iter().map(|d| d.name).collect();
                println!("Devices: {}", names.join(", "));
            }
            Err(e) => warn!("Failed to list devices: {e}"),
        },
        RegistryEvent::SelectionChanged { new, .. } => match new {
            Some(identity) => {
                println!("Selected {identity}");
                if let Err(e) = registry.ensure_loaded(&identity.unique_id).await {
                    warn!("Failed to start loading {identity}: {e}");
                }
            }
            None => println!("No camera selected"),
        },
        RegistryEvent::ControllerStateChanged { device, new, .. } => {
            println!("{device}: {new}");
            if let Some(guidance) = new.guidance() {
                println!("  {guidance}");
            }
        }
    }
}
