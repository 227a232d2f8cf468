//! Configuration management for the camera controller.
//!
//! [`Settings`] holds the runtime knobs (timeouts, polling) with environment
//! variable overrides. [`UserConfig`] is the small JSON file that remembers the
//! last selected device across launches, exposed to the registry through the
//! [`SelectionStore`] trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::{CameraError, CameraResult};

const ENV_PREFIX: &str = "CAMERA_CONTROLLER_";

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Advisory timeout raced against controller initialization
    pub race_timeout_ms: u64,
    /// Hard ceiling after which a load still in progress is failed
    pub watchdog_timeout_ms: u64,
    /// How often the device monitor re-enumerates
    pub poll_interval_ms: u64,
    /// Enable debug logging
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            race_timeout_ms: 800,
            watchdog_timeout_ms: 3000,
            poll_interval_ms: 2000,
            debug: false,
        }
    }
}

impl Settings {
    /// Defaults with `CAMERA_CONTROLLER_*` environment overrides applied.
    pub fn new() -> CameraResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults with overrides taken from `lookup`, keyed by full variable name.
    pub fn from_lookup<F>(lookup: F) -> CameraResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(value) = lookup(&format!("{ENV_PREFIX}RACE_TIMEOUT_MS")) {
            settings.race_timeout_ms = parse_var("RACE_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup(&format!("{ENV_PREFIX}WATCHDOG_TIMEOUT_MS")) {
            settings.watchdog_timeout_ms = parse_var("WATCHDOG_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup(&format!("{ENV_PREFIX}POLL_INTERVAL_MS")) {
            settings.poll_interval_ms = parse_var("POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup(&format!("{ENV_PREFIX}DEBUG")) {
            settings.debug = parse_var("DEBUG", &value)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> CameraResult<()> {
        if self.race_timeout_ms == 0 {
            return Err(CameraError::Config(
                "race_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(CameraError::Config(
                "watchdog_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(CameraError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the path to the user config file
    pub fn get_config_path() -> PathBuf {
        // Allow override via environment variable for testing
        if let Ok(config_path_override) = env::var(format!("{ENV_PREFIX}CONFIG_PATH")) {
            return PathBuf::from(config_path_override);
        }

        // Default to ~/.config/camera-controller.json
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("camera-controller.json")
    }
}

fn parse_var<T>(name: &str, value: &str) -> CameraResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| CameraError::Config(format!("Invalid {ENV_PREFIX}{name} '{value}': {e}")))
}

/// User configuration that persists across application restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Unique identifier of the last device the user selected
    pub last_selected_device: Option<String>,
    /// When the selection was saved
    pub saved_at: Option<DateTime<Utc>>,
}

impl UserConfig {
    /// Load from `path`, falling back to defaults when missing or unreadable.
    pub fn load(path: &Path) -> UserConfig {
        if !path.exists() {
            return UserConfig::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<UserConfig>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse user config from {path:?}: {e}");
                    UserConfig::default()
                }
            },
            Err(e) => {
                warn!("Failed to read user config from {path:?}: {e}");
                UserConfig::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> CameraResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;

        debug!("Saved user config to {path:?}");
        Ok(())
    }
}

/// Where the last selected device identifier lives between launches.
pub trait SelectionStore: Send + Sync + 'static {
    fn last_selected(&self) -> Option<String>;

    fn set_last_selected(&self, unique_id: &str) -> CameraResult<()>;
}

/// [`SelectionStore`] backed by the [`UserConfig`] JSON file.
#[derive(Debug, Clone)]
pub struct FileSelectionStore {
    path: PathBuf,
}

impl FileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Self {
        Self::new(Settings::get_config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SelectionStore for FileSelectionStore {
    fn last_selected(&self) -> Option<String> {
        UserConfig::load(&self.path).last_selected_device
    }

    fn set_last_selected(&self, unique_id: &str) -> CameraResult<()> {
        let mut config = UserConfig::load(&self.path);
        config.last_selected_device = Some(unique_id.to_string());
        config.saved_at = Some(Utc::now());
        config.save(&self.path)
    }
}

/// In-process [`SelectionStore`].
#[derive(Debug, Default)]
pub struct MemorySelectionStore {
    value: Mutex<Option<String>>,
}

impl MemorySelectionStore {
    pub fn with_value(unique_id: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(unique_id.into())),
        }
    }

    fn value(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.value.lock().unwrap_or_else(|e| {
            error!("Selection store mutex poisoned: {e}");
            e.into_inner()
        })
    }
}

impl SelectionStore for MemorySelectionStore {
    fn last_selected(&self) -> Option<String> {
        self.value().clone()
    }

    fn set_last_selected(&self, unique_id: &str) -> CameraResult<()> {
        *self.value() = Some(unique_id.to_string());
        Ok(())
    }
}
