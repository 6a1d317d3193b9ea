//! Configuration for the processor load sensor.
//!
//! Loaded from `~/.config/procsense/processor.ron`. Runtime changes go
//! through [`ConfigUpdate`], which only overwrites the fields it carries.

use procsense_core::{SensorError, StorageConfig, StorageKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Active configuration of one processor sensor.
///
/// # Examples
///
/// ```rust
/// use procsense_processor::{ConfigUpdate, ProcessorConfig};
///
/// let mut config = ProcessorConfig::default();
/// config.merge(ConfigUpdate {
///     label: Some("bench".to_owned()),
///     ..ConfigUpdate::default()
/// })?;
/// assert_eq!(config.label, "bench");
/// assert_eq!(config.interval_secs, 10);
/// # Ok::<(), procsense_core::SensorError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessorConfig {
    /// Whether the host should start the sensor at boot
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Emit debug logging
    #[serde(default)]
    pub debug: bool,
    /// Free-form label copied into every sample
    #[serde(default)]
    pub label: String,
    /// Identifier of this device, copied into every sample
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Seconds between samples (minimum 1)
    #[serde(
        default = "default_interval_secs",
        deserialize_with = "validate_interval_secs"
    )]
    pub interval_secs: u64,
    /// Where samples are persisted
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,
}

/// Partial configuration. `None` fields leave the active value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub debug: Option<bool>,
    pub label: Option<String>,
    pub device_id: Option<String>,
    pub interval_secs: Option<u64>,
    pub storage_kind: Option<StorageKind>,
    pub storage_path: Option<PathBuf>,
    pub storage_encryption_key: Option<String>,
    pub storage_host: Option<String>,
}

impl ConfigUpdate {
    /// Update that only changes the label.
    #[must_use]
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    /// Whether the update carries no field at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether the update changes any storage setting.
    #[must_use]
    pub fn touches_storage(&self) -> bool {
        self.storage_kind.is_some()
            || self.storage_path.is_some()
            || self.storage_encryption_key.is_some()
            || self.storage_host.is_some()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_interval_secs() -> u64 {
    ProcessorConfig::DEFAULT_INTERVAL_SECS
}

fn default_storage() -> StorageConfig {
    let path = dirs::data_dir()
        .map(|dir| dir.join("procsense").join("processor"))
        .unwrap_or_else(|| PathBuf::from("processor"));

    StorageConfig {
        kind: StorageKind::JsonLines,
        path,
        encryption_key: None,
        host: None,
    }
}

/// Validate the sampling interval during deserialization.
fn validate_interval_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let interval = u64::deserialize(deserializer)?;
    ProcessorConfig::validate_interval(interval).map_err(serde::de::Error::custom)?;
    Ok(interval)
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            debug: false,
            label: String::new(),
            device_id: default_device_id(),
            interval_secs: Self::DEFAULT_INTERVAL_SECS,
            storage: default_storage(),
        }
    }
}

impl ProcessorConfig {
    /// Default seconds between samples.
    pub const DEFAULT_INTERVAL_SECS: u64 = 10;

    /// Smallest accepted interval.
    pub const MIN_INTERVAL_SECS: u64 = 1;

    /// Interval as a `Duration`.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Check a sampling interval.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the interval is below the minimum.
    pub fn validate_interval(interval_secs: u64) -> Result<(), SensorError> {
        if interval_secs < Self::MIN_INTERVAL_SECS {
            return Err(SensorError::config_with_value(
                format!(
                    "Sampling interval must be at least {}s",
                    Self::MIN_INTERVAL_SECS
                ),
                interval_secs.to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a partial update.
    ///
    /// The whole update is validated before anything is written, so a
    /// rejected update leaves the configuration as it was.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an interval below the minimum or an
    /// empty device id.
    pub fn merge(&mut self, update: ConfigUpdate) -> Result<(), SensorError> {
        if let Some(interval) = update.interval_secs {
            Self::validate_interval(interval)?;
        }
        if update.device_id.as_deref().is_some_and(str::is_empty) {
            return Err(SensorError::config("Device id must not be empty"));
        }

        let ConfigUpdate {
            enabled,
            debug,
            label,
            device_id,
            interval_secs,
            storage_kind,
            storage_path,
            storage_encryption_key,
            storage_host,
        } = update;

        if let Some(enabled) = enabled {
            self.enabled = enabled;
        }
        if let Some(debug) = debug {
            self.debug = debug;
        }
        if let Some(label) = label {
            self.label = label;
        }
        if let Some(device_id) = device_id {
            self.device_id = device_id;
        }
        if let Some(interval_secs) = interval_secs {
            self.interval_secs = interval_secs;
        }
        if let Some(kind) = storage_kind {
            self.storage.kind = kind;
        }
        if let Some(path) = storage_path {
            self.storage.path = path;
        }
        if let Some(key) = storage_encryption_key {
            self.storage.encryption_key = Some(key);
        }
        if let Some(host) = storage_host {
            self.storage.host = Some(host);
        }

        Ok(())
    }

    /// Load configuration from the standard config file location.
    ///
    /// Searches for config in:
    /// 1. ~/.config/procsense/processor.ron
    /// 2. ~/.procsense/processor.ron (fallback)
    ///
    /// Returns default config if no file is found.
    pub fn load() -> Result<Self, SensorError> {
        match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self, SensorError> {
        let content = std::fs::read_to_string(path)?;

        ron::from_str(&content).map_err(|e| {
            SensorError::parse_with_source(
                format!("Failed to parse config file {}", path.display()),
                e,
            )
        })
    }

    /// Find the config file in standard locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let xdg = dirs::config_dir().map(|dir| dir.join("procsense").join("processor.ron"));
        let home = dirs::home_dir().map(|dir| dir.join(".procsense").join("processor.ron"));

        [xdg, home].into_iter().flatten().find(|path| path.exists())
    }

    /// Get the default config file path for writing.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("procsense").join("processor.ron"))
    }

    /// Save configuration to a specific file path.
    pub fn save_to_file(&self, path: &Path) -> Result<(), SensorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| SensorError::parse_with_source("Failed to serialize config", e))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save an example configuration with documentation to a file.
    pub fn save_example_config_to_file(path: &Path) -> Result<(), SensorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r##"// procsense processor sensor configuration
// ========================================
// Copy this to ~/.config/procsense/processor.ron and adjust as needed.
// Command line arguments override these settings.

(
    // Start sampling when the host boots the sensor
    enabled: true,

    // Log every cycle's loads at debug level
    debug: false,

    // Free-form label stored with every sample
    label: "",

    // Identifier stored with every sample (generated for this file)
    device_id: "{device_id}",

    // Seconds between samples, at least 1
    interval_secs: {interval},

    storage: (
        // Options: none, memory, jsonl, sqlite
        kind: jsonl,

        // Directory for jsonl, database file stem for sqlite
        path: "{path}",

        // Not supported by the bundled engines; kept for remote engines
        encryption_key: None,

        // Host the sync transport pushes samples to
        host: None,
    ),
)
"##,
            device_id = default_device_id(),
            interval = Self::DEFAULT_INTERVAL_SECS,
            path = default_storage().path.display().to_string().escape_default(),
        );

        std::fs::write(path, template)?;
        Ok(())
    }
}
