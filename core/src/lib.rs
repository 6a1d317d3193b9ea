//! # procsense-core
//!
//! Core library for the procsense sensor suite. Holds the plumbing every
//! sensor plugin shares so that a plugin only has to provide its sampling
//! logic.
//!
//! ## Features
//!
//! - **Sensor lifecycle** - A small `Stopped`/`Running` state machine behind the [`Sensor`] trait
//! - **Periodic scheduling** - A cooperative tick loop on the tokio runtime ([`schedule`])
//! - **Pluggable storage** - Record persistence through interchangeable engines ([`storage`])
//! - **Logging** - `log` facade with an `env_logger` backend ([`logging`])
//! - **Error handling** - A single error type with context ([`SensorError`])
//!
//! ## Quick Start
//!
//! ```rust
//! use procsense_core::{Sensor, SensorError, SensorState};
//!
//! struct NullSensor {
//!     state: SensorState,
//! }
//!
//! impl Sensor for NullSensor {
//!     type Error = SensorError;
//!
//!     fn name(&self) -> &str {
//!         "null"
//!     }
//!
//!     fn state(&self) -> SensorState {
//!         self.state
//!     }
//!
//!     fn start(&mut self) -> Result<SensorState, Self::Error> {
//!         self.state = SensorState::Running;
//!         Ok(self.state)
//!     }
//!
//!     async fn stop(&mut self) {
//!         self.state = SensorState::Stopped;
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

pub mod logging;
pub mod schedule;
pub mod storage;

pub use schedule::{PeriodicHandle, Tick};
pub use storage::{Engine, Storage, StorageConfig, StorageKind};

/// Lifecycle state of a sensor plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorState {
    /// No timer is armed and no cycle will run.
    #[default]
    Stopped,
    /// The sampling loop is armed.
    Running,
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Trait for all sensor plugins hosted by the suite.
///
/// A sensor is either stopped or running. Starting arms its sampling loop,
/// stopping cancels it. The work done on every timer fire lives behind
/// [`Tick`], which keeps the host lifecycle separate from the sampling logic.
pub trait Sensor {
    /// Error type for sensor operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Get the unique name/identifier for this sensor.
    fn name(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> SensorState;

    /// Check if the sensor is available on this system.
    ///
    /// Default implementation returns `Ok(())`. Sensors should override
    /// this if they have specific system requirements.
    ///
    /// # Errors
    ///
    /// Returns an error if the sensor is not available or supported.
    fn check_availability(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Enter the running state and arm the sampling loop.
    ///
    /// Returns the state the sensor ended up in. A sensor may refuse to run
    /// on a restricted platform, in which case it stays `Stopped` and this
    /// still returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns an error if resources needed by the loop cannot be set up.
    fn start(&mut self) -> Result<SensorState, Self::Error>;

    /// Cancel the sampling loop.
    ///
    /// Safe to call in any state and any number of times. Once the returned
    /// future completes no further cycle runs.
    fn stop(&mut self) -> impl Future<Output = ()> + Send;
}

/// Common error types for sensor operations.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    /// I/O error occurred while reading sensor data.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing sensor data from text format.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of what failed to parse
        message: String,
        /// Optional source error for chaining
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error (invalid settings, etc.).
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration issue
        message: String,
        /// The invalid configuration value if applicable
        value: Option<String>,
    },

    /// Sensor is not available on this system.
    #[error("Sensor unavailable: {reason}")]
    Unavailable {
        /// Reason why the sensor is unavailable
        reason: String,
        /// Whether this is a temporary or permanent condition
        is_temporary: bool,
    },

    /// Permission denied accessing sensor data.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// The resource that couldn't be accessed
        resource: String,
    },

    /// Timeout occurred while reading sensor data.
    #[error("Timeout after {duration:?} while {operation}")]
    Timeout {
        /// How long the operation took before timing out
        duration: std::time::Duration,
        /// Description of what operation timed out
        operation: String,
    },

    /// Invalid data format or unexpected values.
    #[error("Invalid data: {message}")]
    InvalidData {
        /// Description of what makes the data invalid
        message: String,
    },

    /// The storage engine rejected an operation.
    #[error("Storage error: {message}")]
    Storage {
        /// What the engine was doing
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SensorError {
    /// Create a new parse error with a simple message.
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new parse error with a source error.
    pub fn parse_with_source<S: Into<String>, E>(message: S, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Parse {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            value: None,
        }
    }

    /// Create a new configuration error with the invalid value.
    pub fn config_with_value<S: Into<String>, V: Into<String>>(message: S, value: V) -> Self {
        Self::Config {
            message: message.into(),
            value: Some(value.into()),
        }
    }

    /// Create a new unavailable error.
    pub fn unavailable<S: Into<String>>(reason: S) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            is_temporary: false,
        }
    }

    /// Create a new permission denied error.
    pub fn permission_denied<S: Into<String>>(resource: S) -> Self {
        Self::PermissionDenied {
            resource: resource.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(duration: std::time::Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Create a new invalid data error.
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a storage error wrapping the engine's own error.
    pub fn storage<S: Into<String>, E>(message: S, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error represents a temporary condition.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Unavailable { is_temporary, .. } => *is_temporary,
            Self::Timeout { .. } => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for SensorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage("sqlite", err)
    }
}

impl From<serde_json::Error> for SensorError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage("record serialization", err)
    }
}
