//! The persisted processor load record.

use crate::delta::LoadPercentages;
use crate::sampler::RawSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One sampling cycle's result as handed to storage and observers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoadSample {
    /// Unix epoch milliseconds at which the loads were computed
    pub timestamp: i64,
    pub device_id: String,
    pub label: String,
    /// Operating system the sample was taken on
    pub os: String,
    /// Record schema version
    pub json_version: u32,
    pub last_user_ticks: u64,
    pub last_system_ticks: u64,
    pub last_idle_ticks: u64,
    pub user_load: f64,
    pub system_load: f64,
    pub idle_load: f64,
}

impl LoadSample {
    /// Storage table the samples are written to.
    pub const TABLE_NAME: &'static str = "processor_load";

    /// Current record schema version.
    pub const JSON_VERSION: u32 = 1;

    /// Build a sample stamped with the current time.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        label: impl Into<String>,
        snapshot: &RawSnapshot,
        loads: &LoadPercentages,
    ) -> Self {
        Self::at(
            chrono::Utc::now().timestamp_millis(),
            device_id,
            label,
            snapshot,
            loads,
        )
    }

    /// Build a sample with an explicit timestamp.
    #[must_use]
    pub fn at(
        timestamp: i64,
        device_id: impl Into<String>,
        label: impl Into<String>,
        snapshot: &RawSnapshot,
        loads: &LoadPercentages,
    ) -> Self {
        Self {
            timestamp,
            device_id: device_id.into(),
            label: label.into(),
            os: std::env::consts::OS.to_owned(),
            json_version: Self::JSON_VERSION,
            last_user_ticks: snapshot.user,
            last_system_ticks: snapshot.system,
            last_idle_ticks: snapshot.idle,
            user_load: loads.user,
            system_load: loads.system,
            idle_load: loads.idle,
        }
    }

    /// Loads carried by this sample.
    #[must_use]
    pub fn loads(&self) -> LoadPercentages {
        LoadPercentages {
            user: self.user_load,
            system: self.system_load,
            idle: self.idle_load,
        }
    }

    /// JSON document handed to the storage engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be represented as JSON.
    pub fn to_record(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl fmt::Display for LoadSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(
                f,
                "USER: {}% SYSTEM: {}% IDLE: {}%",
                self.user_load, self.system_load, self.idle_load
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_carries_current_ticks() {
        let snapshot = RawSnapshot::new(150, 60, 1790);
        let loads = LoadPercentages {
            user: 5.0,
            system: 1.0,
            idle: 94.0,
        };
        let sample = LoadSample::at(1_700_000_000_000, "device-1", "desk", &snapshot, &loads);

        assert_eq!(sample.last_user_ticks, 150);
        assert_eq!(sample.last_system_ticks, 60);
        assert_eq!(sample.last_idle_ticks, 1790);
        assert_eq!(sample.loads(), loads);
        assert_eq!(sample.json_version, LoadSample::JSON_VERSION);
    }

    #[test]
    fn test_record_and_display_are_json() {
        let sample = LoadSample::new("d", "l", &RawSnapshot::ZERO, &LoadPercentages::ZERO);
        assert!(sample.timestamp > 0);

        let record = sample.to_record().unwrap();
        assert_eq!(record["device_id"], "d");
        assert_eq!(record["idle_load"], 0.0);

        let parsed: LoadSample = serde_json::from_str(&sample.to_string()).unwrap();
        assert_eq!(parsed, sample);
    }
}
