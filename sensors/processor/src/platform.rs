//! Platform gate for reading the aggregate CPU counters.
//!
//! Android restricts `/proc/stat` to system apps from API level 24 on. On
//! those devices the sensor refuses to start instead of producing nothing
//! but zero snapshots.

use std::fmt;

/// First Android API level that restricts `/proc/stat`.
pub const ANDROID_RESTRICTED_API_LEVEL: u32 = 24;

/// What the sensor knows about the platform it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformGate {
    /// Counters readable without restriction.
    Unrestricted,
    /// Android with the given API level.
    Android { api_level: u32 },
}

impl PlatformGate {
    /// Inspect the running platform.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_os = "android")]
        {
            match android_api_level() {
                Some(api_level) => Self::Android { api_level },
                None => {
                    log::warn!("Cannot determine Android API level; assuming restricted");
                    Self::Android {
                        api_level: ANDROID_RESTRICTED_API_LEVEL,
                    }
                }
            }
        }
        #[cfg(not(target_os = "android"))]
        {
            Self::Unrestricted
        }
    }

    /// Gate for a known Android API level.
    #[must_use]
    pub const fn android(api_level: u32) -> Self {
        Self::Android { api_level }
    }

    /// Gate that never restricts.
    #[must_use]
    pub const fn unrestricted() -> Self {
        Self::Unrestricted
    }

    /// Whether the OS forbids reading the counters.
    #[must_use]
    pub const fn is_restricted(&self) -> bool {
        match self {
            Self::Unrestricted => false,
            Self::Android { api_level } => *api_level >= ANDROID_RESTRICTED_API_LEVEL,
        }
    }
}

impl Default for PlatformGate {
    fn default() -> Self {
        Self::detect()
    }
}

impl fmt::Display for PlatformGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrestricted => write!(f, "{}", std::env::consts::OS),
            Self::Android { api_level } => write!(f, "android (API {api_level})"),
        }
    }
}

#[cfg(target_os = "android")]
fn android_api_level() -> Option<u32> {
    let output = std::process::Command::new("getprop")
        .arg("ro.build.version.sdk")
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_android_restriction_threshold() {
        assert!(!PlatformGate::android(23).is_restricted());
        assert!(PlatformGate::android(24).is_restricted());
        assert!(PlatformGate::android(34).is_restricted());
        assert!(!PlatformGate::unrestricted().is_restricted());
    }

    #[cfg(not(target_os = "android"))]
    #[test]
    fn test_detect_off_android() {
        assert_eq!(PlatformGate::detect(), PlatformGate::Unrestricted);
    }

    #[test]
    fn test_display() {
        assert_eq!(PlatformGate::android(26).to_string(), "android (API 26)");
    }
}
