//! Delta engine: turns two snapshots into load percentages and decides
//! whether the cycle crossed a threshold.

use crate::sampler::RawSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;

/// Idle load at or below which the processor counts as stressed.
pub const STRESSED_IDLE_PERCENT: f64 = 10.0;

/// Idle load at or above which the processor counts as relaxed.
pub const RELAXED_IDLE_PERCENT: f64 = 90.0;

/// Field-wise difference between two snapshots (current minus previous).
///
/// Deltas are signed. A healthy counter source only moves forward, but a
/// negative delta is passed through to the percentages unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct LoadDelta {
    pub user: i64,
    pub system: i64,
    pub idle: i64,
}

impl LoadDelta {
    /// Difference `current - previous`, saturating at the `i64` bounds.
    #[must_use]
    pub fn between(previous: &RawSnapshot, current: &RawSnapshot) -> Self {
        let diff = |now: u64, before: u64| {
            let diff = i128::from(now) - i128::from(before);
            i64::try_from(diff).unwrap_or(if diff < 0 { i64::MIN } else { i64::MAX })
        };
        Self {
            user: diff(current.user, previous.user),
            system: diff(current.system, previous.system),
            idle: diff(current.idle, previous.idle),
        }
    }

    /// Sum of the three deltas, the denominator of every percentage.
    /// `None` if the sum overflows.
    #[must_use]
    pub fn total(&self) -> Option<i64> {
        self.user.checked_add(self.system)?.checked_add(self.idle)
    }
}

impl Sub for RawSnapshot {
    type Output = LoadDelta;

    fn sub(self, previous: Self) -> LoadDelta {
        LoadDelta::between(&previous, &self)
    }
}

/// Share of the interval spent in each state, normalised to 100.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct LoadPercentages {
    pub user: f64,
    pub system: f64,
    pub idle: f64,
}

impl LoadPercentages {
    /// Loads reported when nothing can be computed.
    pub const ZERO: Self = Self {
        user: 0.0,
        system: 0.0,
        idle: 0.0,
    };

    /// Normalise a delta. Returns `None` when the deltas sum to zero or
    /// their sum overflows.
    #[must_use]
    pub fn from_delta(delta: &LoadDelta) -> Option<Self> {
        let denom = delta.total().filter(|&denom| denom != 0)?;

        let multiplier = 100.0 / denom as f64;
        Some(Self {
            user: delta.user as f64 * multiplier,
            system: delta.system as f64 * multiplier,
            idle: delta.idle as f64 * multiplier,
        })
    }

    /// Sum of the three loads; about 100 whenever they were computed.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.user + self.system + self.idle
    }
}

/// Discrete notification raised when idle load crosses a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdEvent {
    /// Idle load at or below [`STRESSED_IDLE_PERCENT`].
    Stressed,
    /// Idle load at or above [`RELAXED_IDLE_PERCENT`].
    Relaxed,
}

impl ThresholdEvent {
    /// Classify an idle load. The stressed check runs first.
    #[must_use]
    pub fn classify(idle_load: f64) -> Option<Self> {
        if idle_load <= STRESSED_IDLE_PERCENT {
            Some(Self::Stressed)
        } else if idle_load >= RELAXED_IDLE_PERCENT {
            Some(Self::Relaxed)
        } else {
            None
        }
    }
}

impl fmt::Display for ThresholdEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stressed => write!(f, "stressed"),
            Self::Relaxed => write!(f, "relaxed"),
        }
    }
}

/// Result of one delta engine step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    /// `None` when either snapshot is missing or came from an unreadable
    /// source.
    pub delta: Option<LoadDelta>,
    pub loads: LoadPercentages,
    /// Only set when the loads came from a non-zero denominator.
    pub event: Option<ThresholdEvent>,
}

/// Compare `current` against the previous snapshot of the loop.
///
/// All loads are zero and no threshold event is raised when there is no
/// previous snapshot, when either snapshot is the zero snapshot of an
/// unreadable source, or when the deltas sum to zero.
#[must_use]
pub fn tick(previous: Option<RawSnapshot>, current: RawSnapshot) -> Step {
    let previous = match previous {
        Some(previous) if !previous.is_zero() && !current.is_zero() => previous,
        _ => {
            return Step {
                delta: None,
                loads: LoadPercentages::ZERO,
                event: None,
            }
        }
    };

    let delta = current - previous;
    match LoadPercentages::from_delta(&delta) {
        Some(loads) => Step {
            delta: Some(delta),
            loads,
            event: ThresholdEvent::classify(loads.idle),
        },
        None => Step {
            delta: Some(delta),
            loads: LoadPercentages::ZERO,
            event: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREVIOUS: RawSnapshot = RawSnapshot::new(100, 50, 850);

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_relaxed_scenario() {
        let step = tick(Some(PREVIOUS), RawSnapshot::new(150, 60, 1790));

        assert_eq!(step.delta, Some(LoadDelta { user: 50, system: 10, idle: 940 }));
        assert!(approx(step.loads.user, 5.0));
        assert!(approx(step.loads.system, 1.0));
        assert!(approx(step.loads.idle, 94.0));
        assert_eq!(step.event, Some(ThresholdEvent::Relaxed));
    }

    #[test]
    fn test_stressed_scenario() {
        let step = tick(Some(PREVIOUS), RawSnapshot::new(1000, 900, 900));

        assert_eq!(step.delta.and_then(|d| d.total()), Some(1800));
        assert!((step.loads.idle - 2.78).abs() < 0.01);
        assert_eq!(step.event, Some(ThresholdEvent::Stressed));
    }

    #[test]
    fn test_unchanged_counters_give_zero_loads() {
        let step = tick(Some(PREVIOUS), PREVIOUS);

        assert_eq!(step.loads, LoadPercentages::ZERO);
        assert_eq!(step.event, None);
    }

    #[test]
    fn test_first_cycle_is_zero() {
        let step = tick(None, PREVIOUS);

        assert_eq!(step.delta, None);
        assert_eq!(step.loads, LoadPercentages::ZERO);
        assert_eq!(step.event, None);
    }

    #[test]
    fn test_loads_sum_to_hundred() {
        let currents = [
            RawSnapshot::new(101, 50, 850),
            RawSnapshot::new(333, 777, 1234),
            RawSnapshot::new(100, 51, 10_000),
            RawSnapshot::new(9_999_999, 50, 851),
        ];
        for current in currents {
            let step = tick(Some(PREVIOUS), current);
            assert!((step.loads.total() - 100.0).abs() < 1e-6, "{current:?}");
        }
    }

    #[test]
    fn test_negative_delta_propagates() {
        // Counter went backwards on idle; no special handling.
        let step = tick(Some(PREVIOUS), RawSnapshot::new(200, 100, 800));

        assert_eq!(step.delta, Some(LoadDelta { user: 100, system: 50, idle: -50 }));
        assert!(approx(step.loads.idle, -50.0));
        assert_eq!(step.event, Some(ThresholdEvent::Stressed));
    }

    #[test]
    fn test_unreadable_source_gives_zero_loads() {
        // A failed read after a real one.
        let step = tick(Some(RawSnapshot::new(10, 10, 980)), RawSnapshot::ZERO);
        assert_eq!(step.delta, None);
        assert_eq!(step.loads, LoadPercentages::ZERO);
        assert_eq!(step.event, None);

        // The first read after recovery has nothing to compare against.
        let step = tick(Some(RawSnapshot::ZERO), RawSnapshot::new(150, 60, 1790));
        assert_eq!(step.delta, None);
        assert_eq!(step.loads, LoadPercentages::ZERO);
        assert_eq!(step.event, None);
    }

    #[test]
    fn test_extreme_counters_do_not_overflow() {
        let step = tick(
            Some(RawSnapshot::new(1, 1, 1)),
            RawSnapshot::new(u64::MAX, u64::MAX, 1),
        );
        assert_eq!(
            step.delta,
            Some(LoadDelta { user: i64::MAX, system: i64::MAX, idle: 0 })
        );
        assert_eq!(step.loads, LoadPercentages::ZERO);
        assert_eq!(step.event, None);

        let delta = RawSnapshot::new(1, 2, 2) - RawSnapshot::new(u64::MAX, 1, 1);
        assert_eq!(delta.user, i64::MIN);
        assert_eq!(delta.total(), Some(i64::MIN + 2));
    }

    #[test]
    fn test_classify_bounds() {
        assert_eq!(ThresholdEvent::classify(0.0), Some(ThresholdEvent::Stressed));
        assert_eq!(ThresholdEvent::classify(10.0), Some(ThresholdEvent::Stressed));
        assert_eq!(ThresholdEvent::classify(10.01), None);
        assert_eq!(ThresholdEvent::classify(89.99), None);
        assert_eq!(ThresholdEvent::classify(90.0), Some(ThresholdEvent::Relaxed));
        assert_eq!(ThresholdEvent::classify(100.0), Some(ThresholdEvent::Relaxed));
    }

    #[test]
    fn test_stressed_and_relaxed_are_exclusive() {
        for tenth in 0..=1000 {
            let idle = f64::from(tenth) / 10.0;
            let stressed = idle <= STRESSED_IDLE_PERCENT;
            let relaxed = idle >= RELAXED_IDLE_PERCENT;
            assert!(!(stressed && relaxed));
            assert_eq!(ThresholdEvent::classify(idle).is_some(), stressed || relaxed);
        }
    }
}
