//! Notification surface of the processor sensor.
//!
//! Observers are called synchronously from the sampling cycle. Events are
//! broadcast to any number of subscribers. Control signals travel the other
//! way, from the host into the running loop.

use crate::config::ConfigUpdate;
use crate::delta::ThresholdEvent;
use crate::model::LoadSample;
use std::fmt;

/// Callbacks invoked from inside the sampling cycle.
///
/// Implementations should return quickly; the next cycle is not armed until
/// they have.
pub trait LoadObserver: Send + Sync {
    /// Idle load dropped to 10% or below.
    fn on_overloaded(&self);

    /// Idle load rose to 90% or above.
    fn on_idle(&self);

    /// A new sample was recorded.
    fn on_changed(&self, sample: &LoadSample);
}

/// Events broadcast once per cycle, as applicable.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    /// A new sample is available.
    Sample(LoadSample),
    /// Idle load at or below the stressed bound.
    Stressed,
    /// Idle load at or above the relaxed bound.
    Relaxed,
}

impl ProcessorEvent {
    pub const SAMPLE: &'static str = "processor.sample";
    pub const STRESSED: &'static str = "processor.stressed";
    pub const RELAXED: &'static str = "processor.relaxed";

    /// Stable event name for hosts that route by string.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sample(_) => Self::SAMPLE,
            Self::Stressed => Self::STRESSED,
            Self::Relaxed => Self::RELAXED,
        }
    }
}

impl From<ThresholdEvent> for ProcessorEvent {
    fn from(event: ThresholdEvent) -> Self {
        match event {
            ThresholdEvent::Stressed => Self::Stressed,
            ThresholdEvent::Relaxed => Self::Relaxed,
        }
    }
}

impl fmt::Display for ProcessorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signals the host sends into a running sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Replace the label used from the next sample on.
    SetLabel(String),
    /// Flush stored samples and hand them to the sync transport.
    Sync,
    /// Merge a partial configuration.
    Update(ConfigUpdate),
}
