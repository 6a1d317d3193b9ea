//! Processor load monitoring for procsense.
//!
//! This crate samples the aggregate CPU tick counters from `/proc/stat` at a
//! fixed interval, turns consecutive snapshots into user/system/idle load
//! percentages, persists every sample and raises "stressed" and "relaxed"
//! events when idle load crosses 10% or 90%.
//!
//! # Examples
//!
//! ```rust
//! use procsense_processor::{delta, RawSnapshot, ThresholdEvent};
//!
//! let previous = RawSnapshot::new(100, 50, 850);
//! let current = RawSnapshot::new(150, 60, 1790);
//!
//! let step = delta::tick(Some(previous), current);
//! assert!((step.loads.idle - 94.0).abs() < 1e-9);
//! assert_eq!(step.event, Some(ThresholdEvent::Relaxed));
//! ```

pub mod config;
pub mod delta;
pub mod model;
pub mod observer;
pub mod platform;
pub mod processor;
pub mod sampler;

pub use config::{ConfigUpdate, ProcessorConfig};
pub use delta::{LoadDelta, LoadPercentages, ThresholdEvent};
pub use model::LoadSample;
pub use observer::{ControlSignal, LoadObserver, ProcessorEvent};
pub use platform::PlatformGate;
pub use processor::ProcessorSensor;
pub use sampler::{GuardedSampler, ProcStatSampler, RawSnapshot, Sampler};
