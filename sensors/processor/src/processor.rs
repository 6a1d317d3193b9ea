//! Processor load sensor: the `Stopped`/`Running` state machine and the
//! sampling cycle it drives.
//!
//! Every cycle samples the counters, runs the delta engine against the
//! previous snapshot, persists the sample, notifies the observer, broadcasts
//! events and then keeps the snapshot for the next cycle. The cycle state is
//! owned by the periodic task alone; the sensor only talks to it through
//! control messages.

use crate::config::{ConfigUpdate, ProcessorConfig};
use crate::delta::{self, ThresholdEvent};
use crate::model::LoadSample;
use crate::observer::{ControlSignal, LoadObserver, ProcessorEvent};
use crate::platform::PlatformGate;
use crate::sampler::{GuardedSampler, ProcStatSampler, RawSnapshot, Sampler};
use procsense_core::storage::EngineBuilder;
use procsense_core::{
    logging, schedule, PeriodicHandle, Sensor, SensorError, SensorState, Storage, Tick,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the event channel before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 64;

/// State owned by the running loop.
struct Cycle {
    config: ProcessorConfig,
    sampler: GuardedSampler,
    storage: Box<dyn Storage>,
    observer: Option<Arc<dyn LoadObserver>>,
    events: broadcast::Sender<ProcessorEvent>,
    last_snapshot: Option<RawSnapshot>,
}

impl Cycle {
    async fn run(&mut self) {
        let current = self.sampler.sample().await;
        let step = delta::tick(self.last_snapshot, current);
        let loads = step.loads;

        log::debug!(
            "USER: {:.2}% SYSTEM: {:.2}% IDLE: {:.2}% Total: {:.2}",
            loads.user,
            loads.system,
            loads.idle,
            loads.total()
        );

        let sample = LoadSample::new(
            self.config.device_id.as_str(),
            self.config.label.as_str(),
            &current,
            &loads,
        );

        let saved = sample
            .to_record()
            .map_err(SensorError::from)
            .and_then(|record| self.storage.save(LoadSample::TABLE_NAME, &record));
        if let Err(e) = saved {
            log::warn!("Failed to store processor sample: {e}");
        }

        if let Some(observer) = &self.observer {
            observer.on_changed(&sample);
        }
        self.emit(ProcessorEvent::Sample(sample));

        if let Some(event) = step.event {
            self.emit(event.into());
            if let Some(observer) = &self.observer {
                match event {
                    ThresholdEvent::Stressed => observer.on_overloaded(),
                    ThresholdEvent::Relaxed => observer.on_idle(),
                }
            }
        }

        self.last_snapshot = Some(current);
    }

    fn emit(&self, event: ProcessorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Tick for Cycle {
    type Control = ControlSignal;

    async fn on_tick(&mut self) {
        self.run().await;
    }

    fn period(&self) -> Duration {
        self.config.interval()
    }

    fn on_control(&mut self, signal: ControlSignal) {
        match signal {
            ControlSignal::SetLabel(label) => self.config.label = label,
            ControlSignal::Sync => {
                if let Err(e) = self.storage.start_sync(LoadSample::TABLE_NAME) {
                    log::warn!("Processor sync failed: {e}");
                }
            }
            ControlSignal::Update(update) => {
                if let Err(e) = self.config.merge(update) {
                    log::warn!("Ignoring configuration update: {e}");
                }
            }
        }
    }
}

/// Samples processor load at a fixed interval.
///
/// # Examples
///
/// ```rust,no_run
/// use procsense_core::Sensor;
/// use procsense_processor::{ProcessorConfig, ProcessorSensor};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), procsense_core::SensorError> {
/// let mut sensor = ProcessorSensor::new(ProcessorConfig::default());
/// let mut events = sensor.subscribe();
///
/// sensor.start()?;
/// if let Ok(event) = events.recv().await {
///     println!("{event}");
/// }
/// sensor.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ProcessorSensor {
    name: String,
    config: ProcessorConfig,
    gate: PlatformGate,
    sampler: Arc<dyn Sampler>,
    read_timeout: Duration,
    storage: Option<Box<dyn Storage>>,
    keep_storage: bool,
    observer: Option<Arc<dyn LoadObserver>>,
    events: broadcast::Sender<ProcessorEvent>,
    running: Option<PeriodicHandle<Cycle>>,
}

impl std::fmt::Debug for ProcessorSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorSensor")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("gate", &self.gate)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ProcessorSensor {
    /// Create a stopped sensor reading `/proc/stat`.
    #[must_use]
    pub fn new(config: ProcessorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: "processor".to_owned(),
            config,
            gate: PlatformGate::detect(),
            sampler: Arc::new(ProcStatSampler::new()),
            read_timeout: GuardedSampler::READ_TIMEOUT,
            storage: None,
            keep_storage: false,
            observer: None,
            events,
            running: None,
        }
    }

    /// Use a different counter source.
    #[must_use]
    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    /// Bound on a single counter read; a slower read yields the zero
    /// snapshot for that cycle.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Use this storage engine instead of building one from the configuration.
    ///
    /// The engine is closed on every stop and reused on the next start.
    #[must_use]
    pub fn with_storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Some(Box::new(storage));
        self.keep_storage = true;
        self
    }

    /// Register the observer notified from every cycle.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn LoadObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Override platform detection.
    #[must_use]
    pub fn with_platform(mut self, gate: PlatformGate) -> Self {
        self.gate = gate;
        self
    }

    /// Receive the events of every following cycle.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.events.subscribe()
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Merge a partial configuration, also into the running loop.
    ///
    /// Label changes apply from the next sample on; interval changes from
    /// the next time the timer is armed. Storage settings are only read when
    /// the engine is opened, so they take effect on the next start.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the update is invalid; nothing is
    /// changed in that case.
    pub fn configure(&mut self, update: ConfigUpdate) -> Result<(), SensorError> {
        if update.is_empty() {
            return Ok(());
        }

        let debug_before = self.config.debug;
        self.config.merge(update.clone())?;

        if self.running.is_some() && update.touches_storage() {
            log::info!("Storage settings updated; they apply from the next start");
        }

        if self.config.debug != debug_before {
            logging::apply_debug(self.config.debug);
        }
        self.forward(ControlSignal::Update(update));
        Ok(())
    }

    /// Change the label stamped on following samples.
    pub fn set_label(&mut self, label: impl Into<String>) {
        let label = label.into();
        self.config.label.clone_from(&label);
        self.forward(ControlSignal::SetLabel(label));
    }

    /// Ask the storage engine to flush and sync stored samples.
    ///
    /// Does nothing while stopped, since no engine is open.
    pub fn sync(&mut self) {
        if self.running.is_none() {
            log::debug!("Sync requested while stopped; nothing to do");
            return;
        }
        self.forward(ControlSignal::Sync);
    }

    /// Dispatch a control signal received from the host.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid [`ControlSignal::Update`].
    pub fn handle(&mut self, signal: ControlSignal) -> Result<(), SensorError> {
        match signal {
            ControlSignal::SetLabel(label) => self.set_label(label),
            ControlSignal::Sync => self.sync(),
            ControlSignal::Update(update) => self.configure(update)?,
        }
        Ok(())
    }

    /// Merge `update` into the configuration and start.
    ///
    /// # Errors
    ///
    /// Returns an error if the update is invalid or [`Sensor::start`] fails.
    pub fn start_with(&mut self, update: ConfigUpdate) -> Result<SensorState, SensorError> {
        self.configure(update)?;
        self.start()
    }

    fn forward(&self, signal: ControlSignal) {
        if let Some(handle) = &self.running {
            if !handle.control(signal) {
                log::warn!("Processor loop is gone; control signal dropped");
            }
        }
    }
}

impl Sensor for ProcessorSensor {
    type Error = SensorError;

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SensorState {
        if self.running.is_some() {
            SensorState::Running
        } else {
            SensorState::Stopped
        }
    }

    fn check_availability(&self) -> Result<(), Self::Error> {
        if self.gate.is_restricted() {
            return Err(SensorError::unavailable(format!(
                "reading processor counters is not permitted on {}",
                self.gate
            )));
        }

        self.sampler.check()
    }

    fn start(&mut self) -> Result<SensorState, Self::Error> {
        if let Some(handle) = &self.running {
            if !handle.is_finished() {
                log::debug!("Processor sensor already running");
                return Ok(SensorState::Running);
            }
            log::warn!("Processor loop ended unexpectedly; starting a new one");
            self.running = None;
        }

        if self.gate.is_restricted() {
            log::info!(
                "Processor counters are not readable on {}; sensor stays stopped",
                self.gate
            );
            return Ok(SensorState::Stopped);
        }

        tokio::runtime::Handle::try_current()
            .map_err(|_| SensorError::unavailable("processor sensor needs a tokio runtime"))?;

        let storage = match self.storage.take() {
            Some(storage) => storage,
            None => EngineBuilder::from_config(&self.config.storage).build()?,
        };
        let sampler =
            GuardedSampler::new(Arc::clone(&self.sampler)).with_timeout(self.read_timeout);

        let cycle = Cycle {
            config: self.config.clone(),
            sampler,
            storage,
            observer: self.observer.clone(),
            events: self.events.clone(),
            last_snapshot: None,
        };

        self.running = Some(schedule::spawn(cycle));
        log::info!("Processor sensor active: {}s", self.config.interval_secs);

        Ok(SensorState::Running)
    }

    async fn stop(&mut self) {
        let Some(handle) = self.running.take() else {
            return;
        };

        if let Some(cycle) = handle.cancel().await {
            let mut storage = cycle.storage;
            if let Err(e) = storage.close() {
                log::warn!("Failed to close processor storage: {e}");
            }
            if self.keep_storage {
                self.storage = Some(storage);
            }
        }

        log::info!("Processor sensor terminated");
    }
}
