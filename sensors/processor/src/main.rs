//! procsense-processor: processor load sampling service.
//!
//! Samples processor load at a fixed interval and prints every sample as a
//! JSON line. While running it accepts commands on stdin:
//! `label <text>`, `interval <seconds>`, `sync` and `stop`.

use anyhow::Context;
use clap::Parser;
use procsense_core::{logging, Sensor, SensorState, StorageKind};
use procsense_processor::{
    delta, ConfigUpdate, ControlSignal, GuardedSampler, LoadSample, ProcStatSampler,
    ProcessorConfig, ProcessorEvent, ProcessorSensor, Sampler,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

/// Command-line arguments for the processor sensor.
#[derive(Parser)]
#[command(name = "procsense-processor")]
#[command(about = "Processor load sensor for procsense")]
#[command(version)]
#[command(author)]
struct Args {
    /// Seconds between samples (minimum 1)
    #[arg(short, long, value_parser = validate_interval)]
    interval: Option<u64>,

    /// Label stored with every sample
    #[arg(short, long)]
    label: Option<String>,

    /// Device identifier stored with every sample
    #[arg(long)]
    device_id: Option<String>,

    /// Storage engine (none, memory, jsonl, sqlite)
    #[arg(long)]
    storage: Option<StorageKind>,

    /// Storage directory (jsonl) or database file stem (sqlite)
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// Remote host samples are synced to
    #[arg(long)]
    storage_host: Option<String>,

    /// Statistics file to sample
    #[arg(long, default_value = ProcStatSampler::PROC_STAT_PATH)]
    proc_stat: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// One-shot mode (sample twice one interval apart, print, exit)
    #[arg(short, long)]
    once: bool,

    /// Verify the statistics file is readable on this platform and exit
    #[arg(long)]
    check: bool,

    /// Generate example config file and exit
    #[arg(long)]
    generate_config: bool,

    /// Config file to use instead of the standard location
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    /// Command line overrides, merged over the config file.
    fn update(&self) -> ConfigUpdate {
        ConfigUpdate {
            debug: self.debug.then_some(true),
            label: self.label.clone(),
            device_id: self.device_id.clone(),
            interval_secs: self.interval,
            storage_kind: self.storage,
            storage_path: self.storage_path.clone(),
            storage_host: self.storage_host.clone(),
            ..ConfigUpdate::default()
        }
    }
}

/// Validate that the interval is at least one second.
fn validate_interval(s: &str) -> Result<u64, String> {
    let interval = s
        .parse::<u64>()
        .map_err(|_| "Interval must be a positive integer".to_owned())?;

    ProcessorConfig::validate_interval(interval).map_err(|e| e.to_string())?;
    Ok(interval)
}

/// A line typed on stdin while the sensor runs.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Signal(ControlSignal),
    Stop,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match verb {
        "label" => Some(Command::Signal(ControlSignal::SetLabel(rest.to_owned()))),
        "sync" => Some(Command::Signal(ControlSignal::Sync)),
        "interval" => rest.parse().ok().map(|secs| {
            Command::Signal(ControlSignal::Update(ConfigUpdate {
                interval_secs: Some(secs),
                ..ConfigUpdate::default()
            }))
        }),
        "stop" | "quit" => Some(Command::Stop),
        _ => None,
    }
}

/// Take two snapshots one interval apart and build a single sample.
async fn sample_once(
    sampler: Arc<dyn Sampler>,
    config: &ProcessorConfig,
) -> Result<LoadSample, procsense_core::SensorError> {
    let mut sampler = GuardedSampler::new(sampler);
    let first = sampler.read().await?;
    tokio::time::sleep(config.interval()).await;
    let second = sampler.read().await?;

    let step = delta::tick(Some(first), second);
    Ok(LoadSample::new(
        config.device_id.as_str(),
        config.label.as_str(),
        &second,
        &step.loads,
    ))
}

fn print_sample(sample: &LoadSample) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", serde_json::to_string(sample)?)?;
    stdout.flush()?;
    Ok(())
}

/// Main entry point for the processor sensor.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle config generation
    if args.generate_config {
        let Some(config_path) = ProcessorConfig::default_config_path() else {
            eprintln!("Could not determine config directory");
            process::exit(1);
        };
        ProcessorConfig::save_example_config_to_file(&config_path)?;
        println!("Generated example config at: {}", config_path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => ProcessorConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProcessorConfig::load().unwrap_or_else(|e| {
            eprintln!("Ignoring config file: {e}");
            ProcessorConfig::default()
        }),
    };
    config.merge(args.update())?;
    logging::init(config.debug);

    let sampler = ProcStatSampler::with_path(&args.proc_stat);
    let mut sensor = ProcessorSensor::new(config.clone()).with_sampler(sampler.clone());

    // Check availability if requested
    if args.check {
        match sensor.check_availability() {
            Ok(()) => {
                println!("Processor sensor is available");
                return Ok(());
            }
            Err(e) => {
                eprintln!("Processor sensor is not available: {e}");
                process::exit(1);
            }
        }
    }

    if args.once {
        sensor.check_availability()?;
        let sample = sample_once(Arc::new(sampler), &config).await?;
        print_sample(&sample)?;
        return Ok(());
    }

    if !config.enabled {
        log::info!("Processor sensor disabled in configuration");
        return Ok(());
    }

    let mut events = sensor.subscribe();
    if sensor.start()? == SensorState::Stopped {
        return Ok(());
    }

    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(ProcessorEvent::Sample(sample)) => print_sample(&sample)?,
                Ok(event) => log::info!("{event}"),
                Err(RecvError::Lagged(missed)) => log::warn!("Skipped {missed} events"),
                Err(RecvError::Closed) => break,
            },
            line = commands.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(Command::Stop) => break,
                    Some(Command::Signal(signal)) => {
                        if let Err(e) = sensor.handle(signal) {
                            log::warn!("{e}");
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => log::warn!("Unknown command: {}", line.trim()),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    log::warn!("Cannot read commands from stdin: {e}");
                    stdin_open = false;
                }
            },
        }
    }

    sensor.stop().await;
    Ok(())
}
