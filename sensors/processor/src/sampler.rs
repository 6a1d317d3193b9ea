//! Raw tick counters from the aggregate CPU line of `/proc/stat`.
//!
//! The first line of `/proc/stat` looks like
//! `cpu  user nice system idle iowait irq softirq ...`, every value a
//! cumulative count of clock ticks since boot. Only user, nice, system and
//! idle are used; nice time is counted as user time.

use procsense_core::SensorError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// One read of the aggregate tick counters.
///
/// All values are cumulative since boot. A snapshot is never mutated; the
/// next read supersedes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RawSnapshot {
    /// User plus nice ticks
    pub user: u64,
    /// Kernel ticks
    pub system: u64,
    /// Idle ticks
    pub idle: u64,
}

impl RawSnapshot {
    /// Snapshot reported when the source cannot be read.
    pub const ZERO: Self = Self {
        user: 0,
        system: 0,
        idle: 0,
    };

    /// Build a snapshot from already combined counters.
    #[must_use]
    pub const fn new(user: u64, system: u64, idle: u64) -> Self {
        Self { user, system, idle }
    }

    /// Whether this is the zero snapshot of an unreadable source.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.user == 0 && self.system == 0 && self.idle == 0
    }

    /// Parse the aggregate CPU line of `/proc/stat`.
    ///
    /// # Errors
    ///
    /// Returns a [`SensorError::Parse`] if the line is not a CPU line, has
    /// fewer than four counters, or a counter is not a number.
    pub fn parse_from_proc_stat_line(line: &str) -> Result<Self, SensorError> {
        let mut fields = line.split_whitespace();

        match fields.next() {
            Some(id) if id.starts_with("cpu") => {}
            _ => return Err(SensorError::parse("Line does not start with a cpu identifier")),
        }

        let values = fields
            .take(4)
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SensorError::parse_with_source("Failed to parse CPU tick counter", e))?;

        let [user, nice, system, idle] = values[..] else {
            return Err(SensorError::parse(format!(
                "Insufficient CPU statistics: expected 4 counters, got {}",
                values.len()
            )));
        };

        Ok(Self {
            user: user.saturating_add(nice),
            system,
            idle,
        })
    }
}

/// Source of raw snapshots.
///
/// Reads may block on the filesystem; the sensor runs them through a
/// [`GuardedSampler`] so they never stall the async runtime.
pub trait Sampler: Send + Sync {
    /// Read the current counters.
    ///
    /// # Errors
    ///
    /// Returns why the source could not be read.
    fn read(&self) -> Result<RawSnapshot, SensorError>;

    /// Verify the source can be read at all.
    ///
    /// # Errors
    ///
    /// Returns why the source is unusable.
    fn check(&self) -> Result<(), SensorError> {
        Ok(())
    }
}

/// Reads the aggregate CPU line from `/proc/stat` (or another path).
#[derive(Debug, Clone)]
pub struct ProcStatSampler {
    path: PathBuf,
}

impl ProcStatSampler {
    /// Path to the kernel statistics file.
    pub const PROC_STAT_PATH: &'static str = "/proc/stat";

    /// Sampler reading the real `/proc/stat`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path(Self::PROC_STAT_PATH)
    }

    /// Sampler reading a different file (useful for testing).
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this sampler reads.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for ProcStatSampler {
    fn read(&self) -> Result<RawSnapshot, SensorError> {
        let line = read_first_line(&self.path)?;
        RawSnapshot::parse_from_proc_stat_line(&line)
    }

    fn check(&self) -> Result<(), SensorError> {
        self.read().map(|_| ())
    }
}

type PendingRead = JoinHandle<Result<RawSnapshot, SensorError>>;

/// Runs a [`Sampler`] on the blocking thread pool with a bounded wait.
///
/// At most one read is outstanding. While a read that timed out is still
/// stuck, later cycles report the zero snapshot instead of starting another.
pub struct GuardedSampler {
    sampler: Arc<dyn Sampler>,
    timeout: Duration,
    stalled: Option<PendingRead>,
}

impl GuardedSampler {
    /// Upper bound on a single read.
    pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

    #[must_use]
    pub fn new(sampler: Arc<dyn Sampler>) -> Self {
        Self {
            sampler,
            timeout: Self::READ_TIMEOUT,
            stalled: None,
        }
    }

    /// Override the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take one snapshot, or [`RawSnapshot::ZERO`] if the source cannot be
    /// read. Failures are logged and never end the caller's loop.
    pub async fn sample(&mut self) -> RawSnapshot {
        match self.read().await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_temporary() => {
                log::warn!("Processor counters not read this cycle: {e}");
                RawSnapshot::ZERO
            }
            Err(e) => {
                log::error!("Cannot read processor counters: {e}");
                RawSnapshot::ZERO
            }
        }
    }

    /// Take one snapshot, reporting why it failed.
    ///
    /// # Errors
    ///
    /// Returns the sampler's own error, a [`SensorError::Timeout`] if the read
    /// exceeds the timeout or an earlier read is still stuck, or
    /// [`SensorError::Unavailable`] if the read panicked.
    pub async fn read(&mut self) -> Result<RawSnapshot, SensorError> {
        if let Some(stalled) = self.stalled.take() {
            if !stalled.is_finished() {
                self.stalled = Some(stalled);
                return Err(SensorError::timeout(
                    self.timeout,
                    "waiting for an earlier counter read",
                ));
            }
        }

        let sampler = Arc::clone(&self.sampler);
        let mut pending = tokio::task::spawn_blocking(move || sampler.read());

        match tokio::time::timeout(self.timeout, &mut pending).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SensorError::unavailable(format!(
                "counter read did not complete: {e}"
            ))),
            Err(_) => {
                self.stalled = Some(pending);
                Err(SensorError::timeout(self.timeout, "reading processor counters"))
            }
        }
    }
}

fn read_first_line(path: &Path) -> Result<String, SensorError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => {
            SensorError::permission_denied(path.display().to_string())
        }
        io::ErrorKind::NotFound => SensorError::unavailable(format!(
            "{} does not exist (not a Linux system?)",
            path.display()
        )),
        _ => SensorError::Io(e),
    })?;

    let mut line = String::new();
    BufReader::new(file).read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(SensorError::invalid_data(format!(
            "Empty {} file",
            path.display()
        )));
    }

    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PROC_STAT: &str = "cpu  4705 356 584 3699 23 23 0 0 0 0\n\
                             cpu0 1393 280 320 905 7 13 0 0 0 0\n\
                             intr 1462898\n";

    fn stat_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_folds_nice_into_user() {
        let snapshot = RawSnapshot::parse_from_proc_stat_line("cpu  100 20 300 400 5 6 7").unwrap();
        assert_eq!(snapshot, RawSnapshot::new(120, 300, 400));
    }

    #[test]
    fn test_parse_minimal_line() {
        let snapshot = RawSnapshot::parse_from_proc_stat_line("cpu 1 2 3 4").unwrap();
        assert_eq!(snapshot, RawSnapshot::new(3, 3, 4));
    }

    #[test]
    fn test_parse_errors() {
        assert!(RawSnapshot::parse_from_proc_stat_line("cpu  1 2 3").is_err());
        assert!(RawSnapshot::parse_from_proc_stat_line("cpu  1 x 3 4").is_err());
        assert!(RawSnapshot::parse_from_proc_stat_line("intr 1 2 3 4").is_err());
        assert!(RawSnapshot::parse_from_proc_stat_line("").is_err());
    }

    #[test]
    fn test_read_from_file() {
        let file = stat_file(PROC_STAT);
        let sampler = ProcStatSampler::with_path(file.path());
        let snapshot = sampler.read().unwrap();
        assert_eq!(snapshot, RawSnapshot::new(5061, 584, 3699));
        assert!(sampler.check().is_ok());
    }

    #[tokio::test]
    async fn test_missing_source_samples_zero() {
        let dir = tempfile::tempdir().unwrap();
        let sampler = ProcStatSampler::with_path(dir.path().join("stat"));

        assert!(matches!(sampler.read(), Err(SensorError::Unavailable { .. })));
        assert!(sampler.check().is_err());

        let mut guarded = GuardedSampler::new(Arc::new(sampler));
        assert_eq!(guarded.sample().await, RawSnapshot::ZERO);
        assert!(guarded.sample().await.is_zero());
    }

    #[tokio::test]
    async fn test_empty_source_samples_zero() {
        let file = stat_file("");
        let sampler = ProcStatSampler::with_path(file.path());

        assert!(matches!(sampler.read(), Err(SensorError::InvalidData { .. })));
        let mut guarded = GuardedSampler::new(Arc::new(sampler));
        assert_eq!(guarded.sample().await, RawSnapshot::ZERO);
    }

    /// Blocks for `delay` on its first read only.
    struct SlowFirstRead {
        reads: AtomicUsize,
        delay: Duration,
    }

    impl Sampler for SlowFirstRead {
        fn read(&self) -> Result<RawSnapshot, SensorError> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(self.delay);
            }
            Ok(RawSnapshot::new(1, 2, 3))
        }
    }

    #[tokio::test]
    async fn test_stuck_read_times_out_without_piling_up() {
        let slow = Arc::new(SlowFirstRead {
            reads: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        let mut guarded =
            GuardedSampler::new(slow.clone()).with_timeout(Duration::from_millis(50));

        assert!(matches!(
            guarded.read().await,
            Err(SensorError::Timeout { .. })
        ));
        assert_eq!(guarded.sample().await, RawSnapshot::ZERO);
        assert_eq!(slow.reads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(guarded.sample().await, RawSnapshot::new(1, 2, 3));
        assert_eq!(slow.reads.load(Ordering::SeqCst), 2);
    }
}
