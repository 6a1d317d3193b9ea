//! Pluggable record storage for sensor samples.
//!
//! Sensors hand finished records to a [`Storage`] keyed by a table name and
//! never care which engine sits behind it. Engines are built from a
//! [`StorageConfig`] through [`Engine::builder`].
//!
//! # Examples
//!
//! ```rust
//! use procsense_core::{Engine, StorageKind};
//!
//! let mut storage = Engine::builder().kind(StorageKind::Memory).build()?;
//! storage.save("samples", &serde_json::json!({ "timestamp": 1, "value": 2 }))?;
//! storage.start_sync("samples")?;
//! # Ok::<(), procsense_core::SensorError>(())
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SensorError;

/// A sink that persists records and can be asked to sync them.
pub trait Storage: Send {
    /// Persist one record into `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot write the record.
    fn save(&mut self, table: &str, record: &Value) -> Result<(), SensorError>;

    /// Flush `table` and hand it to the sync transport if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the local flush fails.
    fn start_sync(&mut self, table: &str) -> Result<(), SensorError>;

    /// Flush everything and release the engine's resources.
    ///
    /// # Errors
    ///
    /// Returns an error if pending records cannot be flushed.
    fn close(&mut self) -> Result<(), SensorError>;
}

/// Which engine backs a sensor's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Records are dropped.
    None,
    /// Records are kept in process memory.
    Memory,
    /// One JSON document per line, one file per table.
    #[default]
    #[serde(rename = "jsonl")]
    JsonLines,
    /// SQLite database, one SQL table per record table.
    Sqlite,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Memory => write!(f, "memory"),
            Self::JsonLines => write!(f, "jsonl"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = StorageKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "memory" | "mem" => Ok(Self::Memory),
            "jsonl" | "json" | "jsonlines" => Ok(Self::JsonLines),
            "sqlite" | "db" => Ok(Self::Sqlite),
            _ => Err(StorageKindParseError {
                input: s.to_owned(),
            }),
        }
    }
}

/// Error returned when parsing an invalid storage kind.
#[derive(Debug, thiserror::Error)]
#[error("Invalid storage kind '{input}'. Valid options: none, memory, jsonl, sqlite")]
pub struct StorageKindParseError {
    input: String,
}

/// Storage settings carried in a sensor's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Engine selector
    #[serde(default)]
    pub kind: StorageKind,
    /// Directory (jsonl) or database file stem (sqlite)
    pub path: PathBuf,
    /// Encryption key for engines that support it
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Remote host the sync transport pushes to
    #[serde(default)]
    pub host: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            path: PathBuf::from("procsense"),
            encryption_key: None,
            host: None,
        }
    }
}

/// Entry point for constructing storage engines.
#[derive(Debug)]
pub struct Engine;

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }
}

/// Builder collecting the engine settings.
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: StorageConfig,
}

impl EngineBuilder {
    /// Start from an existing storage configuration.
    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Set the engine kind.
    #[must_use]
    pub fn kind(mut self, kind: StorageKind) -> Self {
        self.config.kind = kind;
        self
    }

    /// Set the storage location.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the remote sync host.
    #[must_use]
    pub fn host(mut self, host: Option<String>) -> Self {
        self.config.host = host;
        self
    }

    /// Set the encryption key.
    #[must_use]
    pub fn encryption_key(mut self, key: Option<String>) -> Self {
        self.config.encryption_key = key;
        self
    }

    /// Build the configured engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage location cannot be created or opened.
    pub fn build(self) -> Result<Box<dyn Storage>, SensorError> {
        let StorageConfig {
            kind,
            path,
            encryption_key,
            host,
        } = self.config;

        if encryption_key.is_some() && kind != StorageKind::None {
            log::warn!("{kind} storage does not support encryption; the configured key is ignored");
        }

        let storage: Box<dyn Storage> = match kind {
            StorageKind::None => Box::new(NullStorage),
            StorageKind::Memory => Box::new(MemoryStorage::new()),
            StorageKind::JsonLines => Box::new(JsonLinesStorage::open(path, host)?),
            StorageKind::Sqlite => Box::new(SqliteStorage::open(&path, host)?),
        };

        Ok(storage)
    }
}

fn hand_off(table: &str, host: Option<&str>) {
    match host {
        Some(host) => log::info!("Sync of '{table}' handed to {host}"),
        None => log::debug!("Sync of '{table}' requested without a remote host"),
    }
}

/// Engine that drops everything.
#[derive(Debug, Default)]
pub struct NullStorage;

impl Storage for NullStorage {
    fn save(&mut self, table: &str, _record: &Value) -> Result<(), SensorError> {
        log::trace!("Dropping record for '{table}'");
        Ok(())
    }

    fn start_sync(&mut self, _table: &str) -> Result<(), SensorError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SensorError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    records: HashMap<String, Vec<Value>>,
    syncs: Vec<String>,
    closed: bool,
}

/// In-process engine. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryTables>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryTables) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Records saved into `table`, oldest first.
    #[must_use]
    pub fn records(&self, table: &str) -> Vec<Value> {
        self.with(|t| t.records.get(table).cloned().unwrap_or_default())
    }

    /// Tables a sync was requested for, in request order.
    #[must_use]
    pub fn syncs(&self) -> Vec<String> {
        self.with(|t| t.syncs.clone())
    }

    /// Whether [`Storage::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.with(|t| t.closed)
    }
}

impl Storage for MemoryStorage {
    fn save(&mut self, table: &str, record: &Value) -> Result<(), SensorError> {
        self.with(|t| {
            t.records
                .entry(table.to_owned())
                .or_default()
                .push(record.clone());
        });
        Ok(())
    }

    fn start_sync(&mut self, table: &str) -> Result<(), SensorError> {
        self.with(|t| t.syncs.push(table.to_owned()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), SensorError> {
        self.with(|t| t.closed = true);
        Ok(())
    }
}

/// Appends records as JSON lines to `<dir>/<table>.jsonl`.
#[derive(Debug)]
pub struct JsonLinesStorage {
    dir: PathBuf,
    host: Option<String>,
    writers: HashMap<String, BufWriter<File>>,
}

impl JsonLinesStorage {
    /// Open (and create if needed) the storage directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, host: Option<String>) -> Result<Self, SensorError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            host,
            writers: HashMap::new(),
        })
    }

    /// File holding the records of `table`.
    #[must_use]
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.jsonl"))
    }

    fn writer(&mut self, table: &str) -> Result<&mut BufWriter<File>, SensorError> {
        validate_table_name(table)?;
        if !self.writers.contains_key(table) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.table_path(table))?;
            self.writers.insert(table.to_owned(), BufWriter::new(file));
        }
        self.writers
            .get_mut(table)
            .ok_or_else(|| SensorError::invalid_data(format!("no writer for table '{table}'")))
    }
}

impl Storage for JsonLinesStorage {
    fn save(&mut self, table: &str, record: &Value) -> Result<(), SensorError> {
        let line = serde_json::to_string(record)?;
        let writer = self.writer(table)?;
        writeln!(writer, "{line}")?;
        Ok(())
    }

    fn start_sync(&mut self, table: &str) -> Result<(), SensorError> {
        if let Some(writer) = self.writers.get_mut(table) {
            writer.flush()?;
        }
        hand_off(table, self.host.as_deref());
        Ok(())
    }

    fn close(&mut self) -> Result<(), SensorError> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        self.writers.clear();
        Ok(())
    }
}

/// Stores records in SQLite, one row per record with the JSON in `data`.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
    host: Option<String>,
    tables: HashSet<String>,
    in_memory: bool,
}

impl SqliteStorage {
    /// Location that keeps the database in memory.
    pub const IN_MEMORY: &'static str = ":memory:";

    /// Open `<path>.db`, or an in-memory database for [`Self::IN_MEMORY`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: &Path, host: Option<String>) -> Result<Self, SensorError> {
        let in_memory = path.as_os_str() == Self::IN_MEMORY;
        let conn = if in_memory {
            Connection::open_in_memory()?
        } else {
            let file = path.with_extension("db");
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&file)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            log::debug!("Opened {} (journal_mode={mode})", file.display());
            conn
        };

        Ok(Self {
            conn,
            host,
            tables: HashSet::new(),
            in_memory,
        })
    }

    fn ensure_table(&mut self, table: &str) -> Result<(), SensorError> {
        if self.tables.contains(table) {
            return Ok(());
        }
        validate_table_name(table)?;
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    data TEXT NOT NULL
                )"
            ),
            [],
        )?;
        self.tables.insert(table.to_owned());
        Ok(())
    }

    /// Number of rows stored in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table name is invalid or the query fails.
    pub fn count(&self, table: &str) -> Result<u64, SensorError> {
        validate_table_name(table)?;
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(0);
        }
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl Storage for SqliteStorage {
    fn save(&mut self, table: &str, record: &Value) -> Result<(), SensorError> {
        self.ensure_table(table)?;
        let timestamp = record.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
        let data = serde_json::to_string(record)?;
        self.conn.execute(
            &format!("INSERT INTO {table} (timestamp, data) VALUES (?1, ?2)"),
            params![timestamp, data],
        )?;
        Ok(())
    }

    fn start_sync(&mut self, table: &str) -> Result<(), SensorError> {
        if !self.in_memory {
            self.conn
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }
        hand_off(table, self.host.as_deref());
        Ok(())
    }

    fn close(&mut self) -> Result<(), SensorError> {
        if !self.in_memory {
            self.conn
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }
        Ok(())
    }
}

/// Table names end up in file names and SQL, so keep them to `[A-Za-z0-9_]`.
fn validate_table_name(table: &str) -> Result<(), SensorError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SensorError::config_with_value("Invalid table name", table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_storage_kind_parse() {
        assert_eq!("jsonl".parse::<StorageKind>().unwrap(), StorageKind::JsonLines);
        assert_eq!("SQLite".parse::<StorageKind>().unwrap(), StorageKind::Sqlite);
        assert_eq!("none".parse::<StorageKind>().unwrap(), StorageKind::None);
        assert_eq!("mem".parse::<StorageKind>().unwrap(), StorageKind::Memory);
        assert!("realm".parse::<StorageKind>().is_err());
        assert_eq!(StorageKind::JsonLines.to_string(), "jsonl");
    }

    #[test]
    fn test_memory_storage_shares_tables() {
        let shared = MemoryStorage::new();
        let mut storage: Box<dyn Storage> = Box::new(shared.clone());

        storage.save("processorData", &json!({ "timestamp": 1 })).unwrap();
        storage.save("processorData", &json!({ "timestamp": 2 })).unwrap();
        storage.start_sync("processorData").unwrap();
        storage.close().unwrap();

        let records = shared.records("processorData");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["timestamp"], 2);
        assert_eq!(shared.syncs(), vec!["processorData".to_owned()]);
        assert!(shared.is_closed());
        assert!(shared.records("other").is_empty());
    }

    #[test]
    fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonLinesStorage::open(dir.path().join("data"), None).unwrap();

        storage.save("processorData", &json!({ "timestamp": 1, "idle_load": 94.0 })).unwrap();
        storage.save("processorData", &json!({ "timestamp": 2, "idle_load": 3.5 })).unwrap();
        storage.start_sync("processorData").unwrap();

        let content = fs::read_to_string(storage.table_path("processorData")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["timestamp"], 2);

        storage.close().unwrap();
    }

    #[test]
    fn test_jsonl_rejects_bad_table_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonLinesStorage::open(dir.path(), None).unwrap();
        assert!(storage.save("../escape", &json!({})).is_err());
        assert!(storage.save("", &json!({})).is_err());
    }

    #[test]
    fn test_sqlite_in_memory() {
        let mut storage =
            SqliteStorage::open(Path::new(SqliteStorage::IN_MEMORY), Some("sync.example".into()))
                .unwrap();
        assert_eq!(storage.count("processorData").unwrap(), 0);

        storage.save("processorData", &json!({ "timestamp": 10 })).unwrap();
        storage.save("processorData", &json!({ "timestamp": 20 })).unwrap();
        storage.start_sync("processorData").unwrap();

        assert_eq!(storage.count("processorData").unwrap(), 2);
        assert!(storage.save("drop table", &json!({})).is_err());
    }

    #[test]
    fn test_sqlite_file_via_builder() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("nested").join("processor");
        let mut storage = Engine::builder()
            .kind(StorageKind::Sqlite)
            .path(&stem)
            .build()
            .unwrap();

        storage.save("processorData", &json!({ "timestamp": 5 })).unwrap();
        storage.start_sync("processorData").unwrap();
        storage.close().unwrap();

        assert!(stem.with_extension("db").exists());
    }

    #[test]
    fn test_sqlite_count_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("processor");

        let mut storage = SqliteStorage::open(&stem, None).unwrap();
        storage.save("processorData", &json!({ "timestamp": 1 })).unwrap();
        storage.save("processorData", &json!({ "timestamp": 2 })).unwrap();
        storage.close().unwrap();
        drop(storage);

        let reopened = SqliteStorage::open(&stem, None).unwrap();
        assert_eq!(reopened.count("processorData").unwrap(), 2);
        assert_eq!(reopened.count("other").unwrap(), 0);
    }

    #[test]
    fn test_builder_from_config_null_engine() {
        let config = StorageConfig {
            kind: StorageKind::None,
            ..StorageConfig::default()
        };
        let mut storage = EngineBuilder::from_config(&config).build().unwrap();
        storage.save("anything", &json!({ "x": 1 })).unwrap();
        storage.close().unwrap();
    }
}
