//! Audit trail of classification events.
//!
//! Entries accumulate on their group and are handed to a [`HistorySink`] in
//! one batch when the group leaves the engine.

use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::error::Error;
use crate::group::GroupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub group_id: GroupId,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(group_id: GroupId, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            group_id,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only destination for flushed history.
pub trait HistorySink: Send + Sync {
    fn append(&self, entries: &[HistoryEntry]) -> Result<(), Error>;
}

/// Keeps every flushed entry in memory, in flush order.
#[derive(Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn for_group(&self, group_id: GroupId) -> Vec<HistoryEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.group_id == group_id)
            .collect()
    }
}

impl HistorySink for MemoryHistory {
    fn append(&self, entries: &[HistoryEntry]) -> Result<(), Error> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(entries);
        Ok(())
    }
}

/// Writes entries to the log at the matching level.
pub struct TracingHistory;

impl HistorySink for TracingHistory {
    fn append(&self, entries: &[HistoryEntry]) -> Result<(), Error> {
        for entry in entries {
            match entry.severity {
                Severity::Info => info!(group = %entry.group_id, "{}", entry.message),
                Severity::Warning => warn!(group = %entry.group_id, "{}", entry.message),
                Severity::Error => error!(group = %entry.group_id, "{}", entry.message),
            }
        }
        Ok(())
    }
}

/// Appends entries to a CSV file, writing the header when the file is new.
pub struct CsvHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl HistorySink for CsvHistory {
    fn append(&self, entries: &[HistoryEntry]) -> Result<(), Error> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let file_exists = fs::metadata(&self.path).is_ok();

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        let mut wtr = csv::Writer::from_writer(file);

        if !file_exists {
            wtr.write_record(["timestamp", "group", "severity", "message"])?;
        }

        for entry in entries {
            wtr.write_record([
                entry.timestamp.to_rfc3339(),
                entry.group_id.to_string(),
                entry.severity.to_string(),
                entry.message.clone(),
            ])?;
        }

        wtr.flush()?;
        Ok(())
    }
}

/// Forwards every batch to each inner sink. A failing sink does not stop the
/// others; the first error is returned.
pub struct MultiHistory {
    sinks: Vec<Arc<dyn HistorySink>>,
}

impl MultiHistory {
    pub fn new(sinks: Vec<Arc<dyn HistorySink>>) -> Self {
        Self { sinks }
    }
}

impl HistorySink for MultiHistory {
    fn append(&self, entries: &[HistoryEntry]) -> Result<(), Error> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.append(entries) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
