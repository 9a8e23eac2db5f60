use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// One executed retrieval, kept for a configured horizon and then purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub sequence: u64,
    pub tenant: String,
    pub user: String,
    pub sanitized_query: String,
    #[serde(default)]
    pub options: serde_json::Value,
    pub latency_ms: u64,
    pub result_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl QueryRecord {
    pub fn new(
        tenant: impl Into<String>,
        user: impl Into<String>,
        sanitized_query: impl Into<String>,
        latency_ms: u64,
        result_count: usize,
    ) -> Self {
        Self {
            sequence: 0,
            tenant: tenant.into(),
            user: user.into(),
            sanitized_query: sanitized_query.into(),
            options: serde_json::Value::Null,
            latency_ms,
            result_count,
            timestamp: Utc::now(),
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("record sink lock poisoned")]
    LockPoisoned,
    #[error("record io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait RecordSink: Send + Sync {
    fn record(&self, record: QueryRecord) -> Result<(), AnalyticsError>;
}

#[derive(Default)]
pub struct InMemoryRecordSink {
    records: Mutex<Vec<QueryRecord>>,
    sequence: AtomicU64,
}

impl InMemoryRecordSink {
    pub fn records(&self) -> Result<Vec<QueryRecord>, AnalyticsError> {
        let records = self
            .records
            .lock()
            .map_err(|_| AnalyticsError::LockPoisoned)?;
        Ok(records.clone())
    }

    /// Drop records older than the retention horizon. Returns how many
    /// were purged.
    pub fn purge_older_than(&self, horizon: Duration) -> Result<usize, AnalyticsError> {
        let cutoff = Utc::now() - horizon;
        let mut records = self
            .records
            .lock()
            .map_err(|_| AnalyticsError::LockPoisoned)?;
        let before = records.len();
        records.retain(|record| record.timestamp >= cutoff);
        Ok(before - records.len())
    }
}

impl RecordSink for InMemoryRecordSink {
    fn record(&self, mut record: QueryRecord) -> Result<(), AnalyticsError> {
        let next = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        record.sequence = next;
        let mut records = self
            .records
            .lock()
            .map_err(|_| AnalyticsError::LockPoisoned)?;
        records.push(record);
        Ok(())
    }
}

pub struct JsonlRecordSink {
    writer: Mutex<std::fs::File>,
    sequence: AtomicU64,
}

impl JsonlRecordSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AnalyticsError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        Ok(Self {
            writer: Mutex::new(writer),
            sequence: AtomicU64::new(0),
        })
    }
}

impl RecordSink for JsonlRecordSink {
    fn record(&self, mut record: QueryRecord) -> Result<(), AnalyticsError> {
        let next = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        record.sequence = next;

        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock().map_err(|_| AnalyticsError::LockPoisoned)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
