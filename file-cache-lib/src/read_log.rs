use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One record per read() call served through the cache manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRecord {
    pub bucket: String,
    pub object: String,
    pub generation: u64,
    pub offset: u64,
    pub length: u64,
    pub is_sequential: bool,
    pub cache_hit: bool,
    pub timestamp_ms: i64,
}

pub trait ReadRecordSink: Send + Sync {
    fn record(&self, record: ReadRecord);
}

/// Emits each record as a JSON line on the log stream.
pub struct LogSink;

impl ReadRecordSink for LogSink {
    fn record(&self, record: ReadRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => info!(target: "read_records", "{}", line),
            Err(e) => warn!("failed to serialize read record: {}", e),
        }
    }
}

/// Collects records in memory, for tests and diagnostics.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<ReadRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ReadRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl ReadRecordSink for MemorySink {
    fn record(&self, record: ReadRecord) {
        self.records.lock().unwrap().push(record);
    }
}
