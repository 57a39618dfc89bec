mod chunk_store;
mod config;
mod download;
mod eviction;
mod manager;
mod metadata_cache;
mod pattern;
mod read_log;
mod scheduler;

#[cfg(test)]
mod test_cache_manager;

pub use chunk_store::ChunkStore;
pub use config::{CacheConfig, FileCacheConfig, MetadataCacheConfig, MIB};
pub use download::{DownloadJob, JobFailure, JobPhase, JobStatus};
pub use manager::{CacheEntry, CacheManager, HandleId, ReadOutcome};
pub use metadata_cache::{CachedMetadata, DirentType, MetadataCache, MetadataKind};
pub use pattern::AccessState;
pub use read_log::{LogSink, MemorySink, ReadRecord, ReadRecordSink};
pub use scheduler::JobScheduler;

use remote_store_lib::StoreError;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("stale generation: {0}")]
    Stale(String),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("cache disabled")]
    CacheDisabled,
    #[error("cache capacity exceeded: {0}")]
    Capacity(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, CacheError::Stale(_))
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(info) => CacheError::NotFound(info),
            StoreError::StaleGeneration(info) => CacheError::Stale(info),
            other => CacheError::Transport(other.to_string()),
        }
    }
}
