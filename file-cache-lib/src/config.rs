use crate::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MIB: u64 = 1024 * 1024;

pub const DEFAULT_FILE_CACHE_MAX_SIZE_MB: i64 = -1;
pub const DEFAULT_PARALLEL_DOWNLOADS_PER_FILE: usize = 16;
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE_MB: u64 = 50;
pub const DEFAULT_WRITE_BUFFER_SIZE: u64 = 4 * MIB;
pub const DEFAULT_METADATA_TTL_SECS: i64 = 60;
pub const DEFAULT_TYPE_CACHE_MAX_SIZE_MB: i64 = 4;
pub const DEFAULT_STAT_CACHE_MAX_SIZE_MB: i64 = 32;

/// Content-cache knobs. `max_size_mb` follows the -1/0/N convention:
/// -1 means unbounded, 0 disables content caching entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCacheConfig {
    pub max_size_mb: i64,
    pub cache_file_for_range_read: bool,
    pub enable_parallel_downloads: bool,
    pub parallel_downloads_per_file: usize,
    pub max_parallel_downloads: usize,
    pub download_chunk_size_mb: u64,
    pub enable_crc: bool,
    pub write_buffer_size: u64,
    pub enable_o_direct: bool,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: DEFAULT_FILE_CACHE_MAX_SIZE_MB,
            cache_file_for_range_read: false,
            enable_parallel_downloads: false,
            parallel_downloads_per_file: DEFAULT_PARALLEL_DOWNLOADS_PER_FILE,
            max_parallel_downloads: 2 * DEFAULT_PARALLEL_DOWNLOADS_PER_FILE,
            download_chunk_size_mb: DEFAULT_DOWNLOAD_CHUNK_SIZE_MB,
            enable_crc: false,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            enable_o_direct: false,
        }
    }
}

/// Metadata-cache knobs. The TTL is shared by the stat and type namespaces;
/// the byte budgets are not. TTL -1 never expires, TTL 0 disables caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataCacheConfig {
    pub ttl_secs: i64,
    pub type_cache_max_size_mb: i64,
    pub stat_cache_max_size_mb: i64,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_METADATA_TTL_SECS,
            type_cache_max_size_mb: DEFAULT_TYPE_CACHE_MAX_SIZE_MB,
            stat_cache_max_size_mb: DEFAULT_STAT_CACHE_MAX_SIZE_MB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub file_cache: FileCacheConfig,
    pub metadata_cache: MetadataCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::new(),
            file_cache: FileCacheConfig::default(),
            metadata_cache: MetadataCacheConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            ..Default::default()
        }
    }

    /// Rejected combinations are fatal at startup; nothing here is recovered
    /// from at runtime.
    pub fn validate(&self) -> CacheResult<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(CacheError::Configuration(
                "cache_dir must not be empty".to_string(),
            ));
        }
        if self.file_cache.max_size_mb < -1 {
            return Err(CacheError::Configuration(format!(
                "file-cache max_size_mb must be >= -1, got {}",
                self.file_cache.max_size_mb
            )));
        }
        if self.file_cache.download_chunk_size_mb == 0 {
            return Err(CacheError::Configuration(
                "download_chunk_size_mb must be > 0".to_string(),
            ));
        }
        if self.file_cache.parallel_downloads_per_file == 0 {
            return Err(CacheError::Configuration(
                "parallel_downloads_per_file must be > 0".to_string(),
            ));
        }
        if self.file_cache.max_parallel_downloads == 0 {
            return Err(CacheError::Configuration(
                "max_parallel_downloads must be > 0".to_string(),
            ));
        }
        if self.metadata_cache.ttl_secs < -1 {
            return Err(CacheError::Configuration(format!(
                "metadata ttl_secs must be >= -1, got {}",
                self.metadata_cache.ttl_secs
            )));
        }
        if self.metadata_cache.type_cache_max_size_mb < -1 {
            return Err(CacheError::Configuration(format!(
                "type_cache_max_size_mb must be >= -1, got {}",
                self.metadata_cache.type_cache_max_size_mb
            )));
        }
        if self.metadata_cache.stat_cache_max_size_mb < -1 {
            return Err(CacheError::Configuration(format!(
                "stat_cache_max_size_mb must be >= -1, got {}",
                self.metadata_cache.stat_cache_max_size_mb
            )));
        }
        Ok(())
    }

    /// None means unbounded; Some(0) means content caching is disabled.
    pub fn content_budget_bytes(&self) -> Option<u64> {
        match self.file_cache.max_size_mb {
            -1 => None,
            mb => Some(mb as u64 * MIB),
        }
    }

    pub fn download_chunk_bytes(&self) -> u64 {
        self.file_cache.download_chunk_size_mb * MIB
    }

    pub fn workers_per_file(&self) -> usize {
        if self.file_cache.enable_parallel_downloads {
            self.file_cache.parallel_downloads_per_file
        } else {
            1
        }
    }
}
