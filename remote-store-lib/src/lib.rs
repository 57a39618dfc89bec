mod http;
mod mem;

pub use http::HttpRemoteStore;
pub use mem::MemRemoteStore;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("stale generation: {0}")]
    StaleGeneration(String),
    #[error("offset too large: {0}")]
    OffsetTooLarge(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
}

impl StoreError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => StoreError::NotFound(info),
            StatusCode::PRECONDITION_FAILED => StoreError::StaleGeneration(info),
            StatusCode::RANGE_NOT_SATISFIABLE => StoreError::OffsetTooLarge(info),
            StatusCode::INTERNAL_SERVER_ERROR => StoreError::Internal(info),
            _ => StoreError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleGeneration(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError(err.to_string())
    }
}

/// Identity of one immutable byte sequence in the remote store. A new write
/// of the same (bucket, name) produces a new generation and invalidates
/// everything cached under the old one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub bucket: String,
    pub name: String,
    pub generation: u64,
}

impl ObjectIdentity {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>, generation: u64) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            generation,
        }
    }

    pub fn object_key(&self) -> (String, String) {
        (self.bucket.clone(), self.name.clone())
    }
}

impl std::fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.bucket, self.name, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    pub size: u64,
    pub generation: u64,
    pub mtime: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_type: Option<String>,
}

pub type RangeReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// One fetched byte range. `digest` is the hex SHA-256 of exactly the bytes
/// the reader will yield, when the store can report one.
pub struct FetchedRange {
    pub reader: RangeReader,
    pub length: u64,
    pub digest: Option<String>,
}

impl std::fmt::Debug for FetchedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedRange")
            .field("length", &self.length)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// Transport boundary to the remote object store. Retries/backoff live below
/// this trait; callers treat a returned error as final for the attempt.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_range(
        &self,
        bucket: &str,
        name: &str,
        generation: u64,
        offset: u64,
        length: u64,
    ) -> StoreResult<FetchedRange>;

    async fn stat_object(&self, bucket: &str, name: &str) -> StoreResult<ObjectAttributes>;
}

pub fn hex_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
