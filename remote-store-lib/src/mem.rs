use crate::{
    hex_sha256, FetchedRange, ObjectAttributes, RemoteStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

struct MemObject {
    data: Vec<u8>,
    generation: u64,
    mtime: u64,
}

/// In-memory remote store used by tests and local demos. Generations start
/// at 1 and bump on every overwrite of the same (bucket, name).
pub struct MemRemoteStore {
    objects: Mutex<HashMap<(String, String), MemObject>>,
    fetch_count: AtomicU64,
    corrupt_digests: AtomicBool,
}

impl MemRemoteStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            fetch_count: AtomicU64::new(0),
            corrupt_digests: AtomicBool::new(false),
        }
    }

    /// Stores (or overwrites) an object and returns its new generation.
    pub fn put_object(&self, bucket: &str, name: &str, data: Vec<u8>) -> u64 {
        let mut objects = self.objects.lock().unwrap();
        let key = (bucket.to_string(), name.to_string());
        let generation = objects.get(&key).map(|o| o.generation + 1).unwrap_or(1);
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        objects.insert(
            key,
            MemObject {
                data,
                generation,
                mtime,
            },
        );
        generation
    }

    pub fn remove_object(&self, bucket: &str, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        objects.remove(&(bucket.to_string(), name.to_string()));
    }

    /// Number of fetch_range calls served so far. Tests use this to assert
    /// whether a read went to the remote or was answered locally.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    /// When set, every fetched range reports a digest that does not match
    /// its bytes. Used to exercise checksum validation.
    pub fn set_corrupt_digests(&self, corrupt: bool) {
        self.corrupt_digests.store(corrupt, Ordering::Relaxed);
    }
}

impl Default for MemRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemRemoteStore {
    async fn fetch_range(
        &self,
        bucket: &str,
        name: &str,
        generation: u64,
        offset: u64,
        length: u64,
    ) -> StoreResult<FetchedRange> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.lock().unwrap();
        let key = (bucket.to_string(), name.to_string());
        let object = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", bucket, name)))?;

        if object.generation != generation {
            return Err(StoreError::StaleGeneration(format!(
                "{}/{} generation {} superseded by {}",
                bucket, name, generation, object.generation
            )));
        }

        let total = object.data.len() as u64;
        if offset > total {
            return Err(StoreError::OffsetTooLarge(format!(
                "{}/{} offset {} > size {}",
                bucket, name, offset, total
            )));
        }

        let end = (offset + length).min(total);
        let slice = object.data[offset as usize..end as usize].to_vec();
        let digest = if self.corrupt_digests.load(Ordering::Relaxed) {
            // Flip the first hex digit so the digest never matches.
            let mut d = hex_sha256(&slice);
            let flipped = if d.starts_with('0') { "f" } else { "0" };
            d.replace_range(0..1, flipped);
            Some(d)
        } else {
            Some(hex_sha256(&slice))
        };
        let len = slice.len() as u64;
        Ok(FetchedRange {
            reader: Box::pin(Cursor::new(slice)),
            length: len,
            digest,
        })
    }

    async fn stat_object(&self, bucket: &str, name: &str) -> StoreResult<ObjectAttributes> {
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(&(bucket.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", bucket, name)))?;
        Ok(ObjectAttributes {
            size: object.data.len() as u64,
            generation: object.generation,
            mtime: object.mtime,
            content_type: None,
        })
    }
}
