use crate::chunk_store::ChunkStore;
use crate::config::CacheConfig;
use crate::download::{DownloadJob, JobHooks};
use crate::manager::CacheEntry;
use crate::CacheResult;
use remote_store_lib::{ObjectIdentity, RemoteStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Single-flight registry of download jobs. At most one live job exists per
/// object identity; concurrent readers of the same object attach to it
/// instead of starting their own. The global semaphore caps chunk fetches
/// in flight across all jobs.
pub struct JobScheduler {
    global_limit: Arc<Semaphore>,
    chunk_size: u64,
    workers: usize,
    verify_digest: bool,
    jobs: Mutex<HashMap<ObjectIdentity, Arc<DownloadJob>>>,
}

impl JobScheduler {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            global_limit: Arc::new(Semaphore::new(config.file_cache.max_parallel_downloads)),
            chunk_size: config.download_chunk_bytes(),
            workers: config.workers_per_file(),
            verify_digest: config.file_cache.enable_crc,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live job for the entry's identity, spawning one if none
    /// is active. The registry lock is held across the spawn so two callers
    /// can never start duplicate jobs.
    pub async fn ensure_job(
        &self,
        entry: Arc<CacheEntry>,
        store: Arc<dyn RemoteStore>,
        chunks: Arc<ChunkStore>,
        hooks: Arc<dyn JobHooks>,
    ) -> CacheResult<Arc<DownloadJob>> {
        let identity = entry.identity().clone();
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get(&identity) {
            if job.is_active() {
                return Ok(job.clone());
            }
        }
        let job = DownloadJob::spawn(
            entry,
            store,
            chunks,
            hooks,
            self.chunk_size,
            self.workers,
            self.global_limit.clone(),
            self.verify_digest,
        )
        .await?;
        jobs.insert(identity, job.clone());
        Ok(job)
    }

    pub async fn active_job(&self, identity: &ObjectIdentity) -> Option<Arc<DownloadJob>> {
        let jobs = self.jobs.lock().await;
        jobs.get(identity).filter(|job| job.is_active()).cloned()
    }

    /// Requests cancellation of the identity's job, if one is live.
    pub async fn cancel(&self, identity: &ObjectIdentity) {
        if let Some(job) = self.active_job(identity).await {
            job.cancel();
        }
    }

    /// Drops the identity's job from the registry. Called by the job itself
    /// as it turns terminal; only the registered job ever reaches terminal,
    /// so an unconditional remove cannot drop a replacement.
    pub async fn forget(&self, identity: &ObjectIdentity) {
        self.jobs.lock().await.remove(identity);
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}
