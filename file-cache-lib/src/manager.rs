use crate::chunk_store::ChunkStore;
use crate::config::CacheConfig;
use crate::download::{JobFailure, JobHooks, JobPhase};
use crate::eviction::{EvictionIndex, NIL_SLOT};
use crate::metadata_cache::{DirentType, MetadataCache};
use crate::pattern::AccessState;
use crate::read_log::{ReadRecord, ReadRecordSink};
use crate::scheduler::JobScheduler;
use crate::{CacheError, CacheResult};
use async_trait::async_trait;
use remote_store_lib::{ObjectAttributes, ObjectIdentity, RemoteStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type HandleId = u64;

/// One cached object generation. Shared between readers, the eviction
/// index and the download job; all mutable state is atomic so none of the
/// three needs the others' locks to observe it.
pub struct CacheEntry {
    identity: ObjectIdentity,
    object_size: u64,
    committed: AtomicU64,
    disk_bytes: AtomicU64,
    index_bytes: AtomicU64,
    readers: AtomicU32,
    slot: AtomicUsize,
    doomed: AtomicBool,
    complete: AtomicBool,
}

impl CacheEntry {
    pub fn new(identity: ObjectIdentity, object_size: u64) -> Self {
        Self {
            identity,
            object_size,
            committed: AtomicU64::new(0),
            disk_bytes: AtomicU64::new(0),
            index_bytes: AtomicU64::new(0),
            readers: AtomicU32::new(0),
            slot: AtomicUsize::new(NIL_SLOT),
            doomed: AtomicBool::new(false),
            complete: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }

    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Contiguous byte frontier on disk. Monotonic; a restarted job cannot
    /// move it backwards.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn set_committed(&self, frontier: u64) {
        self.committed.fetch_max(frontier, Ordering::SeqCst);
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes.load(Ordering::SeqCst)
    }

    pub fn add_disk_bytes(&self, delta: u64) {
        self.disk_bytes.fetch_add(delta, Ordering::SeqCst);
    }

    /// Bytes this entry has charged against the index total. Touched only
    /// under the index lock; the index subtracts exactly this much when the
    /// entry leaves, never the raw disk count a racing commit may have
    /// grown past it.
    pub fn add_index_bytes(&self, delta: u64) {
        self.index_bytes.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn take_index_bytes(&self) -> u64 {
        self.index_bytes.swap(0, Ordering::SeqCst)
    }

    pub fn reader_count(&self) -> u32 {
        self.readers.load(Ordering::SeqCst)
    }

    fn pin(&self) {
        self.readers.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the remaining reader count.
    fn unpin(&self) -> u32 {
        self.readers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn slot(&self) -> usize {
        self.slot.load(Ordering::SeqCst)
    }

    pub fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct HandleState {
    pattern: AccessState,
    entry: Option<Arc<CacheEntry>>,
}

/// Result of one read through the cache.
#[derive(Debug)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub cache_hit: bool,
    pub is_sequential: bool,
}

/// Read-through content cache over a remote object store.
///
/// Lock order is handles, then entries, then index; no path takes them in
/// any other order. Pinning happens under the entries lock, which is what
/// makes the eviction check-and-remove atomic against new readers.
pub struct CacheManager {
    config: CacheConfig,
    budget: Option<u64>,
    store: Arc<dyn RemoteStore>,
    chunks: Arc<ChunkStore>,
    scheduler: JobScheduler,
    metadata: MetadataCache,
    handles: Mutex<HashMap<HandleId, HandleState>>,
    entries: Mutex<HashMap<(String, String), Arc<CacheEntry>>>,
    index: Mutex<EvictionIndex>,
    next_handle: AtomicU64,
    sink: Arc<dyn ReadRecordSink>,
}

enum Resolved {
    Entry(Arc<CacheEntry>),
    Absent,
    /// The caller asked for an older generation than what is cached; its
    /// view of the object is behind and the store is the authority.
    Behind,
}

impl CacheManager {
    pub async fn new(
        config: CacheConfig,
        store: Arc<dyn RemoteStore>,
        sink: Arc<dyn ReadRecordSink>,
    ) -> CacheResult<Arc<Self>> {
        config.validate()?;
        let chunks = Arc::new(ChunkStore::new(&config.cache_dir).await?);
        let scheduler = JobScheduler::new(&config);
        let metadata = MetadataCache::new(&config.metadata_cache);
        let budget = config.content_budget_bytes();
        Ok(Arc::new(Self {
            config,
            budget,
            store,
            chunks,
            scheduler,
            metadata,
            handles: Mutex::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            index: Mutex::new(EvictionIndex::new()),
            next_handle: AtomicU64::new(1),
            sink,
        }))
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Opens a read handle. Access pattern tracking is per handle.
    pub fn open(&self) -> HandleId {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().insert(id, HandleState::default());
        id
    }

    /// Closes a handle, releasing its pin on the bound entry. If that was
    /// the last reader the entry becomes eligible for cleanup: a doomed
    /// entry loses its backing file, an incomplete one gets its download
    /// cancelled.
    pub async fn close(&self, handle: HandleId) {
        let bound = self
            .handles
            .lock()
            .unwrap()
            .remove(&handle)
            .and_then(|state| state.entry);
        if let Some(entry) = bound {
            self.release(entry).await;
            // Entries skipped while pinned come back around now.
            self.evict_under_budget().await;
        }
    }

    async fn release(&self, entry: Arc<CacheEntry>) {
        if entry.unpin() > 0 {
            return;
        }
        if entry.is_doomed() {
            self.remove_backing_if_unclaimed(entry.identity()).await;
        } else if !entry.is_complete() {
            self.scheduler.cancel(entry.identity()).await;
        }
    }

    /// Deletes the identity's backing file unless a re-admitted entry for
    /// the same identity now owns that path.
    async fn remove_backing_if_unclaimed(&self, identity: &ObjectIdentity) {
        let claimed = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(&identity.object_key())
                .map_or(false, |current| *current.identity() == *identity)
        };
        if !claimed {
            let _ = self.chunks.remove(identity).await;
        }
    }

    /// Object attributes, through the stat namespace of the metadata cache.
    pub async fn stat(&self, bucket: &str, name: &str) -> CacheResult<ObjectAttributes> {
        if let Some(attrs) = self.metadata.get_stat(bucket, name) {
            return Ok(attrs);
        }
        match self.store.stat_object(bucket, name).await {
            Ok(attrs) => {
                self.metadata.put_stat(bucket, name, attrs.clone());
                self.metadata.put_type(bucket, name, DirentType::File);
                Ok(attrs)
            }
            Err(e) if e.is_not_found() => {
                self.metadata.put_type(bucket, name, DirentType::NonExistent);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reads `length` bytes at `offset`, served from cache when the bytes
    /// are already on disk and through a download or a direct store fetch
    /// otherwise. Emits one read record per call.
    pub async fn read(
        self: &Arc<Self>,
        handle: HandleId,
        bucket: &str,
        name: &str,
        attrs: &ObjectAttributes,
        offset: u64,
        length: u64,
    ) -> CacheResult<ReadOutcome> {
        let identity = ObjectIdentity::new(bucket, name, attrs.generation);
        let read_len = offset
            .saturating_add(length)
            .min(attrs.size)
            .saturating_sub(offset);

        let (is_sequential, bound) = {
            let mut handles = self.handles.lock().unwrap();
            let state = handles
                .get_mut(&handle)
                .ok_or_else(|| CacheError::InvalidParam(format!("unknown handle {}", handle)))?;
            let seq = state.pattern.classify(offset, length);
            (seq, state.entry.clone())
        };

        // A binding to another generation, or to a discarded entry with
        // nothing useful on disk, is dead weight; drop it before resolving.
        // A discarded entry that still holds committed bytes is kept: its
        // reader finishes against the local copy it already opened.
        let mut retained: Option<Arc<CacheEntry>> = None;
        if let Some(old) = bound {
            if *old.identity() != identity || (old.is_doomed() && old.committed() == 0) {
                self.unbind(handle, &old);
                self.release(old).await;
            } else if old.is_doomed() {
                retained = Some(old);
            }
        }

        let outcome = self
            .read_inner(
                handle,
                &identity,
                attrs.size,
                offset,
                read_len,
                is_sequential,
                retained,
            )
            .await;

        self.sink.record(ReadRecord {
            bucket: bucket.to_string(),
            object: name.to_string(),
            generation: attrs.generation,
            offset,
            length,
            is_sequential,
            cache_hit: outcome.as_ref().map_or(false, |o| o.cache_hit),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
        outcome
    }

    async fn read_inner(
        self: &Arc<Self>,
        handle: HandleId,
        identity: &ObjectIdentity,
        size: u64,
        offset: u64,
        read_len: u64,
        is_sequential: bool,
        retained: Option<Arc<CacheEntry>>,
    ) -> CacheResult<ReadOutcome> {
        if read_len == 0 {
            return Ok(ReadOutcome {
                data: Vec::new(),
                cache_hit: false,
                is_sequential,
            });
        }
        if self.budget == Some(0) {
            let data = self.fetch_direct(identity, offset, read_len).await?;
            return Ok(ReadOutcome {
                data,
                cache_hit: false,
                is_sequential,
            });
        }

        // A retained superseded entry serves covered ranges from disk and
        // never grows; everything else reads through.
        if let Some(entry) = retained {
            if entry.committed() >= offset + read_len {
                let data = self.read_cached(identity, offset, read_len).await?;
                return Ok(ReadOutcome {
                    data,
                    cache_hit: true,
                    is_sequential,
                });
            }
            let data = self.fetch_direct(identity, offset, read_len).await?;
            return Ok(ReadOutcome {
                data,
                cache_hit: false,
                is_sequential,
            });
        }

        let (resolved, stale) = self.resolve(handle, identity);
        if let Some(old) = stale {
            self.discard_entry(&old).await;
        }

        let target = offset + read_len;
        let entry = match resolved {
            Resolved::Entry(entry) => {
                if entry.committed() >= target {
                    let data = self.read_cached(identity, offset, read_len).await?;
                    self.index.lock().unwrap().touch(&entry);
                    return Ok(ReadOutcome {
                        data,
                        cache_hit: true,
                        is_sequential,
                    });
                }
                Some(entry)
            }
            Resolved::Behind => {
                let data = self.fetch_direct(identity, offset, read_len).await?;
                return Ok(ReadOutcome {
                    data,
                    cache_hit: false,
                    is_sequential,
                });
            }
            Resolved::Absent => None,
        };

        // Random reads do not start or wait for a download unless the
        // range-read policy says so. Any job running for this identity has
        // lost its audience; stop it.
        if !is_sequential && !self.config.file_cache.cache_file_for_range_read {
            self.scheduler.cancel(identity).await;
            let data = self.fetch_direct(identity, offset, read_len).await?;
            return Ok(ReadOutcome {
                data,
                cache_hit: false,
                is_sequential,
            });
        }

        let entry = match entry {
            Some(entry) => entry,
            None => {
                if let Some(budget) = self.budget {
                    if size > budget {
                        warn!(
                            "object {} ({} bytes) exceeds cache budget {}, reading through",
                            identity, size, budget
                        );
                        let data = self.fetch_direct(identity, offset, read_len).await?;
                        return Ok(ReadOutcome {
                            data,
                            cache_hit: false,
                            is_sequential,
                        });
                    }
                }
                self.admit(handle, identity, size)
            }
        };

        let job = self
            .scheduler
            .ensure_job(
                entry.clone(),
                self.store.clone(),
                self.chunks.clone(),
                self.clone() as Arc<dyn JobHooks>,
            )
            .await?;

        let mut status_rx = job.subscribe();
        loop {
            let status = status_rx.borrow_and_update().clone();
            if status.committed >= target {
                break;
            }
            match status.phase {
                JobPhase::Running => {
                    if status_rx.changed().await.is_err() {
                        return Err(CacheError::DownloadFailed(format!(
                            "download of {} ended without a terminal status",
                            identity
                        )));
                    }
                }
                JobPhase::Completed => break,
                JobPhase::Cancelled => {
                    let data = self.fetch_direct(identity, offset, read_len).await?;
                    return Ok(ReadOutcome {
                        data,
                        cache_hit: false,
                        is_sequential,
                    });
                }
                JobPhase::Failed(JobFailure::Integrity(info)) => {
                    // The entry leaves the cache so the failing chunk is
                    // re-fetched next time, never re-served.
                    self.discard_entry(&entry).await;
                    return Err(CacheError::ChecksumMismatch(info));
                }
                JobPhase::Failed(JobFailure::Transport(info)) => {
                    return Err(CacheError::DownloadFailed(info));
                }
            }
        }

        let data = self.read_cached(identity, offset, read_len).await?;
        self.index.lock().unwrap().touch(&entry);
        Ok(ReadOutcome {
            data,
            cache_hit: false,
            is_sequential,
        })
    }

    /// Looks up the live entry for the identity, binding and pinning it to
    /// the handle. A superseded generation comes back in the second slot
    /// for cleanup outside the locks.
    fn resolve(
        &self,
        handle: HandleId,
        identity: &ObjectIdentity,
    ) -> (Resolved, Option<Arc<CacheEntry>>) {
        let key = identity.object_key();
        let mut handles = self.handles.lock().unwrap();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(entry) if *entry.identity() == *identity && !entry.is_doomed() => {
                let entry = entry.clone();
                if let Some(state) = handles.get_mut(&handle) {
                    if state.entry.is_none() {
                        entry.pin();
                        state.entry = Some(entry.clone());
                    }
                }
                (Resolved::Entry(entry), None)
            }
            Some(entry)
                if entry.identity().generation < identity.generation || entry.is_doomed() =>
            {
                let old = entry.clone();
                old.doom();
                entries.remove(&key);
                (Resolved::Absent, Some(old))
            }
            Some(_) => (Resolved::Behind, None),
            None => (Resolved::Absent, None),
        }
    }

    /// Inserts a fresh entry pinned to the handle, or joins one a racing
    /// reader admitted first.
    fn admit(&self, handle: HandleId, identity: &ObjectIdentity, size: u64) -> Arc<CacheEntry> {
        let key = identity.object_key();
        let mut handles = self.handles.lock().unwrap();
        let mut entries = self.entries.lock().unwrap();
        let entry = match entries.get(&key) {
            Some(existing) if *existing.identity() == *identity && !existing.is_doomed() => {
                existing.clone()
            }
            _ => {
                let entry = Arc::new(CacheEntry::new(identity.clone(), size));
                entries.insert(key, entry.clone());
                self.index.lock().unwrap().insert(entry.clone());
                entry
            }
        };
        if let Some(state) = handles.get_mut(&handle) {
            if state.entry.is_none() {
                entry.pin();
                state.entry = Some(entry.clone());
            }
        }
        entry
    }

    fn unbind(&self, handle: HandleId, entry: &Arc<CacheEntry>) {
        let mut handles = self.handles.lock().unwrap();
        if let Some(state) = handles.get_mut(&handle) {
            if state
                .entry
                .as_ref()
                .map_or(false, |bound| Arc::ptr_eq(bound, entry))
            {
                state.entry = None;
            }
        }
    }

    /// Removes the entry from the map and index, cancels its download and
    /// drops its backing file. A pinned entry keeps the file until its last
    /// reader closes; the doomed flag carries the obligation.
    async fn discard_entry(&self, entry: &Arc<CacheEntry>) {
        entry.doom();
        {
            let mut entries = self.entries.lock().unwrap();
            let key = entry.identity().object_key();
            if entries
                .get(&key)
                .map_or(false, |current| Arc::ptr_eq(current, entry))
            {
                entries.remove(&key);
            }
            self.index.lock().unwrap().remove(entry);
        }
        self.scheduler.cancel(entry.identity()).await;
        if entry.reader_count() == 0 {
            self.remove_backing_if_unclaimed(entry.identity()).await;
        }
    }

    async fn read_cached(
        &self,
        identity: &ObjectIdentity,
        offset: u64,
        read_len: u64,
    ) -> CacheResult<Vec<u8>> {
        let mut buf = vec![0u8; read_len as usize];
        let n = self.chunks.read_range(identity, offset, &mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn fetch_direct(
        &self,
        identity: &ObjectIdentity,
        offset: u64,
        read_len: u64,
    ) -> CacheResult<Vec<u8>> {
        let fetched = self
            .store
            .fetch_range(
                &identity.bucket,
                &identity.name,
                identity.generation,
                offset,
                read_len,
            )
            .await?;
        let mut data = Vec::with_capacity(fetched.length as usize);
        let mut reader = fetched.reader;
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut data)
            .await
            .map_err(|e| CacheError::Transport(format!("range body read failed: {}", e)))?;
        Ok(data)
    }

    /// Evicts least-recently-used unpinned entries until the byte total is
    /// within budget. Pinned entries are skipped; close() retries for them.
    async fn evict_under_budget(&self) {
        let Some(budget) = self.budget else {
            return;
        };
        loop {
            let victim = {
                let mut entries = self.entries.lock().unwrap();
                let mut index = self.index.lock().unwrap();
                if index.total_bytes() <= budget {
                    return;
                }
                match index.pop_lru_unpinned() {
                    None => {
                        debug!("cache over budget but every entry is pinned");
                        return;
                    }
                    Some(entry) => {
                        entry.doom();
                        let key = entry.identity().object_key();
                        if entries
                            .get(&key)
                            .map_or(false, |current| Arc::ptr_eq(current, &entry))
                        {
                            entries.remove(&key);
                        }
                        entry
                    }
                }
            };
            info!(
                "evicting {} ({} bytes cached)",
                victim.identity(),
                victim.disk_bytes()
            );
            self.scheduler.cancel(victim.identity()).await;
            let _ = self.chunks.remove(victim.identity()).await;
        }
    }

    /// Drops everything cached for the object: content, stat and type
    /// metadata. Readers pinning the old content keep their local copy
    /// until they close.
    pub async fn invalidate(&self, bucket: &str, name: &str) {
        let entry = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(&(bucket.to_string(), name.to_string()))
                .cloned()
        };
        if let Some(entry) = entry {
            self.discard_entry(&entry).await;
        }
        self.metadata.erase(bucket, name);
    }

    /// Bytes on disk for one object, zero if it is not cached.
    pub fn cached_byte_count(&self, bucket: &str, name: &str) -> u64 {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&(bucket.to_string(), name.to_string()))
            .map_or(0, |entry| entry.disk_bytes())
    }

    pub fn total_cached_bytes(&self) -> u64 {
        self.index.lock().unwrap().total_bytes()
    }

    pub async fn job_count(&self) -> usize {
        self.scheduler.job_count().await
    }
}

#[async_trait]
impl JobHooks for CacheManager {
    async fn on_bytes_committed(&self, entry: &Arc<CacheEntry>, delta: u64) {
        entry.add_disk_bytes(delta);
        self.index.lock().unwrap().add_bytes(entry, delta);
        self.evict_under_budget().await;
    }

    async fn on_terminal(&self, identity: &ObjectIdentity) {
        self.scheduler.forget(identity).await;
    }
}
