use crate::chunk_store::{write_chunk_at, ChunkStore};
use crate::manager::CacheEntry;
use crate::{CacheError, CacheResult};
use async_trait::async_trait;
use remote_store_lib::{hex_sha256, ObjectIdentity, RemoteStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Integrity(String),
    Transport(String),
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::Integrity(info) => write!(f, "integrity: {}", info),
            JobFailure::Transport(info) => write!(f, "transport: {}", info),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Running,
    Completed,
    Cancelled,
    Failed(JobFailure),
}

/// Snapshot published to waiters. `committed` is the contiguous frontier:
/// every byte below it is on disk and durable for reads. It only moves
/// forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub committed: u64,
    pub phase: JobPhase,
}

enum JobCommand {
    Cancel,
}

/// Accounting callbacks out of the job. The implementor must not call back
/// into job control from these.
#[async_trait]
pub trait JobHooks: Send + Sync {
    async fn on_bytes_committed(&self, entry: &Arc<CacheEntry>, delta: u64);
    async fn on_terminal(&self, identity: &ObjectIdentity);
}

/// One in-flight download of a single object generation. Chunks are fetched
/// by up to `workers` concurrent fetchers and may finish out of order; the
/// committer task writes them at their offsets and advances the frontier
/// only over contiguous bytes.
pub struct DownloadJob {
    identity: ObjectIdentity,
    cmd_tx: mpsc::UnboundedSender<JobCommand>,
    status_rx: watch::Receiver<JobStatus>,
}

impl DownloadJob {
    pub async fn spawn(
        entry: Arc<CacheEntry>,
        store: Arc<dyn RemoteStore>,
        chunks: Arc<ChunkStore>,
        hooks: Arc<dyn JobHooks>,
        chunk_size: u64,
        workers: usize,
        global_limit: Arc<Semaphore>,
        verify_digest: bool,
    ) -> CacheResult<Arc<Self>> {
        let identity = entry.identity().clone();
        let size = entry.object_size();
        // Bytes below the committed frontier survive a cancelled or failed
        // predecessor; restart behind them instead of refetching.
        let start = entry.committed();
        let writer = chunks.create_backing_file(&identity, size).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(JobStatus {
            committed: start,
            phase: JobPhase::Running,
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (result_tx, result_rx) = mpsc::channel(workers.max(1));

        tokio::spawn(dispatch_chunks(
            identity.clone(),
            store,
            start,
            size,
            chunk_size,
            workers,
            global_limit,
            verify_digest,
            cancel_rx,
            result_tx,
        ));
        tokio::spawn(commit_chunks(
            identity.clone(),
            entry,
            writer,
            start,
            size,
            hooks,
            cmd_rx,
            result_rx,
            status_tx,
            cancel_tx,
        ));

        debug!(
            "download job started for {}, size {}, chunk {}, workers {}",
            identity, size, chunk_size, workers
        );
        Ok(Arc::new(Self {
            identity,
            cmd_tx,
            status_rx,
        }))
    }

    pub fn identity(&self) -> &ObjectIdentity {
        &self.identity
    }

    /// Requests cancellation. Returns immediately; the terminal status is
    /// published once in-flight work has been abandoned.
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(JobCommand::Cancel);
    }

    pub fn status(&self) -> JobStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        self.status_rx.borrow().phase == JobPhase::Running
    }
}

async fn fetch_chunk(
    store: &dyn RemoteStore,
    identity: &ObjectIdentity,
    offset: u64,
    length: u64,
    verify_digest: bool,
) -> CacheResult<Vec<u8>> {
    let fetched = store
        .fetch_range(
            &identity.bucket,
            &identity.name,
            identity.generation,
            offset,
            length,
        )
        .await?;
    let mut data = Vec::with_capacity(fetched.length as usize);
    let mut reader = fetched.reader;
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut data)
        .await
        .map_err(|e| CacheError::Transport(format!("chunk body read failed: {}", e)))?;
    if data.len() as u64 != fetched.length {
        return Err(CacheError::Transport(format!(
            "short chunk for {} at {}: want {}, got {}",
            identity,
            offset,
            fetched.length,
            data.len()
        )));
    }
    if verify_digest {
        if let Some(expected) = fetched.digest {
            let actual = hex_sha256(&data);
            if actual != expected {
                return Err(CacheError::ChecksumMismatch(format!(
                    "{} at offset {}: want {}, got {}",
                    identity, offset, expected, actual
                )));
            }
        }
    }
    Ok(data)
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_chunks(
    identity: ObjectIdentity,
    store: Arc<dyn RemoteStore>,
    start: u64,
    size: u64,
    chunk_size: u64,
    workers: usize,
    global_limit: Arc<Semaphore>,
    verify_digest: bool,
    cancel_rx: watch::Receiver<bool>,
    result_tx: mpsc::Sender<(u64, CacheResult<Vec<u8>>)>,
) {
    let local_limit = Arc::new(Semaphore::new(workers.max(1)));
    let mut offset = start;
    while offset < size {
        if *cancel_rx.borrow() {
            return;
        }
        let length = chunk_size.min(size - offset);
        let Ok(local_permit) = local_limit.clone().acquire_owned().await else {
            return;
        };
        let Ok(global_permit) = global_limit.clone().acquire_owned().await else {
            return;
        };
        if *cancel_rx.borrow() {
            return;
        }
        let store = store.clone();
        let identity = identity.clone();
        let result_tx = result_tx.clone();
        tokio::spawn(async move {
            let result =
                fetch_chunk(store.as_ref(), &identity, offset, length, verify_digest).await;
            let _ = result_tx.send((offset, result)).await;
            drop(local_permit);
            drop(global_permit);
        });
        offset += length;
    }
}

#[allow(clippy::too_many_arguments)]
async fn commit_chunks(
    identity: ObjectIdentity,
    entry: Arc<CacheEntry>,
    mut writer: tokio::fs::File,
    start: u64,
    size: u64,
    hooks: Arc<dyn JobHooks>,
    mut cmd_rx: mpsc::UnboundedReceiver<JobCommand>,
    mut result_rx: mpsc::Receiver<(u64, CacheResult<Vec<u8>>)>,
    status_tx: watch::Sender<JobStatus>,
    cancel_tx: watch::Sender<bool>,
) {
    let mut pending: BTreeMap<u64, u64> = BTreeMap::new();
    let mut frontier = start;

    let phase = loop {
        if frontier >= size {
            break JobPhase::Completed;
        }
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(JobCommand::Cancel) | None => break JobPhase::Cancelled,
                }
            }
            result = result_rx.recv() => {
                match result {
                    None => {
                        break JobPhase::Failed(JobFailure::Transport(
                            "fetchers exited before completion".to_string(),
                        ));
                    }
                    Some((offset, Ok(data))) => {
                        let length = data.len() as u64;
                        if let Err(e) = write_chunk_at(&mut writer, offset, &data).await {
                            warn!("commit of {} chunk at {} failed: {}", identity, offset, e);
                            break JobPhase::Failed(JobFailure::Transport(e.to_string()));
                        }
                        hooks.on_bytes_committed(&entry, length).await;
                        pending.insert(offset, length);
                        let mut advanced = false;
                        while let Some(len) = pending.remove(&frontier) {
                            frontier += len;
                            advanced = true;
                        }
                        if advanced {
                            // Readers reach the backing file through their
                            // own descriptor. A write_all may return with
                            // bytes still in the file's internal buffer, so
                            // they must be flushed before the frontier is
                            // visible to anyone.
                            if let Err(e) = writer.flush().await {
                                warn!("flush of {} at {} failed: {}", identity, frontier, e);
                                break JobPhase::Failed(JobFailure::Transport(format!(
                                    "flush failed: {}",
                                    e
                                )));
                            }
                            entry.set_committed(frontier);
                            let _ = status_tx.send(JobStatus {
                                committed: frontier,
                                phase: JobPhase::Running,
                            });
                        }
                        if frontier >= size {
                            break JobPhase::Completed;
                        }
                    }
                    Some((offset, Err(e))) => {
                        warn!("download of {} chunk at {} failed: {}", identity, offset, e);
                        break match e {
                            CacheError::ChecksumMismatch(info) => {
                                JobPhase::Failed(JobFailure::Integrity(info))
                            }
                            other => JobPhase::Failed(JobFailure::Transport(other.to_string())),
                        };
                    }
                }
            }
        }
    };

    // Stop the dispatcher and let straggler fetchers finish into a closed
    // channel. The writer must close synchronously so a successor job can
    // take the backing-file lock; an async drop would release it late.
    let _ = cancel_tx.send(true);
    result_rx.close();
    match writer.try_into_std() {
        Ok(file) => drop(file),
        Err(file) => drop(file),
    }

    match &phase {
        JobPhase::Completed => {
            entry.mark_complete();
            info!("download of {} completed, {} bytes", identity, frontier);
        }
        JobPhase::Cancelled => {
            debug!("download of {} cancelled at {} bytes", identity, frontier);
        }
        JobPhase::Failed(failure) => {
            warn!("download of {} failed at {} bytes: {}", identity, frontier, failure);
        }
        JobPhase::Running => unreachable!(),
    }

    // Deregister before publishing so a waiter that observes the terminal
    // status and immediately retries gets a fresh job.
    hooks.on_terminal(&identity).await;
    let _ = status_tx.send(JobStatus {
        committed: frontier,
        phase,
    });
}
