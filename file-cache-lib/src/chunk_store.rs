use crate::{CacheError, CacheResult};
use fs2::FileExt;
use remote_store_lib::ObjectIdentity;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// On-disk layout for cached object content. Backing files are keyed by the
/// full object identity, so a new generation of the same object lands in a
/// different file and never aliases stale bytes.
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Opens the store root, discarding any content left over from a
    /// previous process. Cached bytes are a pure re-derivable copy of the
    /// remote, so wiping at startup is always safe and avoids trusting
    /// files whose download may have been interrupted.
    pub async fn new(root: &Path) -> CacheResult<Self> {
        if tokio::fs::metadata(root).await.is_ok() {
            tokio::fs::remove_dir_all(root).await.map_err(|e| {
                warn!("purge cache dir {} failed: {}", root.display(), e);
                CacheError::IoError(format!("purge cache dir failed: {}", e))
            })?;
        }
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            warn!("create cache dir {} failed: {}", root.display(), e);
            CacheError::IoError(format!("create cache dir failed: {}", e))
        })?;
        info!("chunk store opened at {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Backing file path for an identity. The key hashes bucket, name and
    /// generation together; the first two hex chars shard the directory so
    /// no single directory grows unbounded.
    pub fn backing_path(&self, identity: &ObjectIdentity) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(identity.to_string().as_bytes());
        let key = hex::encode(hasher.finalize());
        self.root.join(&key[..2]).join(&key)
    }

    /// Creates the backing file preallocated to the object size and returns
    /// a writer holding an exclusive advisory lock. A second writer for the
    /// same identity fails instead of clobbering in-flight bytes.
    pub async fn create_backing_file(
        &self,
        identity: &ObjectIdentity,
        size: u64,
    ) -> CacheResult<File> {
        let path = self.backing_path(identity);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                warn!("create shard dir for {} failed: {}", identity, e);
                CacheError::IoError(format!("create shard dir failed: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .await
            .map_err(|e| {
                warn!("create backing file for {} failed: {}", identity, e);
                CacheError::IoError(format!("create backing file failed: {}", e))
            })?;

        let std_file = file.try_into_std().map_err(|_| {
            CacheError::Internal("backing file has a pending operation".to_string())
        })?;
        std_file.try_lock_exclusive().map_err(|e| {
            warn!("lock backing file for {} failed: {}", identity, e);
            CacheError::Internal(format!("backing file already locked: {}", e))
        })?;
        let file = File::from_std(std_file);

        file.set_len(size).await.map_err(|e| {
            warn!("preallocate backing file for {} failed: {}", identity, e);
            CacheError::IoError(format!("preallocate backing file failed: {}", e))
        })?;
        Ok(file)
    }

    /// Reads `buf.len()` bytes starting at `offset`. The caller is
    /// responsible for only asking for committed ranges; reading past the
    /// committed frontier returns preallocated zeros, not an error.
    pub async fn read_range(
        &self,
        identity: &ObjectIdentity,
        offset: u64,
        buf: &mut [u8],
    ) -> CacheResult<usize> {
        let path = self.backing_path(identity);
        let mut file = File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CacheError::NotFound(format!("no backing file for {}", identity))
            } else {
                warn!("open backing file for {} failed: {}", identity, e);
                CacheError::IoError(format!("open backing file failed: {}", e))
            }
        })?;
        file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
            warn!("seek backing file for {} failed: {}", identity, e);
            CacheError::IoError(format!("seek backing file failed: {}", e))
        })?;
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read(&mut buf[read..]).await.map_err(|e| {
                warn!("read backing file for {} failed: {}", identity, e);
                CacheError::IoError(format!("read backing file failed: {}", e))
            })?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    /// Removes the backing file. Missing files are fine: eviction and
    /// staleness cleanup may race on the same entry.
    pub async fn remove(&self, identity: &ObjectIdentity) -> CacheResult<()> {
        let path = self.backing_path(identity);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("remove backing file for {} failed: {}", identity, e);
                Err(CacheError::IoError(format!(
                    "remove backing file failed: {}",
                    e
                )))
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Writes a chunk at its offset in the backing file.
pub async fn write_chunk_at(file: &mut File, offset: u64, data: &[u8]) -> CacheResult<()> {
    file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
        warn!("seek for chunk write at {} failed: {}", offset, e);
        CacheError::IoError(format!("seek for chunk write failed: {}", e))
    })?;
    file.write_all(data).await.map_err(|e| {
        warn!("chunk write at {} failed: {}", offset, e);
        CacheError::IoError(format!("chunk write failed: {}", e))
    })?;
    Ok(())
}
