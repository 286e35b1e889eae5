use async_trait::async_trait;
use fs2::FileExt;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{BackupError, BackupResult, BlockHash, Store};

const BLOCK_TMP_EXT: &str = "tmp";

/// Durable storage of block payloads, addressed by content hash.
#[async_trait]
pub trait BlockSink: Send {
    /// Persist the payload of a novel block. Durable before return;
    /// idempotent per hash.
    async fn put_block(&mut self, hash: &BlockHash, data: &[u8]) -> BackupResult<()>;

    async fn flush(&mut self) -> BackupResult<()>;
}

/// File-per-block sink: `<output_dir>/<hex(hash)>`, written through a
/// locked `.tmp` file and renamed into place.
pub struct DirectorySink {
    output_dir: PathBuf,
}

impl DirectorySink {
    pub async fn new(output_dir: impl AsRef<Path>) -> BackupResult<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir).await.map_err(|e| {
            BackupError::Io(format!(
                "create output dir {} failed: {}",
                output_dir.display(),
                e
            ))
        })?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn block_final_path(&self, hash: &BlockHash) -> PathBuf {
        self.output_dir.join(hash.to_hex())
    }

    fn block_tmp_path(&self, hash: &BlockHash) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", hash.to_hex(), BLOCK_TMP_EXT))
    }

    pub async fn contains_block(&self, hash: &BlockHash) -> bool {
        fs::try_exists(self.block_final_path(hash))
            .await
            .unwrap_or(false)
    }

    pub async fn read_block(&self, hash: &BlockHash) -> BackupResult<Vec<u8>> {
        let path = self.block_final_path(hash);
        let mut file = OpenOptions::new()
            .read(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    BackupError::NotFound(format!("block not in sink: {}", hash))
                }
                _ => BackupError::Io(format!("open block {} failed: {}", hash, e)),
            })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| BackupError::Io(format!("read block {} failed: {}", hash, e)))?;
        Ok(data)
    }

    /// Removes `.tmp` leftovers and block files referenced by no position of
    /// any completed backup. Offline maintenance; never run during a backup.
    pub async fn sweep_orphans(&self, store: &Store) -> BackupResult<u64> {
        let referenced = store.referenced_hashes()?;
        let mut removed = 0u64;

        let mut entries = fs::read_dir(&self.output_dir).await.map_err(|e| {
            BackupError::Io(format!(
                "read output dir {} failed: {}",
                self.output_dir.display(),
                e
            ))
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackupError::Io(format!("walk output dir failed: {}", e)))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| BackupError::Io(format!("stat sink entry failed: {}", e)))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();

            let is_tmp = name.ends_with(&format!(".{}", BLOCK_TMP_EXT));
            if !is_tmp {
                // Ignore files that are not hash-named; they are not ours.
                if BlockHash::from_hex(&name).is_err() {
                    continue;
                }
                if referenced.contains(&name) {
                    continue;
                }
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!("sweep: removed orphan {}", name);
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(BackupError::Io(format!("remove orphan {} failed: {}", name, e)));
                }
            }
        }

        if removed > 0 {
            info!(
                "sweep: removed {} orphan files from {}",
                removed,
                self.output_dir.display()
            );
        }
        Ok(removed)
    }
}

#[async_trait]
impl BlockSink for DirectorySink {
    async fn put_block(&mut self, hash: &BlockHash, data: &[u8]) -> BackupResult<()> {
        let final_path = self.block_final_path(hash);
        if fs::try_exists(&final_path).await.unwrap_or(false) {
            debug!("sink: block {} already present", hash);
            return Ok(());
        }

        let tmp_path = self.block_tmp_path(hash);
        let file = File::create(&tmp_path).await.map_err(|e| {
            warn!("sink: create {} failed: {}", tmp_path.display(), e);
            BackupError::Io(format!("create block tmp failed: {}", e))
        })?;

        let std_file = file.into_std().await;
        std_file
            .try_lock_exclusive()
            .map_err(|e| BackupError::Io(format!("lock block tmp failed: {}", e)))?;
        let mut file = File::from_std(std_file);

        file.write_all(data)
            .await
            .map_err(|e| BackupError::Io(format!("write block {} failed: {}", hash, e)))?;
        // The catalog commit assumes the payload is on disk.
        file.sync_all()
            .await
            .map_err(|e| BackupError::Io(format!("sync block {} failed: {}", hash, e)))?;
        drop(file);

        fs::rename(&tmp_path, &final_path).await.map_err(|e| {
            warn!("sink: rename {} failed: {}", tmp_path.display(), e);
            BackupError::Io(format!("rename block {} failed: {}", hash, e))
        })?;
        Ok(())
    }

    async fn flush(&mut self) -> BackupResult<()> {
        Ok(())
    }
}

/// Single-destination sink framing each novel block as
/// `hash(32) || size(4, big-endian) || payload`.
pub struct StreamSink<W: AsyncWrite + Unpin + Send> {
    dest: W,
}

impl StreamSink<File> {
    pub async fn for_file(path: impl AsRef<Path>) -> BackupResult<Self> {
        let path = path.as_ref();
        let dest = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| BackupError::Io(format!("open stream {} failed: {}", path.display(), e)))?;
        Ok(Self { dest })
    }
}

impl StreamSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            dest: tokio::io::stdout(),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> StreamSink<W> {
    pub fn new(dest: W) -> Self {
        Self { dest }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> BlockSink for StreamSink<W> {
    async fn put_block(&mut self, hash: &BlockHash, data: &[u8]) -> BackupResult<()> {
        self.dest
            .write_all(hash.as_bytes())
            .await
            .map_err(|e| BackupError::Io(format!("write frame header failed: {}", e)))?;
        self.dest
            .write_all(&(data.len() as u32).to_be_bytes())
            .await
            .map_err(|e| BackupError::Io(format!("write frame size failed: {}", e)))?;
        self.dest
            .write_all(data)
            .await
            .map_err(|e| BackupError::Io(format!("write frame payload failed: {}", e)))?;
        Ok(())
    }

    async fn flush(&mut self) -> BackupResult<()> {
        self.dest
            .flush()
            .await
            .map_err(|e| BackupError::Io(format!("flush stream failed: {}", e)))
    }
}
