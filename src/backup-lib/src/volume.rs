use log::warn;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{BackupError, BackupResult};

const READ_RETRY_LIMIT: u32 = 3;

/// Fixed-block view over a block device or a device-image file.
///
/// Blocks are yielded in position order and are always exactly `block_size`
/// bytes long; the trailing block is right-padded with zeros when the device
/// size is not block-aligned. Reading the same unchanged device twice yields
/// byte-identical sequences.
pub struct Volume {
    pub device_path: PathBuf,
    file: File,
    block_size: u64,
    size_bytes: u64,
    total_blocks: u64,
    next_index: u64,
}

impl Volume {
    pub async fn open(device_path: impl AsRef<Path>, block_size: u64) -> BackupResult<Self> {
        let device_path = device_path.as_ref().to_path_buf();
        let mut file = File::open(&device_path).await.map_err(|e| {
            warn!("volume open failed: {}: {}", device_path.display(), e);
            BackupError::Io(format!("open {} failed: {}", device_path.display(), e))
        })?;

        // metadata().len() reports 0 for raw block devices; the end offset
        // works for both devices and image files.
        let size_bytes = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|e| BackupError::Io(format!("seek {} failed: {}", device_path.display(), e)))?;
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| BackupError::Io(format!("seek {} failed: {}", device_path.display(), e)))?;

        if size_bytes == 0 {
            return Err(BackupError::Config(format!(
                "device {} is empty",
                device_path.display()
            )));
        }

        let total_blocks = size_bytes.div_ceil(block_size);
        Ok(Self {
            device_path,
            file,
            block_size,
            size_bytes,
            total_blocks,
            next_index: 0,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// The next block in position order, or None after the final block.
    pub async fn next_block(&mut self) -> BackupResult<Option<(u64, Vec<u8>)>> {
        if self.next_index >= self.total_blocks {
            return Ok(None);
        }

        let index = self.next_index;
        let offset = index * self.block_size;
        let want = std::cmp::min(self.block_size, self.size_bytes - offset) as usize;

        let mut data = vec![0u8; self.block_size as usize];
        self.read_fully(index, &mut data[..want]).await?;

        self.next_index += 1;
        Ok(Some((index, data)))
    }

    async fn read_fully(&mut self, index: u64, buf: &mut [u8]) -> BackupResult<()> {
        let mut filled = 0usize;
        let mut retries = 0u32;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]).await {
                Ok(0) => {
                    return Err(BackupError::Io(format!(
                        "unexpected end of device {} at block {}",
                        self.device_path.display(),
                        index
                    )));
                }
                Ok(read) => {
                    filled += read;
                    retries = 0;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted
                    && retries < READ_RETRY_LIMIT =>
                {
                    retries += 1;
                    warn!(
                        "transient read error on {} block {} (retry {}): {}",
                        self.device_path.display(),
                        index,
                        retries,
                        e
                    );
                }
                Err(e) => {
                    return Err(BackupError::Io(format!(
                        "read {} failed at block {}: {}",
                        self.device_path.display(),
                        index,
                        e
                    )));
                }
            }
        }
        Ok(())
    }
}
