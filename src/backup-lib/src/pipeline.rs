use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{BackupError, BackupResult, BlockHash, Volume};

/// Cancellation signal shared by the reader task and the writer. Observed at
/// both suspension boundaries; once set it never clears.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One hashed block in flight between the reader task and the writer.
pub struct HashedBlock {
    pub index: u64,
    pub hash: BlockHash,
    pub data: Vec<u8>,
}

/// Totals the reader reports after emitting the final block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTotals {
    pub total_blocks: u64,
    pub size_in_bytes: u64,
}

/// Bounded single-producer/single-consumer channel for hashed blocks. The
/// capacity bounds pipeline memory to `capacity * block_size` bytes.
pub fn block_channel(capacity: usize) -> (mpsc::Sender<HashedBlock>, mpsc::Receiver<HashedBlock>) {
    mpsc::channel(capacity)
}

/// Spawns the reader+hasher task. Blocks are read in position order, hashed,
/// and pushed into the bounded channel (the send suspends on a full buffer).
/// The sender is dropped after the final block, which is the end-of-stream
/// signal; errors and cancellation travel through the join result, never
/// through the data channel.
pub fn spawn_reader(
    mut volume: Volume,
    tx: mpsc::Sender<HashedBlock>,
    cancel: CancelHandle,
) -> JoinHandle<BackupResult<ReadTotals>> {
    tokio::spawn(async move {
        let totals = ReadTotals {
            total_blocks: volume.total_blocks(),
            size_in_bytes: volume.size_bytes(),
        };

        loop {
            if cancel.is_cancelled() {
                debug!("reader: cancelled on {}", volume.device_path.display());
                return Err(BackupError::Cancelled);
            }

            let Some((index, data)) = volume.next_block().await? else {
                break;
            };
            let hash = BlockHash::from_data(&data);
            if tx.send(HashedBlock { index, hash, data }).await.is_err() {
                // The writer went away; it owns the real error.
                debug!("reader: writer dropped at block {}", index);
                return Err(BackupError::Cancelled);
            }
        }

        debug!(
            "reader: finished {} ({} blocks, {} bytes)",
            volume.device_path.display(),
            totals.total_blocks,
            totals.size_in_bytes
        );
        Ok(totals)
    })
}
