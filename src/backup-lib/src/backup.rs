use log::{debug, info, warn};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::{
    block_channel, spawn_reader, BackupConfig, BackupError, BackupRecord, BackupResult,
    BackupType, BlockSink, CancelHandle, DirectorySink, HashedBlock, OutputFormat,
    RunTransaction, Store, StreamSink, Volume,
};

// One in-progress run per device path, process-wide. Released when the run
// completes or aborts, so a crash of this process never leaves a stale lock.
static ACTIVE_DEVICES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

struct DeviceGuard {
    device_path: String,
}

impl DeviceGuard {
    fn acquire(device_path: &str) -> BackupResult<Self> {
        let mut active = ACTIVE_DEVICES.lock().unwrap();
        if !active.insert(device_path.to_string()) {
            return Err(BackupError::AlreadyExists(format!(
                "backup already in progress for {}",
                device_path
            )));
        }
        Ok(Self {
            device_path: device_path.to_string(),
        })
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = ACTIVE_DEVICES.lock() {
            active.remove(&self.device_path);
        }
    }
}

pub enum ProgressStep {
    Continue,
    Stop,
}

/// Invoked after each persisted block with (position_index, total_blocks).
/// Returning `Stop` cancels the run.
pub type ProgressCallback = Box<dyn FnMut(u64, u64) -> ProgressStep + Send>;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub blocks_written: u64,
    pub blocks_deduped: u64,
}

/// One backup run: planner decision at construction, block persistence in
/// `run`, exactly-once visibility through the per-run catalog transaction.
pub struct Backup {
    pub config: BackupConfig,
    store: Arc<Store>,
    record: BackupRecord,
    cancel: CancelHandle,
    stats: RunStats,
    guard: Option<DeviceGuard>,
    finished: bool,
}

impl Backup {
    /// Validates the configuration, takes the same-device guard, decides
    /// full vs differential, and creates the (uncompleted) Backup row.
    pub fn new(store: Arc<Store>, config: BackupConfig) -> BackupResult<Self> {
        config.validate()?;
        let device_path = config.device_path.to_string_lossy().to_string();
        let guard = DeviceGuard::acquire(&device_path)?;

        let backup_type = match store.latest_completed_backup(&device_path)? {
            Some(prior) => {
                debug!(
                    "planner: found completed backup {} for {}, running differential",
                    prior.id, device_path
                );
                BackupType::Differential
            }
            None => BackupType::Full,
        };

        let backup_id = store.create_backup(&device_path, backup_type, config.block_size)?;
        let record = store.get_backup(backup_id)?;
        info!(
            "backup {} started: device={} type={} block_size={}",
            backup_id,
            device_path,
            backup_type.to_str(),
            config.block_size
        );

        Ok(Self {
            config,
            store,
            record,
            cancel: CancelHandle::new(),
            stats: RunStats::default(),
            guard: Some(guard),
            finished: false,
        })
    }

    pub fn record(&self) -> &BackupRecord {
        &self.record
    }

    pub fn backup_type(&self) -> BackupType {
        self.record.backup_type
    }

    pub fn total_blocks(&self) -> u64 {
        self.record.total_blocks
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Handle for cancelling the run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn run(&mut self) -> BackupResult<()> {
        self.run_with_progress(None).await
    }

    pub async fn run_with_progress(
        &mut self,
        progress: Option<ProgressCallback>,
    ) -> BackupResult<()> {
        if self.finished {
            return Err(BackupError::InvalidState(format!(
                "backup {} already ran",
                self.record.id
            )));
        }
        self.finished = true;

        let result = self.run_inner(progress).await;
        self.guard.take();
        if let Err(ref e) = result {
            warn!("backup {} aborted: {}", self.record.id, e);
        }
        result
    }

    async fn run_inner(&mut self, progress: Option<ProgressCallback>) -> BackupResult<()> {
        let volume = Volume::open(&self.config.device_path, self.config.block_size).await?;
        let expected_blocks = volume.total_blocks();
        let mut sink = open_sink(&self.config).await?;

        let (tx, rx) = block_channel(self.config.block_buffer_size);
        let reader = spawn_reader(volume, tx, self.cancel.clone());

        let run = self.store.begin_run()?;
        let persisted = match self
            .persist_blocks(&run, rx, sink.as_mut(), expected_blocks, progress)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                // Stop the reader before rolling back; its own error (if any)
                // is secondary to the writer's.
                self.cancel.cancel();
                let _ = reader.await;
                self.abort_run(run);
                return Err(e);
            }
        };

        // The channel closed: the reader finished or failed, and its join
        // result decides whether this run may commit.
        let totals = match reader.await {
            Ok(Ok(totals)) => totals,
            Ok(Err(e)) => {
                self.abort_run(run);
                return Err(e);
            }
            Err(e) => {
                self.abort_run(run);
                return Err(BackupError::Io(format!("reader task failed: {}", e)));
            }
        };

        if persisted != totals.total_blocks {
            self.abort_run(run);
            return Err(BackupError::Integrity(format!(
                "persisted {} of {} blocks",
                persisted, totals.total_blocks
            )));
        }

        if let Err(e) = sink.flush().await {
            self.abort_run(run);
            return Err(e);
        }

        if let Err(e) =
            run.finalize_backup(self.record.id, totals.total_blocks, totals.size_in_bytes)
        {
            self.abort_run(run);
            return Err(e);
        }
        // A failed commit is rolled back when the run connection drops.
        run.commit()?;

        self.record = self.store.get_backup(self.record.id)?;
        info!(
            "backup {} completed: {} blocks, {} bytes ({} new, {} deduplicated)",
            self.record.id,
            self.record.total_blocks,
            self.record.size_in_bytes,
            self.stats.blocks_written,
            self.stats.blocks_deduped
        );
        Ok(())
    }

    async fn persist_blocks(
        &mut self,
        run: &RunTransaction,
        mut rx: mpsc::Receiver<HashedBlock>,
        sink: &mut dyn BlockSink,
        expected_blocks: u64,
        mut progress: Option<ProgressCallback>,
    ) -> BackupResult<u64> {
        let mut next_index = 0u64;
        while let Some(block) = rx.recv().await {
            if self.cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            if block.index != next_index {
                return Err(BackupError::Integrity(format!(
                    "pipeline emitted block {} while expecting {}",
                    block.index, next_index
                )));
            }

            let (block_id, was_new) = run.upsert_block(&block.hash, block.data.len() as u64)?;
            if was_new {
                sink.put_block(&block.hash, &block.data).await?;
                self.stats.blocks_written += 1;
                debug!("block {} stored as {}", block.index, block.hash);
            } else {
                self.stats.blocks_deduped += 1;
                debug!("block {} deduplicated ({})", block.index, block.hash);
            }
            run.insert_position(self.record.id, block.index, block_id)?;
            next_index += 1;

            if let Some(callback) = progress.as_mut() {
                if matches!(callback(block.index, expected_blocks), ProgressStep::Stop) {
                    self.cancel.cancel();
                    return Err(BackupError::Cancelled);
                }
            }
        }
        Ok(next_index)
    }

    fn abort_run(&self, run: RunTransaction) {
        if let Err(e) = run.rollback() {
            warn!("backup {}: rollback failed: {}", self.record.id, e);
        }
    }
}

async fn open_sink(config: &BackupConfig) -> BackupResult<Box<dyn BlockSink>> {
    match config.output_format {
        OutputFormat::File => {
            let output_dir = config.output_directory.as_ref().ok_or_else(|| {
                BackupError::Config("output directory is required for file output".to_string())
            })?;
            Ok(Box::new(DirectorySink::new(output_dir).await?))
        }
        OutputFormat::Stream => match &config.stream_path {
            Some(path) => Ok(Box::new(StreamSink::for_file(path).await?)),
            None => Ok(Box::new(StreamSink::stdout())),
        },
    }
}
