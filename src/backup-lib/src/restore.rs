use log::info;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::{BackupError, BackupResult, DirectorySink, Store};

/// Rebuilds a completed backup into `output_path` by concatenating sink
/// payloads in position order, truncated to the recorded device size.
pub async fn restore_backup(
    store: &Store,
    sink: &DirectorySink,
    backup_id: i64,
    output_path: impl AsRef<Path>,
) -> BackupResult<()> {
    let output_path = output_path.as_ref();
    let record = store.get_backup(backup_id)?;
    if !record.is_completed() {
        return Err(BackupError::InvalidState(format!(
            "backup {} was never completed",
            backup_id
        )));
    }

    let positions = store.find_positions_by_backup(backup_id)?;
    if positions.len() as u64 != record.total_blocks {
        return Err(BackupError::Integrity(format!(
            "backup {} has {} positions, expected {}",
            backup_id,
            positions.len(),
            record.total_blocks
        )));
    }

    let mut out = File::create(output_path).await.map_err(|e| {
        BackupError::Io(format!("create {} failed: {}", output_path.display(), e))
    })?;

    let mut remaining = record.size_in_bytes;
    for (want_index, (index, hash)) in positions.iter().enumerate() {
        if *index != want_index as u64 {
            return Err(BackupError::Integrity(format!(
                "backup {} positions are not dense at {}",
                backup_id, want_index
            )));
        }

        let data = sink.read_block(hash).await?;
        if data.len() as u64 != record.block_size {
            return Err(BackupError::Integrity(format!(
                "block {} has {} bytes, expected {}",
                hash,
                data.len(),
                record.block_size
            )));
        }

        let take = std::cmp::min(remaining, record.block_size) as usize;
        out.write_all(&data[..take])
            .await
            .map_err(|e| BackupError::Io(format!("write {} failed: {}", output_path.display(), e)))?;
        remaining -= take as u64;
    }

    out.sync_all()
        .await
        .map_err(|e| BackupError::Io(format!("sync {} failed: {}", output_path.display(), e)))?;

    info!(
        "restored backup {} to {} ({} bytes)",
        backup_id,
        output_path.display(),
        record.size_in_bytes
    );
    Ok(())
}
