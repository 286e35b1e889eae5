//! End-to-end backup scenarios over synthetic device images.

use crate::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const BS: u64 = 4096;
const FULL_BLOCKS: u64 = 49;
// The 49 full blocks cycle through 36 distinct contents; the padded tail is
// a 37th. Mirrors the duplication ratio of a real filesystem image.
const DISTINCT_FULL_CONTENTS: u64 = 36;
const TOTAL_BLOCKS: u64 = 50;
const DISTINCT_BLOCKS: u64 = 37;
const IMAGE_SIZE: u64 = FULL_BLOCKS * BS + BS / 2;

const MUTATED_CONTENT: u64 = 9999;

fn block_content(content_id: u64) -> Vec<u8> {
    let mut data = vec![0u8; BS as usize];
    data[..8].copy_from_slice(&content_id.to_be_bytes());
    for (offset, byte) in data[8..].iter_mut().enumerate() {
        *byte = (offset % 251) as u8;
    }
    data
}

/// Writes a deterministic device image: 49 full blocks plus half a block, so
/// the reader must zero-pad the tail. `content_offset` shifts every content
/// id (a wholly different device); `mutated_index` replaces one block with
/// novel content (a single-block change).
async fn write_image(path: &Path, content_offset: u64, mutated_index: Option<u64>) {
    let mut content = Vec::with_capacity(IMAGE_SIZE as usize);
    for index in 0..FULL_BLOCKS {
        let content_id = if mutated_index == Some(index) {
            content_offset + MUTATED_CONTENT
        } else {
            content_offset + index % DISTINCT_FULL_CONTENTS
        };
        content.extend_from_slice(&block_content(content_id));
    }
    let tail_fill = 0xF7u8.wrapping_add(content_offset as u8);
    content.extend(vec![tail_fill; (BS / 2) as usize]);
    tokio::fs::write(path, &content).await.unwrap();
}

fn device_config(dir: &TempDir, buffer: usize) -> BackupConfig {
    let mut config = BackupConfig::new(dir.path().join("pg.img"));
    config.output_directory = Some(dir.path().join("blocks"));
    config.db_path = dir.path().join("catalog.db");
    config.block_size = BS;
    config.block_buffer_size = buffer;
    config
}

fn assert_dense_positions(positions: &[(u64, BlockHash)], total: u64) {
    assert_eq!(positions.len() as u64, total);
    for (want, (index, _)) in positions.iter().enumerate() {
        assert_eq!(*index, want as u64);
    }
}

async fn restore_and_checksum(store: &Store, config: &BackupConfig, backup_id: i64) -> String {
    let sink = DirectorySink::new(config.output_directory.as_ref().unwrap())
        .await
        .unwrap();
    let out_path = config.device_path.with_extension("restored");
    restore_backup(store, &sink, backup_id, &out_path).await.unwrap();
    file_checksum(&out_path).await.unwrap()
}

#[tokio::test]
async fn test_full_backup() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("catalog.db")).unwrap());
    let config = device_config(&dir, 10);
    write_image(&config.device_path, 0, None).await;

    let mut backup = Backup::new(store.clone(), config.clone()).unwrap();
    backup.run().await.unwrap();

    assert_eq!(backup.backup_type(), BackupType::Full);
    assert_eq!(backup.total_blocks(), TOTAL_BLOCKS);
    assert_eq!(backup.record().block_size, BS);
    assert_eq!(backup.record().size_in_bytes, IMAGE_SIZE);
    assert!(backup.record().is_completed());

    let positions = store.find_positions_by_backup(backup.record().id).unwrap();
    assert_dense_positions(&positions, TOTAL_BLOCKS);
    assert_eq!(store.total_distinct_blocks().unwrap(), DISTINCT_BLOCKS);
    assert_eq!(backup.stats().blocks_written, DISTINCT_BLOCKS);
    assert_eq!(
        backup.stats().blocks_deduped,
        TOTAL_BLOCKS - DISTINCT_BLOCKS
    );

    let restored = restore_and_checksum(&store, &config, backup.record().id).await;
    assert_eq!(restored, file_checksum(&config.device_path).await.unwrap());
}

#[tokio::test]
async fn test_differential_backup_without_changes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("catalog.db")).unwrap());
    let config = device_config(&dir, 1);
    write_image(&config.device_path, 0, None).await;

    let mut first = Backup::new(store.clone(), config.clone()).unwrap();
    first.run().await.unwrap();
    assert_eq!(first.backup_type(), BackupType::Full);
    drop(first);

    let mut second = Backup::new(store.clone(), config.clone()).unwrap();
    second.run().await.unwrap();

    assert_eq!(second.backup_type(), BackupType::Differential);
    assert_eq!(second.total_blocks(), TOTAL_BLOCKS);
    assert_eq!(second.record().block_size, BS);
    // Nothing changed: no new block rows, only positions and a backup row.
    assert_eq!(store.total_distinct_blocks().unwrap(), DISTINCT_BLOCKS);
    assert_eq!(second.stats().blocks_written, 0);
    assert_eq!(second.stats().blocks_deduped, TOTAL_BLOCKS);

    let positions = store.find_positions_by_backup(second.record().id).unwrap();
    assert_dense_positions(&positions, TOTAL_BLOCKS);

    let restored = restore_and_checksum(&store, &config, second.record().id).await;
    assert_eq!(restored, file_checksum(&config.device_path).await.unwrap());
}

#[tokio::test]
async fn test_identical_devices_yield_identical_position_sequences() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("catalog.db")).unwrap());
    let config = device_config(&dir, 4);
    write_image(&config.device_path, 0, None).await;

    let mut first = Backup::new(store.clone(), config.clone()).unwrap();
    first.run().await.unwrap();
    let first_id = first.record().id;
    drop(first);

    let mut second = Backup::new(store.clone(), config.clone()).unwrap();
    second.run().await.unwrap();

    let first_positions = store.find_positions_by_backup(first_id).unwrap();
    let second_positions = store.find_positions_by_backup(second.record().id).unwrap();
    assert_eq!(first_positions, second_positions);
}

#[tokio::test]
async fn test_differential_backup_with_changes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("catalog.db")).unwrap());
    let config = device_config(&dir, 7);
    write_image(&config.device_path, 0, None).await;
    let original_checksum = file_checksum(&config.device_path).await.unwrap();

    let mut first = Backup::new(store.clone(), config.clone()).unwrap();
    first.run().await.unwrap();
    let first_id = first.record().id;
    drop(first);
    assert_eq!(store.total_distinct_blocks().unwrap(), DISTINCT_BLOCKS);

    let prior_hashes: std::collections::HashSet<BlockHash> = store
        .find_positions_by_backup(first_id)
        .unwrap()
        .into_iter()
        .map(|(_, hash)| hash)
        .collect();

    // The device changes in place: one block rewritten with novel content.
    write_image(&config.device_path, 0, Some(5)).await;

    let mut second = Backup::new(store.clone(), config.clone()).unwrap();
    second.run().await.unwrap();
    assert_eq!(second.backup_type(), BackupType::Differential);

    let positions = store.find_positions_by_backup(second.record().id).unwrap();
    assert_dense_positions(&positions, TOTAL_BLOCKS);
    let novel: Vec<&(u64, BlockHash)> = positions
        .iter()
        .filter(|(_, hash)| !prior_hashes.contains(hash))
        .collect();
    assert_eq!(novel.len(), 1);
    assert_eq!(novel[0].0, 5);
    assert_eq!(store.total_distinct_blocks().unwrap(), DISTINCT_BLOCKS + 1);
    assert_eq!(second.stats().blocks_written, 1);

    let restored = restore_and_checksum(&store, &config, second.record().id).await;
    assert_eq!(restored, file_checksum(&config.device_path).await.unwrap());

    // The earlier backup still reconstructs the pre-change device.
    let first_restore = restore_and_checksum(&store, &config, first_id).await;
    assert_eq!(first_restore, original_checksum);
}

#[tokio::test]
async fn test_cancelled_run_leaves_no_completed_backup() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("catalog.db")).unwrap());
    let config = device_config(&dir, 4);
    write_image(&config.device_path, 0, None).await;
    let original_checksum = file_checksum(&config.device_path).await.unwrap();

    let mut first = Backup::new(store.clone(), config.clone()).unwrap();
    first.run().await.unwrap();
    let first_id = first.record().id;
    drop(first);

    // The device is wholly rewritten, then the run is cancelled halfway.
    write_image(&config.device_path, 1000, None).await;
    let mut second = Backup::new(store.clone(), config.clone()).unwrap();
    let second_id = second.record().id;
    let err = second
        .run_with_progress(Some(Box::new(|index, _total| {
            if index >= TOTAL_BLOCKS / 2 - 1 {
                ProgressStep::Stop
            } else {
                ProgressStep::Continue
            }
        })))
        .await
        .err()
        .expect("expected cancellation");
    assert!(err.is_cancelled());
    drop(second);

    // No completed row, no visible positions; the planner still sees the
    // previous run.
    assert!(!store.get_backup(second_id).unwrap().is_completed());
    assert!(store.find_positions_by_backup(second_id).unwrap().is_empty());
    let latest = store
        .latest_completed_backup(&config.device_path.to_string_lossy())
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, first_id);

    // The aborted run left orphan files in the sink; the sweep removes them
    // without touching anything a completed backup references.
    let sink = DirectorySink::new(config.output_directory.as_ref().unwrap())
        .await
        .unwrap();
    let removed = sink.sweep_orphans(&store).await.unwrap();
    assert_eq!(removed, TOTAL_BLOCKS / 2);

    // Restoring the first backup is unaffected; compare against the original
    // device content, which was since overwritten.
    let out_path = dir.path().join("restored.img");
    restore_backup(&store, &sink, first_id, &out_path).await.unwrap();
    assert_eq!(file_checksum(&out_path).await.unwrap(), original_checksum);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_backups_of_different_devices_share_a_catalog() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("catalog.db")).unwrap());

    let config_a = device_config(&dir, 4);
    let mut config_b = config_a.clone();
    config_b.device_path = dir.path().join("pg_b.img");
    write_image(&config_a.device_path, 0, None).await;
    write_image(&config_b.device_path, 2000, None).await;

    let mut backup_a = Backup::new(store.clone(), config_a.clone()).unwrap();
    let mut backup_b = Backup::new(store.clone(), config_b.clone()).unwrap();

    // Two devices, one catalog: the runs race for the exclusive writer
    // transaction and the loser queues behind the winner.
    let task_a = tokio::spawn(async move {
        let result = backup_a.run().await;
        result.map(|_| backup_a)
    });
    let task_b = tokio::spawn(async move {
        let result = backup_b.run().await;
        result.map(|_| backup_b)
    });
    let backup_a = task_a.await.unwrap().unwrap();
    let backup_b = task_b.await.unwrap().unwrap();

    assert_eq!(backup_a.backup_type(), BackupType::Full);
    assert_eq!(backup_b.backup_type(), BackupType::Full);
    assert!(backup_a.record().is_completed());
    assert!(backup_b.record().is_completed());
    // The devices share no content, so both block populations land.
    assert_eq!(store.total_distinct_blocks().unwrap(), 2 * DISTINCT_BLOCKS);

    let restored_a = restore_and_checksum(&store, &config_a, backup_a.record().id).await;
    assert_eq!(restored_a, file_checksum(&config_a.device_path).await.unwrap());
    let restored_b = restore_and_checksum(&store, &config_b, backup_b.record().id).await;
    assert_eq!(restored_b, file_checksum(&config_b.device_path).await.unwrap());
}

#[tokio::test]
async fn test_buffer_size_does_not_change_outcome() {
    let mut outcomes = Vec::new();
    for buffer in [1usize, 10] {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("catalog.db")).unwrap());
        let config = device_config(&dir, buffer);
        write_image(&config.device_path, 0, None).await;

        let mut backup = Backup::new(store.clone(), config).unwrap();
        backup.run().await.unwrap();

        let positions = store.find_positions_by_backup(backup.record().id).unwrap();
        assert_dense_positions(&positions, TOTAL_BLOCKS);
        let hashes: Vec<BlockHash> = positions.into_iter().map(|(_, hash)| hash).collect();
        outcomes.push((hashes, store.total_distinct_blocks().unwrap()));
    }
    assert_eq!(outcomes[0], outcomes[1]);
}
