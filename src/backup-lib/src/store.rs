use log::{debug, warn};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{BackupError, BackupResult, BlockHash};

const BACKUP_COLUMNS: &str =
    "id, device_path, backup_type, block_size, total_blocks, size_in_bytes, created_at, completed_at";

const DB_BUSY_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a run queues behind another run's exclusive transaction before
/// giving up.
const RUN_QUEUE_TIMEOUT: Duration = Duration::from_secs(600);

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Differential,
}

impl BackupType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "full" => Some(BackupType::Full),
            "differential" => Some(BackupType::Differential),
            _ => None,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Differential => "differential",
        }
    }
}

impl ToSql for BackupType {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.to_str().into())
    }
}

impl FromSql for BackupType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        BackupType::from_str(s).ok_or(FromSqlError::InvalidType)
    }
}

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: i64,
    pub device_path: String,
    pub backup_type: BackupType,
    pub block_size: u64,
    pub total_blocks: u64,
    pub size_in_bytes: u64,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

impl BackupRecord {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

fn open_catalog_connection(db_path: &str, busy_timeout: Duration) -> BackupResult<Connection> {
    let conn = Connection::open(db_path).map_err(|e| {
        warn!("store: open {} failed: {}", db_path, e);
        BackupError::Db(format!("open {} failed: {}", db_path, e))
    })?;

    conn.busy_timeout(busy_timeout)
        .map_err(|e| BackupError::Db(format!("set busy timeout failed: {}", e)))?;
    conn.pragma_update(None, "journal_mode", &"WAL")
        .map_err(|e| BackupError::Db(format!("enable WAL failed: {}", e)))?;
    conn.pragma_update(None, "synchronous", &"FULL")
        .map_err(|e| BackupError::Db(format!("set synchronous failed: {}", e)))?;
    // Foreign key enforcement is per-connection.
    conn.pragma_update(None, "foreign_keys", &"ON")
        .map_err(|e| BackupError::Db(format!("enable foreign keys failed: {}", e)))?;
    Ok(conn)
}

/// The catalog: backups, blocks (unique by content hash), and the per-backup
/// ordered position rows that reconstruct a device.
///
/// Reads and run bookkeeping share one connection; each backup run's block
/// and position writes go through a [`RunTransaction`] on its own dedicated
/// connection, so runs for different devices may share one `Store`. Commit
/// of the run transaction is the only point where a run becomes visible as
/// completed.
pub struct Store {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl Store {
    pub fn new(db_path: impl AsRef<Path>) -> BackupResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        debug!("store: open catalog {}", db_path);

        let conn = open_catalog_connection(&db_path, DB_BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_path TEXT NOT NULL,
                backup_type TEXT NOT NULL,
                block_size INTEGER NOT NULL,
                total_blocks INTEGER NOT NULL DEFAULT 0,
                size_in_bytes INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                size INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS positions (
                backup_id INTEGER NOT NULL,
                position_index INTEGER NOT NULL,
                block_id INTEGER NOT NULL,
                PRIMARY KEY (backup_id, position_index),
                FOREIGN KEY (backup_id) REFERENCES backups(id),
                FOREIGN KEY (block_id) REFERENCES blocks(id)
            );",
        )
        .map_err(|e| {
            warn!("store: create tables failed: {}", e);
            BackupError::Db(format!("create tables failed: {}", e))
        })?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    /// Opens the exclusive per-run transaction on a dedicated catalog
    /// connection. A concurrent run (a different device sharing this store)
    /// queues at `BEGIN IMMEDIATE` on SQLite's busy handler until the writer
    /// slot frees; WAL readers are unaffected.
    pub fn begin_run(&self) -> BackupResult<RunTransaction> {
        let conn = open_catalog_connection(&self.db_path, RUN_QUEUE_TIMEOUT)?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| BackupError::Db(format!("begin transaction failed: {}", e)))?;
        Ok(RunTransaction {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_backup(
        &self,
        device_path: &str,
        backup_type: BackupType,
        block_size: u64,
    ) -> BackupResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO backups (device_path, backup_type, block_size, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![device_path, backup_type, block_size as i64, unix_timestamp() as i64],
        )
        .map_err(|e| {
            warn!("store: create backup failed: {}", e);
            BackupError::Db(format!("create backup failed: {}", e))
        })?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_backup(&self, backup_id: i64) -> BackupResult<BackupRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM backups WHERE id = ?1", BACKUP_COLUMNS),
            params![backup_id],
            record_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                BackupError::NotFound(format!("backup not found: {}", backup_id))
            }
            _ => BackupError::Db(format!("get backup failed: {}", e)),
        })
    }

    /// The most recent completed backup of a device, if any. Aborted runs
    /// (no completed_at) are never returned.
    pub fn latest_completed_backup(&self, device_path: &str) -> BackupResult<Option<BackupRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {} FROM backups
                 WHERE device_path = ?1 AND completed_at IS NOT NULL
                 ORDER BY completed_at DESC, id DESC LIMIT 1",
                BACKUP_COLUMNS
            ),
            params![device_path],
            record_from_row,
        )
        .optional()
        .map_err(|e| BackupError::Db(format!("query latest backup failed: {}", e)))
    }

    /// Ordered reconstruction metadata for one backup.
    pub fn find_positions_by_backup(&self, backup_id: i64) -> BackupResult<Vec<(u64, BlockHash)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT p.position_index, b.hash FROM positions p
                 JOIN blocks b ON b.id = p.block_id
                 WHERE p.backup_id = ?1
                 ORDER BY p.position_index ASC",
            )
            .map_err(|e| BackupError::Db(format!("prepare positions query failed: {}", e)))?;
        let rows = stmt
            .query_map(params![backup_id], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })
            .map_err(|e| BackupError::Db(format!("query positions failed: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| BackupError::Db(format!("read positions failed: {}", e)))?;

        let mut positions = Vec::with_capacity(rows.len());
        for (index, hash_hex) in rows {
            positions.push((index, BlockHash::from_hex(&hash_hex)?));
        }
        Ok(positions)
    }

    pub fn total_distinct_blocks(&self) -> BackupResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
            .map_err(|e| BackupError::Db(format!("count blocks failed: {}", e)))?;
        Ok(count as u64)
    }

    /// Hex hashes referenced by any position of any completed backup. The
    /// orphan sweep deletes sink files outside this set.
    pub fn referenced_hashes(&self) -> BackupResult<HashSet<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT b.hash FROM blocks b
                 JOIN positions p ON p.block_id = b.id
                 JOIN backups bk ON bk.id = p.backup_id
                 WHERE bk.completed_at IS NOT NULL",
            )
            .map_err(|e| BackupError::Db(format!("prepare hash query failed: {}", e)))?;
        let hashes = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| BackupError::Db(format!("query hashes failed: {}", e)))?
            .collect::<rusqlite::Result<HashSet<_>>>()
            .map_err(|e| BackupError::Db(format!("read hashes failed: {}", e)))?;
        Ok(hashes)
    }
}

/// The writer's exclusive transaction for one backup run, on its own
/// catalog connection. Dropping it without `commit` rolls the run back when
/// the connection closes.
pub struct RunTransaction {
    conn: Mutex<Connection>,
}

impl RunTransaction {
    /// Insert-or-ignore on the unique hash index, then select the row id.
    /// Returns `was_new = false` when the content was already cataloged.
    pub fn upsert_block(&self, hash: &BlockHash, size: u64) -> BackupResult<(i64, bool)> {
        let conn = self.conn.lock().unwrap();
        let hash_hex = hash.to_hex();
        let inserted = conn
            .execute(
                "INSERT INTO blocks (hash, size) VALUES (?1, ?2)
                 ON CONFLICT(hash) DO NOTHING",
                params![hash_hex, size as i64],
            )
            .map_err(|e| BackupError::Db(format!("upsert block failed: {}", e)))?;
        let block_id: i64 = conn
            .query_row(
                "SELECT id FROM blocks WHERE hash = ?1",
                params![hash_hex],
                |row| row.get(0),
            )
            .map_err(|e| BackupError::Db(format!("select block id failed: {}", e)))?;
        Ok((block_id, inserted > 0))
    }

    pub fn insert_position(
        &self,
        backup_id: i64,
        position_index: u64,
        block_id: i64,
    ) -> BackupResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO positions (backup_id, position_index, block_id) VALUES (?1, ?2, ?3)",
            params![backup_id, position_index as i64, block_id],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                BackupError::Integrity(format!(
                    "duplicate position {} for backup {}",
                    position_index, backup_id
                ))
            }
            _ => BackupError::Db(format!("insert position failed: {}", e)),
        })?;
        Ok(())
    }

    /// Marks a backup completed. Runs inside the transaction so the
    /// completion flag and the final position rows commit together.
    pub fn finalize_backup(
        &self,
        backup_id: i64,
        total_blocks: u64,
        size_in_bytes: u64,
    ) -> BackupResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE backups SET total_blocks = ?1, size_in_bytes = ?2, completed_at = ?3
                 WHERE id = ?4",
                params![
                    total_blocks as i64,
                    size_in_bytes as i64,
                    unix_timestamp() as i64,
                    backup_id
                ],
            )
            .map_err(|e| BackupError::Db(format!("finalize backup failed: {}", e)))?;
        if updated != 1 {
            return Err(BackupError::NotFound(format!("backup not found: {}", backup_id)));
        }
        Ok(())
    }

    pub fn commit(self) -> BackupResult<()> {
        let conn = self.conn.into_inner().unwrap();
        conn.execute_batch("COMMIT")
            .map_err(|e| BackupError::Db(format!("commit failed: {}", e)))
    }

    pub fn rollback(self) -> BackupResult<()> {
        let conn = self.conn.into_inner().unwrap();
        conn.execute_batch("ROLLBACK")
            .map_err(|e| BackupError::Db(format!("rollback failed: {}", e)))
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.get(0)?,
        device_path: row.get(1)?,
        backup_type: row.get(2)?,
        block_size: row.get::<_, i64>(3)? as u64,
        total_blocks: row.get::<_, i64>(4)? as u64,
        size_in_bytes: row.get::<_, i64>(5)? as u64,
        created_at: row.get::<_, i64>(6)? as u64,
        completed_at: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
    })
}
