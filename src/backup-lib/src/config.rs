use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{BackupError, BackupResult};

pub const DEFAULT_BLOCK_SIZE: u64 = 1_048_576;
pub const DEFAULT_BLOCK_BUFFER_SIZE: usize = 4;
pub const DEFAULT_DB_FILE: &str = "backups.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    File,
    Stream,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_FILE)
}

/// Options for one backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub device_path: PathBuf,
    pub output_format: OutputFormat,
    /// Block directory for the `file` sink.
    pub output_directory: Option<PathBuf>,
    /// Destination for the `stream` sink; stdout when absent.
    pub stream_path: Option<PathBuf>,
    /// Catalog location.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    pub block_size: u64,
    pub block_buffer_size: usize,
}

impl BackupConfig {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            output_format: OutputFormat::File,
            output_directory: None,
            stream_path: None,
            db_path: default_db_path(),
            block_size: DEFAULT_BLOCK_SIZE,
            block_buffer_size: DEFAULT_BLOCK_BUFFER_SIZE,
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> BackupResult<Self> {
        let path = path.as_ref();
        let config_str = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BackupError::Config(format!("read {} failed: {}", path.display(), e)))?;
        let config: BackupConfig = serde_json::from_str(&config_str)
            .map_err(|e| BackupError::Config(format!("parse {} failed: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BackupResult<()> {
        if self.device_path.as_os_str().is_empty() {
            return Err(BackupError::Config("device path is required".to_string()));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(BackupError::Config(format!(
                "block size must be a positive power of two, got {}",
                self.block_size
            )));
        }
        if self.block_buffer_size == 0 {
            return Err(BackupError::Config(
                "block buffer size must be positive".to_string(),
            ));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(BackupError::Config("catalog path is required".to_string()));
        }
        if self.output_format == OutputFormat::File && self.output_directory.is_none() {
            return Err(BackupError::Config(
                "output directory is required for file output".to_string(),
            ));
        }
        Ok(())
    }
}
