mod backup;
mod config;
mod hash;
mod pipeline;
mod restore;
mod sink;
mod store;
mod volume;

pub use backup::*;
pub use config::*;
pub use hash::*;
pub use pipeline::*;
pub use restore::*;
pub use sink::*;
pub use store::*;
pub use volume::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("backup cancelled")]
    Cancelled,
}

impl BackupError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackupError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }
}

pub type BackupResult<T> = std::result::Result<T, BackupError>;

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::Io(err.to_string())
    }
}

#[cfg(test)]
mod backup_tests;
