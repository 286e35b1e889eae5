use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::{BackupError, BackupResult};

pub const BLOCK_HASH_LEN: usize = 32;

const CHECKSUM_BUF_SIZE: usize = 64 * 1024;

/// SHA-256 content identifier of one block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash([u8; BLOCK_HASH_LEN]);

impl BlockHash {
    pub fn from_data(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut hash = [0u8; BLOCK_HASH_LEN];
        hash.copy_from_slice(&digest);
        Self(hash)
    }

    pub fn from_raw(bytes: [u8; BLOCK_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_str: &str) -> BackupResult<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| {
            BackupError::Integrity(format!("invalid block hash {}: {}", hex_str, e))
        })?;
        if bytes.len() != BLOCK_HASH_LEN {
            return Err(BackupError::Integrity(format!(
                "invalid block hash length: {}",
                hex_str
            )));
        }
        let mut hash = [0u8; BLOCK_HASH_LEN];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_HASH_LEN] {
        &self.0
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockHash({})", &self.to_hex()[..16])
    }
}

/// SHA-256 over an entire file, hex-encoded. Used by tests to compare a
/// restored image against its source device.
pub async fn file_checksum(path: impl AsRef<Path>) -> BackupResult<String> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .await
        .map_err(|e| BackupError::Io(format!("open {} failed: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHECKSUM_BUF_SIZE];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|e| BackupError::Io(format!("read {} failed: {}", path.display(), e)))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
