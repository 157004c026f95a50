//! Secret storage for issued batches
//!
//! - Memory: every secret of a batch stays resident in the grant
//! - File: secrets are written to `<tokens dir>/<base64url(stamp)>` and read back one at a
//!   time as the cursor advances
//!
//! The mode is chosen once at startup; the rest of the server only sees the
//! [`SecretStore`] and [`SecretSource`] traits.

mod file;
mod memory;

pub use file::{FileSecrets, FileStore};
pub use memory::{MemorySecrets, MemoryStore};

use crate::auth::{Secret, Timestamp};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secret index {index} out of range for batch of {count}")]
    OutOfRange { index: u16, count: usize },

    #[error("empty batch")]
    EmptyBatch,
}

/// Where the secrets of one batch come from
pub trait SecretSource: Send + Sync {
    /// Resident sources answer without I/O and may be queried under the registry lock
    fn is_resident(&self) -> bool;

    /// Secret at `index` in the batch. File-backed sources block on disk I/O.
    fn secret_at(&self, index: u16) -> Result<Secret, StorageError>;

    /// Release any durable artifact. Called once the grant leaves the registry.
    fn discard(&self);
}

/// Persists freshly minted batches
pub trait SecretStore: Send + Sync {
    /// Store a full batch before the grant is registered. On error nothing is left behind.
    fn persist(
        &self,
        issued_at: Timestamp,
        secrets: &[Secret],
    ) -> Result<Arc<dyn SecretSource>, StorageError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageMode {
    Memory,
    File,
}

impl StorageMode {
    pub fn build(self, tokens_dir: PathBuf) -> Result<Arc<dyn SecretStore>, StorageError> {
        Ok(match self {
            StorageMode::Memory => Arc::new(MemoryStore),
            StorageMode::File => Arc::new(FileStore::new(tokens_dir)?),
        })
    }
}
