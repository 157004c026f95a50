use super::{SecretSource, SecretStore, StorageError};
use crate::auth::{stamp_of, Secret, Timestamp, SECRET_LEN};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Writes each batch to its own file under a tokens directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates `dir` if it does not exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, issued_at: Timestamp) -> PathBuf {
        self.dir.join(URL_SAFE.encode(stamp_of(issued_at)))
    }
}

impl SecretStore for FileStore {
    fn persist(
        &self,
        issued_at: Timestamp,
        secrets: &[Secret],
    ) -> Result<Arc<dyn SecretSource>, StorageError> {
        if secrets.is_empty() {
            return Err(StorageError::EmptyBatch);
        }
        let path = self.path_for(issued_at);
        let mut bytes = Vec::with_capacity(secrets.len() * SECRET_LEN);
        for secret in secrets {
            bytes.extend_from_slice(secret.as_bytes());
        }

        let written = File::create(&path).and_then(|mut f| {
            f.write_all(&bytes)?;
            f.sync_all()
        });
        if let Err(source) = written {
            let _ = fs::remove_file(&path);
            return Err(StorageError::Io { path, source });
        }
        debug!(path = %path.display(), count = secrets.len(), "Persisted secret batch");

        Ok(Arc::new(FileSecrets {
            path,
            count: secrets.len(),
        }))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// A batch read back from disk one secret at a time
#[derive(Debug)]
pub struct FileSecrets {
    path: PathBuf,
    count: usize,
}

impl FileSecrets {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretSource for FileSecrets {
    fn is_resident(&self) -> bool {
        false
    }

    fn secret_at(&self, index: u16) -> Result<Secret, StorageError> {
        if index as usize >= self.count {
            return Err(StorageError::OutOfRange {
                index,
                count: self.count,
            });
        }
        let io = |source| StorageError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = File::open(&self.path).map_err(io)?;
        file.seek(SeekFrom::Start(index as u64 * SECRET_LEN as u64))
            .map_err(io)?;
        let mut buf = [0u8; SECRET_LEN];
        file.read_exact(&mut buf).map_err(io)?;
        Ok(Secret::new(buf))
    }

    fn discard(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed secret batch"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove secret batch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: u8) -> Vec<Secret> {
        (0..n).map(|i| Secret::new([i; 6])).collect()
    }

    #[test]
    fn test_file_persist_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let source = store.persist(0x0102_0304_0506, &batch(16)).unwrap();
        assert!(!source.is_resident());

        let path = dir.path().join("AQIDBAUG");
        assert_eq!(fs::metadata(&path).unwrap().len(), 16 * 6);
        assert_eq!(source.secret_at(0).unwrap(), Secret::new([0; 6]));
        assert_eq!(source.secret_at(15).unwrap(), Secret::new([15; 6]));
        assert!(source.secret_at(16).is_err());

        source.discard();
        assert!(!path.exists());
        // Second discard is a no-op
        source.discard();
    }

    #[test]
    fn test_file_read_after_external_removal_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let source = store.persist(7, &batch(16)).unwrap();
        fs::remove_file(store.path_for(7)).unwrap();
        assert!(matches!(source.secret_at(1), Err(StorageError::Io { .. })));
    }

    #[test]
    fn test_file_persist_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("tokens")).unwrap();
        fs::remove_dir_all(store.dir()).unwrap();
        assert!(matches!(
            store.persist(9, &batch(16)),
            Err(StorageError::Io { .. })
        ));
        assert!(!store.path_for(9).exists());
    }
}
