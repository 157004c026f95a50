use super::{SecretSource, SecretStore, StorageError};
use crate::auth::{Secret, Timestamp};
use std::sync::Arc;

/// A batch held entirely in memory
pub struct MemorySecrets {
    secrets: Vec<Secret>,
}

impl MemorySecrets {
    pub fn new(secrets: Vec<Secret>) -> Self {
        Self { secrets }
    }
}

impl SecretSource for MemorySecrets {
    fn is_resident(&self) -> bool {
        true
    }

    fn secret_at(&self, index: u16) -> Result<Secret, StorageError> {
        self.secrets
            .get(index as usize)
            .copied()
            .ok_or(StorageError::OutOfRange {
                index,
                count: self.secrets.len(),
            })
    }

    fn discard(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStore;

impl SecretStore for MemoryStore {
    fn persist(
        &self,
        _issued_at: Timestamp,
        secrets: &[Secret],
    ) -> Result<Arc<dyn SecretSource>, StorageError> {
        if secrets.is_empty() {
            return Err(StorageError::EmptyBatch);
        }
        Ok(Arc::new(MemorySecrets::new(secrets.to_vec())))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_secret_at() {
        let secrets: Vec<Secret> = (0..3u8).map(|i| Secret::new([i; 6])).collect();
        let source = MemoryStore.persist(1, &secrets).unwrap();
        assert!(source.is_resident());
        assert_eq!(source.secret_at(2).unwrap(), Secret::new([2; 6]));
        assert!(matches!(
            source.secret_at(3),
            Err(StorageError::OutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_memory_rejects_empty_batch() {
        assert!(matches!(
            MemoryStore.persist(1, &[]),
            Err(StorageError::EmptyBatch)
        ));
    }
}
