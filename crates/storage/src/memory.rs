use std::collections::HashMap;
use std::sync::RwLock;

use snafu::ensure;

use super::BlobStore;
use super::error::{EmptyKeySnafu, LockPoisonedSnafu, StorageResult};

/// Process-local store, handy for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(stage: &'static str) -> StorageResult<T> {
    LockPoisonedSnafu { stage }.fail()
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let Ok(blobs) = self.blobs.read() else {
            return poisoned("memory-get");
        };
        Ok(blobs.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        ensure!(!key.is_empty(), EmptyKeySnafu { stage: "memory-set" });
        let Ok(mut blobs) = self.blobs.write() else {
            return poisoned("memory-set");
        };
        blobs.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> StorageResult<()> {
        let Ok(mut blobs) = self.blobs.write() else {
            return poisoned("memory-clear");
        };
        blobs.remove(key);
        Ok(())
    }
}
