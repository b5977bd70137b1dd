pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryBlobStore;
pub use sqlite::SqliteBlobStore;

/// Opaque key/value persistence for whole-document blobs.
///
/// Callers own the encoding; the store never looks inside a value.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn clear(&self, key: &str) -> StorageResult<()>;
}
