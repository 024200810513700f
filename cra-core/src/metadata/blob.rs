use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;

/// Opaque blob storage addressed by `/`-separated paths.
#[async_trait]
pub trait BlobStorageProvider: Send + Sync {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Blob paths starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        for path in self.list(prefix).await? {
            self.delete(&path).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStorageProvider for MemoryBlobStore {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.blobs
            .write()
            .expect("blobs poisoned")
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().expect("blobs poisoned").get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.blobs.write().expect("blobs poisoned").remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .expect("blobs poisoned")
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}
