use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

use super::blob::BlobStorageProvider;
use super::store::{RowStore, apply_delete, apply_upsert};
use super::types::MetadataRow;

/// Row store persisting one JSON array per entity kind.
///
/// Every mutation reads the whole file and rewrites it; there is no append
/// log. The mutex serializes writers inside one process only.
pub struct FileRowStore<R> {
    path: PathBuf,
    lock: Mutex<()>,
    _phantom: PhantomData<fn() -> R>,
}

impl<R: MetadataRow> FileRowStore<R> {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join(format!("{}.json", R::KIND)),
            lock: Mutex::new(()),
            _phantom: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_rows(&self) -> Result<Vec<R>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_rows(&self, rows: &[R]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(rows)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl<R: MetadataRow> RowStore<R> for FileRowStore<R> {
    async fn insert_or_replace(&self, row: R, expected_version: &str) -> Result<R> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_rows().await?;
        let stored = apply_upsert(&mut rows, row, expected_version)?;
        self.write_rows(&rows).await?;
        Ok(stored)
    }

    async fn delete(&self, row: &R) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_rows().await?;
        apply_delete(&mut rows, row);
        self.write_rows(&rows).await
    }

    async fn get_all(&self) -> Result<Vec<R>> {
        let _guard = self.lock.lock().await;
        self.read_rows().await
    }

    async fn delete_store(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Blob store mapping blob paths to files under a root directory.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(anyhow!("invalid blob path: {path:?}").into());
        }
        Ok(self.root.join(relative))
    }

    async fn collect_files(&self, dir: PathBuf, out: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let name: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    out.push(name.join("/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorageProvider for FileBlobStore {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, data).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.collect_files(self.root.clone(), &mut names).await?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }
}
