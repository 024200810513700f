use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::MetadataConfig;
use crate::error::Result;

use super::blob::{BlobStorageProvider, MemoryBlobStore};
use super::file::{FileBlobStore, FileRowStore};
use super::store::{MemoryRowStore, RowStore, update_with_retry};
use super::types::{
    ANY_VERSION, EndpointInfo, MetadataRow, NEW_ROW, ShardedVertexInfo, VertexConnectionInfo,
    VertexInfo,
};

/// Queries over vertex placement rows.
#[derive(Clone)]
pub struct VertexInfoProvider {
    store: Arc<dyn RowStore<VertexInfo>>,
}

impl VertexInfoProvider {
    pub fn new(store: Arc<dyn RowStore<VertexInfo>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn RowStore<VertexInfo> {
        self.store.as_ref()
    }

    pub async fn insert_or_replace(&self, row: VertexInfo, expected: &str) -> Result<VertexInfo> {
        self.store.insert_or_replace(row, expected).await
    }

    pub async fn delete(&self, row: &VertexInfo) -> Result<()> {
        self.store.delete(row).await
    }

    pub async fn get_all(&self) -> Result<Vec<VertexInfo>> {
        self.store.get_all().await
    }

    pub async fn get_row_for_instance(&self, instance: &str) -> Result<Option<VertexInfo>> {
        self.get_row_for_vertex(instance, "").await
    }

    pub async fn get_row_for_vertex(
        &self,
        instance: &str,
        vertex: &str,
    ) -> Result<Option<VertexInfo>> {
        self.store
            .get_by_key(&[instance.to_string(), vertex.to_string()])
            .await
    }

    pub async fn get_row_for_vertex_definition(
        &self,
        definition: &str,
    ) -> Result<Option<VertexInfo>> {
        self.get_row_for_vertex("", definition).await
    }

    /// Placement rows hosted by `instance` (the instance row excluded).
    pub async fn get_rows_for_instance(&self, instance: &str) -> Result<Vec<VertexInfo>> {
        let instance = instance.to_string();
        self.store
            .get_all_matching(&move |row: &VertexInfo| {
                row.instance_name == instance && row.is_placement_row()
            })
            .await
    }

    /// Placement rows of `vertex` on every instance.
    pub async fn get_rows_for_vertex(&self, vertex: &str) -> Result<Vec<VertexInfo>> {
        let vertex = vertex.to_string();
        self.store
            .get_all_matching(&move |row: &VertexInfo| {
                row.vertex_name == vertex && row.is_placement_row()
            })
            .await
    }

    pub async fn get_row_for_active_vertex(&self, vertex: &str) -> Result<Option<VertexInfo>> {
        let vertex = vertex.to_string();
        self.store
            .get(&move |row: &VertexInfo| {
                row.vertex_name == vertex && row.is_placement_row() && row.is_active
            })
            .await
    }

    pub async fn get_instance_names(&self) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .store
            .get_all_matching(&|row: &VertexInfo| row.is_instance_row() && !row.is_definition_row())
            .await?
            .into_iter()
            .map(|row| row.instance_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    pub async fn get_vertex_names(&self) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .store
            .get_all_matching(&|row: &VertexInfo| row.is_placement_row())
            .await?
            .into_iter()
            .map(|row| row.vertex_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    pub async fn get_vertex_definitions(&self) -> Result<Vec<VertexInfo>> {
        self.store
            .get_all_matching(&|row: &VertexInfo| row.is_definition_row() && !row.is_instance_row())
            .await
    }

    /// True iff an instance row exists for `instance`.
    pub async fn contains_instance(&self, instance: &str) -> Result<bool> {
        Ok(self.get_row_for_instance(instance).await?.is_some())
    }

    /// Read-modify-write of one placement row.
    pub async fn update_row<F>(
        &self,
        instance: &str,
        vertex: &str,
        apply: F,
    ) -> Result<Option<VertexInfo>>
    where
        F: FnMut(&mut VertexInfo) + Send,
    {
        update_with_retry(
            self.store.as_ref(),
            &[instance.to_string(), vertex.to_string()],
            apply,
        )
        .await
    }

    /// Delete the instance row and every placement row on `instance`.
    pub async fn delete_instance(&self, instance: &str) -> Result<()> {
        for row in self.get_rows_for_instance(instance).await? {
            self.store.delete(&row).await?;
        }
        if let Some(row) = self.get_row_for_instance(instance).await? {
            self.store.delete(&row).await?;
        }
        Ok(())
    }
}

/// Queries over registered endpoints.
#[derive(Clone)]
pub struct EndpointInfoProvider {
    store: Arc<dyn RowStore<EndpointInfo>>,
}

impl EndpointInfoProvider {
    pub fn new(store: Arc<dyn RowStore<EndpointInfo>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn RowStore<EndpointInfo> {
        self.store.as_ref()
    }

    pub async fn add_endpoint(&self, endpoint: EndpointInfo) -> Result<EndpointInfo> {
        self.store.insert_or_replace(endpoint, ANY_VERSION).await
    }

    pub async fn delete_endpoint(&self, endpoint: &EndpointInfo) -> Result<()> {
        self.store.delete(endpoint).await
    }

    pub async fn get_endpoint(&self, vertex: &str, endpoint: &str) -> Result<Option<EndpointInfo>> {
        self.store
            .get_by_key(&[vertex.to_string(), endpoint.to_string()])
            .await
    }

    pub async fn get_endpoints(&self, vertex: &str) -> Result<Vec<EndpointInfo>> {
        let vertex = vertex.to_string();
        self.store
            .get_all_matching(&move |row: &EndpointInfo| row.vertex_name == vertex)
            .await
    }

    pub async fn delete_endpoints(&self, vertex: &str) -> Result<()> {
        for endpoint in self.get_endpoints(vertex).await? {
            self.store.delete(&endpoint).await?;
        }
        Ok(())
    }
}

/// Queries over declared connections.
#[derive(Clone)]
pub struct VertexConnectionInfoProvider {
    store: Arc<dyn RowStore<VertexConnectionInfo>>,
}

impl VertexConnectionInfoProvider {
    pub fn new(store: Arc<dyn RowStore<VertexConnectionInfo>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn RowStore<VertexConnectionInfo> {
        self.store.as_ref()
    }

    pub async fn add(
        &self,
        connection: VertexConnectionInfo,
        expected: &str,
    ) -> Result<VertexConnectionInfo> {
        self.store.insert_or_replace(connection, expected).await
    }

    pub async fn delete(&self, connection: &VertexConnectionInfo) -> Result<()> {
        self.store.delete(connection).await
    }

    pub async fn get_connection(
        &self,
        connection: &VertexConnectionInfo,
    ) -> Result<Option<VertexConnectionInfo>> {
        self.store.get_by_key(&connection.key()).await
    }

    pub async fn get_all(&self) -> Result<Vec<VertexConnectionInfo>> {
        self.store.get_all().await
    }

    pub async fn get_connections_from(&self, vertex: &str) -> Result<Vec<VertexConnectionInfo>> {
        let vertex = vertex.to_string();
        self.store
            .get_all_matching(&move |row: &VertexConnectionInfo| row.from_vertex == vertex)
            .await
    }

    pub async fn get_connections_to(&self, vertex: &str) -> Result<Vec<VertexConnectionInfo>> {
        let vertex = vertex.to_string();
        self.store
            .get_all_matching(&move |row: &VertexConnectionInfo| row.to_vertex == vertex)
            .await
    }
}

/// Queries over sharded-vertex epochs.
#[derive(Clone)]
pub struct ShardedVertexInfoProvider {
    store: Arc<dyn RowStore<ShardedVertexInfo>>,
}

impl ShardedVertexInfoProvider {
    pub fn new(store: Arc<dyn RowStore<ShardedVertexInfo>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn RowStore<ShardedVertexInfo> {
        self.store.as_ref()
    }

    /// Append an epoch. Epochs are never rewritten, so an existing
    /// `(vertex, epoch)` row is a version conflict.
    pub async fn add_epoch(&self, epoch: ShardedVertexInfo) -> Result<ShardedVertexInfo> {
        self.store.insert_or_replace(epoch, NEW_ROW).await
    }

    /// Every epoch of `vertex`, oldest first.
    pub async fn get_entries_for_vertex(&self, vertex: &str) -> Result<Vec<ShardedVertexInfo>> {
        let vertex = vertex.to_string();
        let mut entries = self
            .store
            .get_all_matching(&move |row: &ShardedVertexInfo| row.vertex_name == vertex)
            .await?;
        entries.sort_by_key(|row| row.epoch_id);
        Ok(entries)
    }

    pub async fn get_latest_entry_for_vertex(
        &self,
        vertex: &str,
    ) -> Result<Option<ShardedVertexInfo>> {
        Ok(self.get_entries_for_vertex(vertex).await?.pop())
    }

    pub async fn delete_vertex(&self, vertex: &str) -> Result<()> {
        for entry in self.get_entries_for_vertex(vertex).await? {
            self.store.delete(&entry).await?;
        }
        Ok(())
    }
}

/// Every metadata collaborator the runtime talks to.
#[derive(Clone)]
pub struct DataProvider {
    pub vertices: VertexInfoProvider,
    pub endpoints: EndpointInfoProvider,
    pub connections: VertexConnectionInfoProvider,
    pub sharded_vertices: ShardedVertexInfoProvider,
    pub blobs: Arc<dyn BlobStorageProvider>,
}

impl DataProvider {
    pub fn in_memory() -> Self {
        Self {
            vertices: VertexInfoProvider::new(Arc::new(MemoryRowStore::new())),
            endpoints: EndpointInfoProvider::new(Arc::new(MemoryRowStore::new())),
            connections: VertexConnectionInfoProvider::new(Arc::new(MemoryRowStore::new())),
            sharded_vertices: ShardedVertexInfoProvider::new(Arc::new(MemoryRowStore::new())),
            blobs: Arc::new(MemoryBlobStore::new()),
        }
    }

    pub fn file_backed(config: &MetadataConfig) -> Self {
        let root = &config.root;
        Self {
            vertices: VertexInfoProvider::new(Arc::new(FileRowStore::<VertexInfo>::new(root))),
            endpoints: EndpointInfoProvider::new(Arc::new(FileRowStore::<EndpointInfo>::new(root))),
            connections: VertexConnectionInfoProvider::new(Arc::new(
                FileRowStore::<VertexConnectionInfo>::new(root),
            )),
            sharded_vertices: ShardedVertexInfoProvider::new(Arc::new(
                FileRowStore::<ShardedVertexInfo>::new(root),
            )),
            blobs: Arc::new(FileBlobStore::new(root.join("blobs"))),
        }
    }

    /// Remove every row and blob.
    pub async fn reset(&self) -> Result<()> {
        self.vertices.store().delete_store().await?;
        self.endpoints.store().delete_store().await?;
        self.connections.store().delete_store().await?;
        self.sharded_vertices.store().delete_store().await?;
        self.blobs.delete_prefix("").await
    }
}
