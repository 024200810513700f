use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Expected-version token matching any stored version (blind upsert).
pub const ANY_VERSION: &str = "*";

/// Expected-version token requiring that no row exists yet.
pub const NEW_ROW: &str = "";

/// A row persisted by a metadata store.
///
/// Identity is given by [`key`](MetadataRow::key); the store owns the
/// version id and bumps it on every successful write.
pub trait MetadataRow: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Entity kind, also used as the file name by file-backed stores.
    const KIND: &'static str;

    fn key(&self) -> Vec<String>;

    fn version_id(&self) -> &str;

    fn set_version_id(&mut self, version: String);
}

/// Placement of one vertex on one instance.
///
/// Rows with an empty `vertex_name` describe the instance itself; rows with
/// an empty `instance_name` are vertex definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexInfo {
    pub instance_name: String,
    pub vertex_name: String,
    pub vertex_definition: String,
    pub address: String,
    pub port: u16,
    /// Registry key of the factory that builds the vertex.
    pub vertex_create_action: String,
    pub vertex_parameter: Vec<u8>,
    pub is_active: bool,
    pub is_sharded: bool,
    pub version_id: String,
}

impl VertexInfo {
    pub fn instance(instance_name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            instance_name: instance_name.into(),
            address: address.into(),
            port,
            is_active: true,
            ..Self::default()
        }
    }

    pub fn definition(
        definition: impl Into<String>,
        create_action: impl Into<String>,
        is_sharded: bool,
    ) -> Self {
        let definition = definition.into();
        Self {
            vertex_name: definition.clone(),
            vertex_definition: definition,
            vertex_create_action: create_action.into(),
            is_sharded,
            ..Self::default()
        }
    }

    pub fn is_instance_row(&self) -> bool {
        self.vertex_name.is_empty()
    }

    pub fn is_definition_row(&self) -> bool {
        self.instance_name.is_empty()
    }

    pub fn is_placement_row(&self) -> bool {
        !self.is_instance_row() && !self.is_definition_row()
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl MetadataRow for VertexInfo {
    const KIND: &'static str = "vertices";

    fn key(&self) -> Vec<String> {
        vec![self.instance_name.clone(), self.vertex_name.clone()]
    }

    fn version_id(&self) -> &str {
        &self.version_id
    }

    fn set_version_id(&mut self, version: String) {
        self.version_id = version;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub vertex_name: String,
    pub endpoint_name: String,
    pub is_input: bool,
    pub is_async: bool,
    pub version_id: String,
}

impl EndpointInfo {
    pub fn new(
        vertex_name: impl Into<String>,
        endpoint_name: impl Into<String>,
        is_input: bool,
        is_async: bool,
    ) -> Self {
        Self {
            vertex_name: vertex_name.into(),
            endpoint_name: endpoint_name.into(),
            is_input,
            is_async,
            version_id: String::new(),
        }
    }
}

impl MetadataRow for EndpointInfo {
    const KIND: &'static str = "endpoints";

    fn key(&self) -> Vec<String> {
        vec![self.vertex_name.clone(), self.endpoint_name.clone()]
    }

    fn version_id(&self) -> &str {
        &self.version_id
    }

    fn set_version_id(&mut self, version: String) {
        self.version_id = version;
    }
}

/// A declared wire from an output endpoint to an input endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexConnectionInfo {
    pub from_vertex: String,
    pub from_endpoint: String,
    pub to_vertex: String,
    pub to_endpoint: String,
    pub version_id: String,
}

impl VertexConnectionInfo {
    pub fn new(
        from_vertex: impl Into<String>,
        from_endpoint: impl Into<String>,
        to_vertex: impl Into<String>,
        to_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            from_vertex: from_vertex.into(),
            from_endpoint: from_endpoint.into(),
            to_vertex: to_vertex.into(),
            to_endpoint: to_endpoint.into(),
            version_id: String::new(),
        }
    }

    /// Same wire, ignoring the version.
    pub fn same_wire(&self, other: &VertexConnectionInfo) -> bool {
        self.key() == other.key()
    }
}

impl std::fmt::Display for VertexConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.from_vertex, self.from_endpoint, self.to_vertex, self.to_endpoint
        )
    }
}

impl MetadataRow for VertexConnectionInfo {
    const KIND: &'static str = "connections";

    fn key(&self) -> Vec<String> {
        vec![
            self.from_vertex.clone(),
            self.from_endpoint.clone(),
            self.to_vertex.clone(),
            self.to_endpoint.clone(),
        ]
    }

    fn version_id(&self) -> &str {
        &self.version_id
    }

    fn set_version_id(&mut self, version: String) {
        self.version_id = version;
    }
}

/// One immutable epoch of a sharded vertex's placement.
///
/// `all_instances[i]` hosts the shards listed in `all_shards[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedVertexInfo {
    pub vertex_name: String,
    pub epoch_id: u64,
    pub all_instances: Vec<String>,
    pub all_shards: Vec<Vec<u32>>,
    pub added_shards: Vec<u32>,
    pub removed_shards: Vec<u32>,
    /// Name of a registered shard locator.
    pub shard_locator: String,
    pub version_id: String,
}

impl ShardedVertexInfo {
    /// Every shard id of this epoch, ascending.
    pub fn shard_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.all_shards.iter().flatten().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn instance_for_shard(&self, shard: u32) -> Option<&str> {
        self.all_instances
            .iter()
            .zip(&self.all_shards)
            .find(|(_, shards)| shards.contains(&shard))
            .map(|(instance, _)| instance.as_str())
    }
}

impl MetadataRow for ShardedVertexInfo {
    const KIND: &'static str = "sharded_vertices";

    fn key(&self) -> Vec<String> {
        vec![self.vertex_name.clone(), format!("{:020}", self.epoch_id)]
    }

    fn version_id(&self) -> &str {
        &self.version_id
    }

    fn set_version_id(&mut self, version: String) {
        self.version_id = version;
    }
}
