//! Vertex and endpoint abstractions hosted by workers.

pub mod channel;
pub mod endpoint;
pub mod sharded;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

pub use channel::{ChannelInputEndpoint, ChannelOutputEndpoint, ChannelTaps, ChannelVertex};
pub use endpoint::{AsyncInputEndpoint, AsyncOutputEndpoint};
pub use sharded::{
    ShardLocatorRegistry, ShardedVertexParameter, ShardingInfo, all_to_all_input,
    all_to_all_output, shard_vertex_name, split_shard_vertex_name,
};

/// A unit of computation exposing named endpoints.
#[async_trait]
pub trait Vertex: Send + Sync {
    /// Register endpoints on `ctx`. `parameter` is the opaque payload stored
    /// in the vertex row.
    async fn initialize(&mut self, ctx: &mut VertexContext, parameter: &[u8]) -> Result<()>;

    async fn dispose(&self) {}
}

/// Collects the endpoints a vertex registers while initializing.
pub struct VertexContext {
    instance_name: String,
    vertex_name: String,
    inputs: HashMap<String, Arc<dyn AsyncInputEndpoint>>,
    outputs: HashMap<String, Arc<dyn AsyncOutputEndpoint>>,
}

impl VertexContext {
    pub fn new(instance_name: impl Into<String>, vertex_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            vertex_name: vertex_name.into(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn vertex_name(&self) -> &str {
        &self.vertex_name
    }

    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        endpoint: Arc<dyn AsyncInputEndpoint>,
    ) -> Result<()> {
        let name = name.into();
        if self.inputs.contains_key(&name) || self.outputs.contains_key(&name) {
            return Err(anyhow!("duplicate endpoint {} on {}", name, self.vertex_name));
        }
        self.inputs.insert(name, endpoint);
        Ok(())
    }

    pub fn add_output(
        &mut self,
        name: impl Into<String>,
        endpoint: Arc<dyn AsyncOutputEndpoint>,
    ) -> Result<()> {
        let name = name.into();
        if self.inputs.contains_key(&name) || self.outputs.contains_key(&name) {
            return Err(anyhow!("duplicate endpoint {} on {}", name, self.vertex_name));
        }
        self.outputs.insert(name, endpoint);
        Ok(())
    }

    pub fn into_endpoints(
        self,
    ) -> (
        HashMap<String, Arc<dyn AsyncInputEndpoint>>,
        HashMap<String, Arc<dyn AsyncOutputEndpoint>>,
    ) {
        (self.inputs, self.outputs)
    }
}

pub type VertexFactory = Arc<dyn Fn() -> Box<dyn Vertex> + Send + Sync>;

/// Create-action key to vertex factory.
#[derive(Clone, Default)]
pub struct VertexRegistry {
    factories: HashMap<String, VertexFactory>,
}

impl VertexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry hosting a single vertex type, as used by sideloaded workers.
    pub fn only<F>(key: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Vertex> + Send + Sync + 'static,
    {
        Self::new().with(key, factory)
    }

    pub fn with<F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Vertex> + Send + Sync + 'static,
    {
        self.register(key, factory);
        self
    }

    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Vertex> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    pub fn create(&self, key: &str) -> Option<Box<dyn Vertex>> {
        self.factories.get(key).map(|factory| factory())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
#[path = "tests/vertex_tests.rs"]
mod tests;
