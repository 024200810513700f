//! Client library: defines and places vertices, registers connections and
//! drives workers over the control protocol.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{CraError, CraErrorCode, Result};
use crate::metadata::{
    ANY_VERSION, DataProvider, NEW_ROW, ShardedVertexInfo, VertexConnectionInfo, VertexInfo,
};
use crate::network::frame::{ConnectRequest, ControlFrame, ControlMessage, LoadVertexRequest};
use crate::network::{Dialer, SecureStreamConnectionDescriptor};
use crate::vertex::sharded::{
    ShardedVertexParameter, ShardingInfo, all_to_all_input, all_to_all_output, shard_vertex_name,
};
use crate::worker::{ConnectionInitiator, ConnectionState, Worker, trace_state};

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// How the shards of two sharded vertices are wired together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardedConnectionKind {
    /// Shard `i` of the source feeds shard `i` of the destination. Both
    /// vertices must have the same shard ids.
    Aligned,
    /// Every source shard feeds every destination shard through per-peer
    /// endpoints named `"{endpoint}${peer_shard}"`.
    AllToAll,
}

pub struct ClientLibrary {
    config: ClientConfig,
    data: DataProvider,
    dialer: Dialer,
}

impl ClientLibrary {
    pub fn new(data: DataProvider, config: ClientConfig) -> Self {
        Self::with_secure(data, config, None)
    }

    pub fn with_secure(
        data: DataProvider,
        config: ClientConfig,
        secure: Option<Arc<dyn SecureStreamConnectionDescriptor>>,
    ) -> Self {
        let dialer = Dialer::new("", 0, config.connection_pool_capacity, secure);
        Self {
            config,
            data,
            dialer,
        }
    }

    pub fn data(&self) -> &DataProvider {
        &self.data
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register a vertex definition: the factory key workers instantiate it
    /// with.
    pub async fn define_vertex(&self, definition: &str, create_action: &str) -> Result<()> {
        self.data
            .vertices
            .insert_or_replace(VertexInfo::definition(definition, create_action, false), ANY_VERSION)
            .await?;
        Ok(())
    }

    pub async fn define_sharded_vertex(&self, definition: &str, create_action: &str) -> Result<()> {
        self.data
            .vertices
            .insert_or_replace(VertexInfo::definition(definition, create_action, true), ANY_VERSION)
            .await?;
        Ok(())
    }

    /// Place `vertex` on `instance` and ask the worker to load it.
    pub async fn instantiate_vertex(
        &self,
        instance: &str,
        vertex: &str,
        definition: &str,
        parameter: Vec<u8>,
    ) -> Result<()> {
        let instance_row = self.place_vertex(instance, vertex, definition, parameter).await?;
        let frame = ControlFrame::with(
            ControlMessage::LoadVertex,
            &LoadVertexRequest {
                vertex_name: vertex.to_string(),
            },
        )?;
        self.send(&instance_row.address, instance_row.port, &frame, |code| {
            CraError::from_code(code, vertex, "")
        })
        .await?;
        tracing::info!(instance = %instance, "instantiated vertex {}", vertex);
        Ok(())
    }

    /// Place `vertex` on a worker hosted by this process and load it
    /// directly. Used for sideloaded workers that refuse dynamic loading.
    pub async fn instantiate_local_vertex(
        &self,
        worker: &Worker,
        vertex: &str,
        definition: &str,
        parameter: Vec<u8>,
    ) -> Result<()> {
        self.place_vertex(worker.instance_name(), vertex, definition, parameter)
            .await?;
        worker.load_vertex(vertex).await
    }

    /// Write the placement row and deactivate rows of the same vertex name on
    /// other instances. Returns the instance row.
    async fn place_vertex(
        &self,
        instance: &str,
        vertex: &str,
        definition: &str,
        parameter: Vec<u8>,
    ) -> Result<VertexInfo> {
        let definition_row = self
            .data
            .vertices
            .get_row_for_vertex_definition(definition)
            .await?
            .ok_or_else(|| CraError::VertexNotFound(definition.to_string()))?;
        let instance_row = self
            .data
            .vertices
            .get_row_for_instance(instance)
            .await?
            .ok_or_else(|| CraError::InstanceNotFound(instance.to_string()))?;
        if let Some(existing) = self.data.vertices.get_row_for_vertex(instance, vertex).await?
            && existing.is_active
        {
            return Err(CraError::VertexAlreadyExists(vertex.to_string()));
        }

        let row = VertexInfo {
            instance_name: instance.to_string(),
            vertex_name: vertex.to_string(),
            vertex_definition: definition.to_string(),
            address: instance_row.address.clone(),
            port: instance_row.port,
            vertex_create_action: definition_row.vertex_create_action,
            vertex_parameter: parameter,
            is_active: true,
            is_sharded: definition_row.is_sharded,
            version_id: String::new(),
        };
        self.data.vertices.insert_or_replace(row, ANY_VERSION).await?;

        for other in self.data.vertices.get_rows_for_vertex(vertex).await? {
            if other.instance_name != instance && other.is_active {
                self.data
                    .vertices
                    .update_row(&other.instance_name, vertex, |row: &mut VertexInfo| {
                        row.is_active = false;
                    })
                    .await?;
                tracing::debug!("deactivated {} on {}", vertex, other.instance_name);
            }
        }
        Ok(instance_row)
    }

    /// Place one shard vertex per shard id and record epoch 0.
    /// `placement` lists the shards each instance hosts.
    pub async fn instantiate_sharded_vertex(
        &self,
        vertex: &str,
        definition: &str,
        placement: &[(String, Vec<u32>)],
        parameter: &[u8],
        shard_locator: &str,
    ) -> Result<ShardedVertexInfo> {
        if self
            .data
            .sharded_vertices
            .get_latest_entry_for_vertex(vertex)
            .await?
            .is_some()
        {
            return Err(CraError::VertexAlreadyExists(vertex.to_string()));
        }
        let mut shard_ids: Vec<u32> = placement.iter().flat_map(|(_, s)| s.iter().copied()).collect();
        shard_ids.sort_unstable();
        shard_ids.dedup();
        let epoch = ShardedVertexInfo {
            vertex_name: vertex.to_string(),
            epoch_id: 0,
            all_instances: placement.iter().map(|(i, _)| i.clone()).collect(),
            all_shards: placement.iter().map(|(_, s)| s.clone()).collect(),
            added_shards: shard_ids,
            removed_shards: Vec::new(),
            shard_locator: shard_locator.to_string(),
            version_id: String::new(),
        };
        let epoch = self.record_epoch(epoch).await?;
        self.instantiate_shards(&epoch, definition, placement, parameter)
            .await?;
        Ok(epoch)
    }

    pub async fn latest_sharded_vertex(&self, vertex: &str) -> Result<Option<ShardedVertexInfo>> {
        self.data
            .sharded_vertices
            .get_latest_entry_for_vertex(vertex)
            .await
    }

    /// Append an epoch adding `placement`'s shards and instantiate them.
    pub async fn add_shards(
        &self,
        vertex: &str,
        definition: &str,
        placement: &[(String, Vec<u32>)],
        parameter: &[u8],
    ) -> Result<ShardedVertexInfo> {
        let latest = self.require_latest(vertex).await?;
        let existing: BTreeSet<u32> = latest.shard_ids().into_iter().collect();
        let mut next = latest.clone();
        next.epoch_id = latest.epoch_id + 1;
        next.added_shards.clear();
        next.removed_shards.clear();
        next.version_id.clear();

        for (instance, shards) in placement {
            if let Some(&dup) = shards.iter().find(|shard| existing.contains(shard)) {
                return Err(CraError::VertexAlreadyExists(shard_vertex_name(vertex, dup)));
            }
            match next.all_instances.iter().position(|i| i == instance) {
                Some(index) => next.all_shards[index].extend(shards.iter().copied()),
                None => {
                    next.all_instances.push(instance.clone());
                    next.all_shards.push(shards.clone());
                }
            }
            next.added_shards.extend(shards.iter().copied());
        }
        next.added_shards.sort_unstable();

        let epoch = self.record_epoch(next).await?;
        self.instantiate_shards(&epoch, definition, placement, parameter)
            .await?;
        Ok(epoch)
    }

    /// Append an epoch without `shards` and delete their shard vertices.
    pub async fn remove_shards(&self, vertex: &str, shards: &[u32]) -> Result<ShardedVertexInfo> {
        let latest = self.require_latest(vertex).await?;
        let existing = latest.shard_ids();
        if let Some(&missing) = shards.iter().find(|shard| !existing.contains(shard)) {
            return Err(CraError::VertexNotFound(shard_vertex_name(vertex, missing)));
        }

        let mut next = latest.clone();
        next.epoch_id = latest.epoch_id + 1;
        next.added_shards.clear();
        next.removed_shards = shards.to_vec();
        next.version_id.clear();
        for hosted in &mut next.all_shards {
            hosted.retain(|shard| !shards.contains(shard));
        }
        let mut index = 0;
        while index < next.all_instances.len() {
            if next.all_shards[index].is_empty() {
                next.all_instances.remove(index);
                next.all_shards.remove(index);
            } else {
                index += 1;
            }
        }

        let epoch = self.record_epoch(next).await?;
        for &shard in shards {
            self.delete_plain_vertex(&shard_vertex_name(vertex, shard))
                .await?;
        }
        Ok(epoch)
    }

    async fn require_latest(&self, vertex: &str) -> Result<ShardedVertexInfo> {
        self.latest_sharded_vertex(vertex)
            .await?
            .ok_or_else(|| CraError::VertexNotFound(vertex.to_string()))
    }

    async fn record_epoch(&self, epoch: ShardedVertexInfo) -> Result<ShardedVertexInfo> {
        let vertex = epoch.vertex_name.clone();
        match self.data.sharded_vertices.add_epoch(epoch).await {
            Err(CraError::VersionConflict { .. }) => Err(CraError::VertexAlreadyExists(vertex)),
            other => other,
        }
    }

    async fn instantiate_shards(
        &self,
        epoch: &ShardedVertexInfo,
        definition: &str,
        placement: &[(String, Vec<u32>)],
        parameter: &[u8],
    ) -> Result<()> {
        let sharding = ShardingInfo::from_epoch(epoch);
        for (instance, shards) in placement {
            for &shard in shards {
                let shard_parameter = ShardedVertexParameter {
                    shard_id: shard,
                    sharding: sharding.clone(),
                    parameter: parameter.to_vec(),
                }
                .to_bytes()?;
                self.instantiate_vertex(
                    instance,
                    &shard_vertex_name(&epoch.vertex_name, shard),
                    definition,
                    shard_parameter,
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn connect(
        &self,
        from_vertex: &str,
        from_endpoint: &str,
        to_vertex: &str,
        to_endpoint: &str,
    ) -> Result<()> {
        self.connect_with(
            from_vertex,
            from_endpoint,
            to_vertex,
            to_endpoint,
            ConnectionInitiator::Auto,
        )
        .await
    }

    /// Validate both ends, register the connection row and have the chosen
    /// initiator establish the stream.
    pub async fn connect_with(
        &self,
        from_vertex: &str,
        from_endpoint: &str,
        to_vertex: &str,
        to_endpoint: &str,
        initiator: ConnectionInitiator,
    ) -> Result<()> {
        let request = ConnectRequest::new(from_vertex, from_endpoint, to_vertex, to_endpoint);
        trace_state(&request, ConnectionState::ResolveEndpoints);
        let from_row = self.resolve_active(from_vertex).await?;
        let to_row = self.resolve_active(to_vertex).await?;
        self.validate_endpoints(&request).await?;

        let info = VertexConnectionInfo::new(from_vertex, from_endpoint, to_vertex, to_endpoint);
        if !self.register_connection(&info).await? {
            tracing::debug!(connection = %request, "connection already registered");
            return Ok(());
        }

        let initiator = initiator.resolve(
            self.config.local_instance.as_deref(),
            &from_row.instance_name,
            &to_row.instance_name,
        );
        trace_state(&request, ConnectionState::ChooseInitiator);
        let (row, message) = match initiator {
            ConnectionInitiator::ToSide => (&to_row, ControlMessage::ConnectVertexInitiatorReverse),
            _ => (&from_row, ControlMessage::ConnectVertexInitiator),
        };
        let (address, port) = self.instance_address(row).await?;
        let frame = ControlFrame::with(message, &request)?;
        let result = self
            .send(&address, port, &frame, |code| connect_error(code, &request))
            .await;
        if let Err(err) = result {
            tracing::warn!(connection = %request, "connect failed: {}", err);
            if let Err(cleanup) = self.data.connections.delete(&info).await {
                tracing::warn!("could not remove row of {}: {}", request, cleanup);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Wire every shard-level edge between two sharded vertices. Returns the
    /// number of shard connections made.
    pub async fn connect_sharded(
        &self,
        from_vertex: &str,
        from_endpoint: &str,
        to_vertex: &str,
        to_endpoint: &str,
        kind: ShardedConnectionKind,
    ) -> Result<usize> {
        let from_shards = self.require_latest(from_vertex).await?.shard_ids();
        let to_shards = self.require_latest(to_vertex).await?.shard_ids();
        let mut made = 0;
        match kind {
            ShardedConnectionKind::Aligned => {
                if from_shards != to_shards {
                    return Err(CraError::VerticesEndpointsNotMatched {
                        from: from_vertex.to_string(),
                        to: to_vertex.to_string(),
                    });
                }
                for &shard in &from_shards {
                    self.connect(
                        &shard_vertex_name(from_vertex, shard),
                        from_endpoint,
                        &shard_vertex_name(to_vertex, shard),
                        to_endpoint,
                    )
                    .await?;
                    made += 1;
                }
            }
            ShardedConnectionKind::AllToAll => {
                for &from_shard in &from_shards {
                    for &to_shard in &to_shards {
                        self.connect(
                            &shard_vertex_name(from_vertex, from_shard),
                            &all_to_all_output(from_endpoint, to_shard),
                            &shard_vertex_name(to_vertex, to_shard),
                            &all_to_all_input(to_endpoint, from_shard),
                        )
                        .await?;
                        made += 1;
                    }
                }
            }
        }
        Ok(made)
    }

    /// Delete the connection row and ask both hosting workers to cancel the
    /// bound endpoints.
    pub async fn disconnect(
        &self,
        from_vertex: &str,
        from_endpoint: &str,
        to_vertex: &str,
        to_endpoint: &str,
    ) -> Result<()> {
        let info = VertexConnectionInfo::new(from_vertex, from_endpoint, to_vertex, to_endpoint);
        if let Some(row) = self.data.connections.get_connection(&info).await? {
            self.data.connections.delete(&row).await?;
        }

        let request = ConnectRequest::from(&info);
        let frame = ControlFrame::with(ControlMessage::DisconnectVertex, &request)?;
        let mut instances = BTreeSet::new();
        for vertex in [from_vertex, to_vertex] {
            if let Some(row) = self.data.vertices.get_row_for_active_vertex(vertex).await? {
                instances.insert(row.instance_name);
            }
        }
        for instance in instances {
            let Some(row) = self.data.vertices.get_row_for_instance(&instance).await? else {
                continue;
            };
            if let Err(err) = self
                .send(&row.address, row.port, &frame, |code| connect_error(code, &request))
                .await
            {
                tracing::warn!("disconnect of {} on {} failed: {}", request, instance, err);
            }
        }
        Ok(())
    }

    /// Unload and delete a vertex with its endpoints and connections. For a
    /// sharded vertex every shard and epoch goes too.
    pub async fn delete_vertex(&self, vertex: &str) -> Result<()> {
        if let Some(latest) = self.latest_sharded_vertex(vertex).await? {
            for shard in latest.shard_ids() {
                self.delete_plain_vertex(&shard_vertex_name(vertex, shard))
                    .await?;
            }
            self.data.sharded_vertices.delete_vertex(vertex).await?;
        }
        self.delete_plain_vertex(vertex).await
    }

    async fn delete_plain_vertex(&self, vertex: &str) -> Result<()> {
        let frame = ControlFrame::with(
            ControlMessage::UnloadVertex,
            &LoadVertexRequest {
                vertex_name: vertex.to_string(),
            },
        )?;
        for row in self.data.vertices.get_rows_for_vertex(vertex).await? {
            if row.is_active {
                let (address, port) = self.instance_address(&row).await?;
                match self
                    .send(&address, port, &frame, |code| CraError::from_code(code, vertex, ""))
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => tracing::warn!(
                        "unload of {} on {} failed: {}",
                        vertex,
                        row.instance_name,
                        err
                    ),
                }
            }
            self.data.vertices.delete(&row).await?;
        }
        self.data.endpoints.delete_endpoints(vertex).await?;
        let (outgoing, incoming) = self.vertex_connections(vertex).await?;
        for connection in outgoing.iter().chain(&incoming) {
            self.data.connections.delete(connection).await?;
        }
        tracing::info!("deleted vertex {}", vertex);
        Ok(())
    }

    /// Mark every placement of `vertex` inactive. Hosted instances keep running.
    pub async fn deactivate_vertex(&self, vertex: &str) -> Result<()> {
        for row in self.data.vertices.get_rows_for_vertex(vertex).await? {
            if row.is_active {
                self.data
                    .vertices
                    .update_row(&row.instance_name, vertex, |row: &mut VertexInfo| {
                        row.is_active = false;
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// True iff the instance has a row and answers a ping.
    pub async fn is_instance_alive(&self, instance: &str) -> Result<bool> {
        let Some(row) = self.data.vertices.get_row_for_instance(instance).await? else {
            return Ok(false);
        };
        let ping = ControlFrame::empty(ControlMessage::Ping);
        match tokio::time::timeout(PING_TIMEOUT, self.dialer.call(&row.address, row.port, &ping)).await {
            Ok(Ok(code)) => Ok(code == CraErrorCode::Success),
            Ok(Err(err)) => {
                tracing::debug!("ping of {} failed: {}", instance, err);
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    pub async fn instance_names(&self) -> Result<Vec<String>> {
        self.data.vertices.get_instance_names().await
    }

    pub async fn vertex_names(&self) -> Result<Vec<String>> {
        self.data.vertices.get_vertex_names().await
    }

    /// Outgoing and incoming connections of `vertex`.
    pub async fn vertex_connections(
        &self,
        vertex: &str,
    ) -> Result<(Vec<VertexConnectionInfo>, Vec<VertexConnectionInfo>)> {
        let outgoing = self.data.connections.get_connections_from(vertex).await?;
        let incoming = self.data.connections.get_connections_to(vertex).await?;
        Ok((outgoing, incoming))
    }

    pub async fn delete_instance(&self, instance: &str) -> Result<()> {
        self.data.vertices.delete_instance(instance).await
    }

    /// Delete every metadata row and blob, then drop pooled streams.
    pub async fn reset(&self) -> Result<()> {
        self.data.reset().await?;
        self.free();
        Ok(())
    }

    pub fn free(&self) -> usize {
        self.dialer.free()
    }

    pub fn created_connections(&self) -> usize {
        self.dialer.pools().created_count()
    }

    async fn resolve_active(&self, vertex: &str) -> Result<VertexInfo> {
        let rows = self.data.vertices.get_rows_for_vertex(vertex).await?;
        if rows.is_empty() {
            return Err(CraError::VertexNotFound(vertex.to_string()));
        }
        rows.into_iter()
            .find(|row| row.is_active)
            .ok_or_else(|| CraError::ActiveVertexNotFound(vertex.to_string()))
    }

    async fn validate_endpoints(&self, request: &ConnectRequest) -> Result<()> {
        let from = self
            .data
            .endpoints
            .get_endpoint(&request.from_vertex, &request.from_endpoint)
            .await?
            .ok_or_else(|| CraError::VertexEndpointNotFound {
                vertex: request.from_vertex.clone(),
                endpoint: request.from_endpoint.clone(),
            })?;
        if from.is_input {
            return Err(CraError::VertexOutputNotFound {
                vertex: request.from_vertex.clone(),
                endpoint: request.from_endpoint.clone(),
            });
        }
        let to = self
            .data
            .endpoints
            .get_endpoint(&request.to_vertex, &request.to_endpoint)
            .await?
            .ok_or_else(|| CraError::VertexEndpointNotFound {
                vertex: request.to_vertex.clone(),
                endpoint: request.to_endpoint.clone(),
            })?;
        if !to.is_input {
            return Err(CraError::VertexInputNotFound {
                vertex: request.to_vertex.clone(),
                endpoint: request.to_endpoint.clone(),
            });
        }
        if from.is_async != to.is_async {
            return Err(CraError::VerticesEndpointsNotMatched {
                from: format!("{}.{}", request.from_vertex, request.from_endpoint),
                to: format!("{}.{}", request.to_vertex, request.to_endpoint),
            });
        }
        Ok(())
    }

    /// Insert the row expecting it to be new. Returns false if an identical
    /// row was already registered.
    async fn register_connection(&self, info: &VertexConnectionInfo) -> Result<bool> {
        let mut raced = false;
        loop {
            match self.data.connections.add(info.clone(), NEW_ROW).await {
                Ok(_) => return Ok(true),
                Err(CraError::VersionConflict { .. }) => {
                    if self.data.connections.get_connection(info).await?.is_some() {
                        return Ok(false);
                    }
                    if raced {
                        return Err(CraError::ConnectionAdditionRace(info.to_string()));
                    }
                    raced = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn instance_address(&self, row: &VertexInfo) -> Result<(String, u16)> {
        Ok(
            match self.data.vertices.get_row_for_instance(&row.instance_name).await? {
                Some(instance) => (instance.address, instance.port),
                None => (row.address.clone(), row.port),
            },
        )
    }

    /// One control round trip, retrying while the worker is recovering.
    async fn send<F>(&self, address: &str, port: u16, frame: &ControlFrame, to_error: F) -> Result<()>
    where
        F: Fn(CraErrorCode) -> Option<CraError>,
    {
        let mut attempts = 0;
        loop {
            let code = self.dialer.call(address, port, frame).await?;
            match code {
                CraErrorCode::Success => return Ok(()),
                CraErrorCode::ServerRecovering if attempts < self.config.recovering_retries => {
                    attempts += 1;
                    tracing::debug!("{}:{} is recovering, retry {}", address, port, attempts);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                other => {
                    return Err(to_error(other).unwrap_or_else(|| {
                        CraError::Protocol(format!("unexpected reply {other:?}"))
                    }));
                }
            }
        }
    }
}

/// Name the side of `request` a reply code refers to.
fn connect_error(code: CraErrorCode, request: &ConnectRequest) -> Option<CraError> {
    match code {
        CraErrorCode::VertexOutputNotFound => {
            CraError::from_code(code, &request.from_vertex, &request.from_endpoint)
        }
        CraErrorCode::VertexInputNotFound => {
            CraError::from_code(code, &request.to_vertex, &request.to_endpoint)
        }
        CraErrorCode::ConnectionEstablishFailed => Some(CraError::ConnectionEstablishFailed(
            request.to_string(),
        )),
        _ => CraError::from_code(code, &request.to_string(), ""),
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
