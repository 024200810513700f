//! Worker runtime: hosts vertices, answers control requests and runs both
//! roles of the connection protocol.

mod protocol;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{CraError, CraErrorCode, Result};
use crate::metadata::{ANY_VERSION, DataProvider, EndpointInfo, VertexInfo};
use crate::network::frame::{
    ConnectRequest, ControlFrame, ControlMessage, LoadVertexRequest, try_read_frame, write_frame,
};
use crate::network::{BoxedStream, Dialer, SecureStreamConnectionDescriptor, StreamConnection};
use crate::vertex::{AsyncInputEndpoint, AsyncOutputEndpoint, Vertex, VertexContext, VertexRegistry};

pub use protocol::{ConnectionInitiator, ConnectionState};
pub(crate) use protocol::trace_state;

/// A running worker instance.
pub struct Worker {
    inner: Arc<WorkerInner>,
    heartbeat_shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct WorkerInner {
    config: WorkerConfig,
    address: String,
    port: u16,
    data: DataProvider,
    registry: Arc<VertexRegistry>,
    secure: Option<Arc<dyn SecureStreamConnectionDescriptor>>,
    dialer: Dialer,
    vertices: RwLock<HashMap<String, HostedVertex>>,
    // Keyed by the local (vertex, endpoint) a live connection occupies.
    bindings: Mutex<HashMap<(String, String), Binding>>,
    recovering: watch::Sender<bool>,
    shutdown: CancellationToken,
}

struct HostedVertex {
    vertex: Box<dyn Vertex>,
    inputs: HashMap<String, Arc<dyn AsyncInputEndpoint>>,
    outputs: HashMap<String, Arc<dyn AsyncOutputEndpoint>>,
}

struct Binding {
    connection: ConnectRequest,
    token: CancellationToken,
}

#[derive(Clone)]
enum LocalEndpoint {
    Input(Arc<dyn AsyncInputEndpoint>),
    Output(Arc<dyn AsyncOutputEndpoint>),
}

impl LocalEndpoint {
    async fn run(
        &self,
        stream: &mut BoxedStream,
        request: &ConnectRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            LocalEndpoint::Input(input) => {
                input
                    .from_stream(stream, &request.from_vertex, &request.from_endpoint, cancel)
                    .await
            }
            LocalEndpoint::Output(output) => {
                output
                    .to_stream(stream, &request.to_vertex, &request.to_endpoint, cancel)
                    .await
            }
        }
    }
}

enum Session {
    Continue,
    Close,
}

impl Worker {
    /// Bind the listen socket, publish the instance row and start serving.
    pub async fn start(
        config: WorkerConfig,
        data: DataProvider,
        registry: Arc<VertexRegistry>,
        secure: Option<Arc<dyn SecureStreamConnectionDescriptor>>,
    ) -> Result<Self> {
        let ip = config.resolved_ip();
        let bind_ip = if ip.is_loopback() {
            ip
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, config.port)).await?;
        let port = listener.local_addr()?.port();
        let address = ip.to_string();

        data.vertices
            .insert_or_replace(
                VertexInfo::instance(&config.instance_name, &address, port),
                ANY_VERSION,
            )
            .await?;

        let (recovering, _) = watch::channel(config.recover_on_start);
        let inner = Arc::new(WorkerInner {
            dialer: Dialer::new(
                address.clone(),
                port,
                config.connection_pool_capacity,
                secure.clone(),
            ),
            config,
            address,
            port,
            data,
            registry,
            secure,
            vertices: RwLock::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            recovering,
            shutdown: CancellationToken::new(),
        });
        tracing::info!(
            instance = %inner.config.instance_name,
            "worker listening on {}:{}",
            inner.address,
            inner.port
        );

        let mut tasks = vec![tokio::spawn(Arc::clone(&inner).accept_loop(listener))];
        let (heartbeat_shutdown, heartbeat) = Arc::clone(&inner).spawn_heartbeat_loop();
        tasks.push(heartbeat);
        if inner.config.recover_on_start {
            tasks.push(tokio::spawn(Arc::clone(&inner).recover()));
        }

        Ok(Self {
            inner,
            heartbeat_shutdown,
            tasks,
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.config.instance_name
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn data(&self) -> &DataProvider {
        &self.inner.data
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.is_recovering()
    }

    pub async fn wait_recovered(&self) {
        let mut rx = self.inner.recovering.subscribe();
        let _ = rx.wait_for(|recovering| !*recovering).await;
    }

    /// Instantiate the vertex described by this instance's row for `vertex`.
    pub async fn load_vertex(&self, vertex: &str) -> Result<()> {
        self.inner.load_vertex(vertex).await
    }

    pub async fn unload_vertex(&self, vertex: &str) -> Result<()> {
        self.inner.unload_vertex(vertex).await
    }

    /// Establish `request` with this worker as the initiator. `reverse`
    /// means this worker hosts the input side.
    pub async fn connect(&self, request: &ConnectRequest, reverse: bool) -> Result<()> {
        self.inner.connect(request, reverse).await
    }

    /// Cancel every live connection matching `request`.
    pub fn disconnect(&self, request: &ConnectRequest) -> usize {
        self.inner.disconnect_local(request)
    }

    pub fn hosted_vertices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .vertices
            .read()
            .expect("vertices poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn bound_endpoint_count(&self) -> usize {
        self.inner.bindings.lock().expect("bindings poisoned").len()
    }

    /// Sockets this worker opened to peers.
    pub fn created_connections(&self) -> usize {
        self.inner.dialer.pools().created_count()
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.dialer.pools().idle_count()
    }

    /// Stop serving, cancel every endpoint loop and close pooled streams.
    /// Metadata rows are left in place so a restart can recover them.
    pub async fn shutdown(mut self) {
        self.inner.shutdown.cancel();
        let _ = self.heartbeat_shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                tracing::warn!("worker task failed during shutdown: {}", err);
            }
        }
        let hosted: Vec<HostedVertex> = self
            .inner
            .vertices
            .write()
            .expect("vertices poisoned")
            .drain()
            .map(|(_, hosted)| hosted)
            .collect();
        for hosted in hosted {
            hosted.vertex.dispose().await;
        }
        self.inner.dialer.free();
        tracing::info!(instance = %self.inner.config.instance_name, "worker stopped");
    }
}

/// A dropped worker stops accepting and heartbeating. Hosted vertices are
/// only disposed by [`Worker::shutdown`].
impl Drop for Worker {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        let _ = self.heartbeat_shutdown.send(true);
    }
}

impl WorkerInner {
    fn instance(&self) -> &str {
        &self.config.instance_name
    }

    fn is_recovering(&self) -> bool {
        *self.recovering.borrow()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay for {} failed: {}", peer, err);
                    }
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = this.serve_connection(Box::new(stream)).await {
                            tracing::warn!("control session with {} failed: {}", peer, err);
                        }
                    });
                }
                Err(err) => tracing::warn!("accept failed: {}", err),
            }
        }
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.heartbeat.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.send_heartbeat().await {
                            tracing::warn!("heartbeat for {} failed: {}", self.instance(), err);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        (shutdown_tx, handle)
    }

    /// Refresh the instance row; recreate it if it was deleted.
    async fn send_heartbeat(&self) -> Result<()> {
        let address = self.address.clone();
        let port = self.port;
        let updated = self
            .data
            .vertices
            .update_row(self.instance(), "", |row| {
                row.address = address.clone();
                row.port = port;
                row.is_active = true;
            })
            .await?;
        if updated.is_none() {
            self.data
                .vertices
                .insert_or_replace(
                    VertexInfo::instance(self.instance(), &self.address, self.port),
                    ANY_VERSION,
                )
                .await?;
        }
        Ok(())
    }

    async fn recover(self: Arc<Self>) {
        if let Err(err) = self.recover_vertices().await {
            tracing::warn!("recovery of {} failed: {}", self.instance(), err);
        }
        self.recovering.send_replace(false);
        tracing::info!(instance = %self.instance(), "recovery complete");
    }

    /// Reload every active vertex placed on this instance and re-establish
    /// the stored connections touching them.
    async fn recover_vertices(self: &Arc<Self>) -> Result<()> {
        let rows = self.data.vertices.get_rows_for_instance(self.instance()).await?;
        let mut loaded = Vec::new();
        for row in rows.into_iter().filter(|row| row.is_active) {
            match self.load_vertex(&row.vertex_name).await {
                Ok(()) => loaded.push(row.vertex_name),
                Err(err) => tracing::warn!("could not reload {}: {}", row.vertex_name, err),
            }
        }

        for vertex in &loaded {
            for connection in self.data.connections.get_connections_from(vertex).await? {
                let request = ConnectRequest::from(&connection);
                if let Err(err) = self.connect(&request, false).await {
                    tracing::warn!("could not restore {}: {}", request, err);
                }
            }
            for connection in self.data.connections.get_connections_to(vertex).await? {
                // Outgoing pass already covered wires between local vertices.
                if loaded.contains(&connection.from_vertex) {
                    continue;
                }
                let request = ConnectRequest::from(&connection);
                if let Err(err) = self.connect(&request, true).await {
                    tracing::warn!("could not restore {}: {}", request, err);
                }
            }
        }
        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: BoxedStream) -> Result<()> {
        let mut stream = match &self.secure {
            Some(secure) => secure.create_secure_server(stream).await.map_err(|err| {
                CraError::ConnectionEstablishFailed(format!("secure handshake failed: {err}"))
            })?,
            None => stream,
        };

        let result = self.serve_frames(&mut stream).await;
        let teardown = match &self.secure {
            Some(secure) => secure.teardown_secure_server(stream).await,
            None => stream.shutdown().await.map_err(anyhow::Error::from),
        };
        if let Err(err) = teardown {
            tracing::debug!("control stream teardown failed: {}", err);
        }
        result
    }

    async fn serve_frames(self: &Arc<Self>, stream: &mut BoxedStream) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = try_read_frame(stream) => frame.map_err(|err| CraError::Protocol(err.to_string()))?,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            match self.dispatch(stream, frame).await? {
                Session::Continue => {}
                Session::Close => return Ok(()),
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, stream: &mut BoxedStream, frame: ControlFrame) -> Result<Session> {
        match frame.message {
            ControlMessage::Ping => {
                reply(stream, CraErrorCode::Success).await?;
            }
            ControlMessage::Release => return Ok(Session::Close),
            ControlMessage::LoadVertex => {
                let request: LoadVertexRequest = parse(&frame)?;
                let code = if self.is_recovering() {
                    CraErrorCode::ServerRecovering
                } else if !self.config.allow_dynamic_loading {
                    code_of(Err(CraError::Unsupported(format!(
                        "{} does not load vertices on request",
                        self.instance()
                    ))))
                } else {
                    code_of(self.load_vertex(&request.vertex_name).await)
                };
                reply(stream, code).await?;
            }
            ControlMessage::UnloadVertex => {
                let request: LoadVertexRequest = parse(&frame)?;
                let code = code_of(self.unload_vertex(&request.vertex_name).await);
                reply(stream, code).await?;
            }
            ControlMessage::DisconnectVertex => {
                let request: ConnectRequest = parse(&frame)?;
                let cancelled = self.disconnect_local(&request);
                tracing::debug!("disconnect {} cancelled {} endpoint(s)", request, cancelled);
                reply(stream, CraErrorCode::Success).await?;
            }
            ControlMessage::ConnectVertexInitiator | ControlMessage::ConnectVertexInitiatorReverse => {
                let request: ConnectRequest = parse(&frame)?;
                let reverse = frame.message == ControlMessage::ConnectVertexInitiatorReverse;
                let code = if self.is_recovering() {
                    CraErrorCode::ServerRecovering
                } else {
                    code_of(self.connect(&request, reverse).await)
                };
                reply(stream, code).await?;
            }
            ControlMessage::ConnectVertexReceiver | ControlMessage::ConnectVertexReceiverReverse => {
                let request: ConnectRequest = parse(&frame)?;
                let reverse = frame.message == ControlMessage::ConnectVertexReceiverReverse;
                return self.receive(stream, request, reverse).await;
            }
            ControlMessage::Ready => {
                return Err(CraError::Protocol("unexpected Ready frame".to_string()));
            }
        }
        Ok(Session::Continue)
    }

    /// Receiver role: validate, acknowledge and hand the stream to the
    /// local endpoint. The session resumes serving frames afterwards.
    async fn receive(
        &self,
        stream: &mut BoxedStream,
        request: ConnectRequest,
        reverse: bool,
    ) -> Result<Session> {
        trace_state(&request, ConnectionState::ConnectVertexReceiver);
        if self.is_recovering() {
            reply(stream, CraErrorCode::ServerRecovering).await?;
            return Ok(Session::Continue);
        }

        // The receiver hosts the input unless the connection is reversed.
        let (vertex, endpoint) = local_side(&request, !reverse);
        let token = self.shutdown.child_token();
        let resolved = if reverse {
            self.output(vertex, endpoint).map(LocalEndpoint::Output)
        } else {
            self.input(vertex, endpoint).map(LocalEndpoint::Input)
        };
        let bound = resolved.and_then(|local| {
            self.bind(vertex, endpoint, &request, token.clone())
                .map(|()| local)
        });
        let local = match bound {
            Ok(local) => local,
            Err(err) => {
                tracing::warn!("rejecting {}: {}", request, err);
                reply(stream, err.code()).await?;
                return Ok(Session::Continue);
            }
        };

        if let Err(err) = reply(stream, CraErrorCode::Success).await {
            self.unbind(vertex, endpoint);
            return Err(err);
        }
        trace_state(&request, ConnectionState::DataStreaming);
        let result = local.run(stream, &request, token.clone()).await;
        self.unbind(vertex, endpoint);

        match result {
            Ok(()) if !token.is_cancelled() => {
                trace_state(&request, ConnectionState::Release);
                Ok(Session::Continue)
            }
            Ok(()) => Ok(Session::Close),
            Err(err) => {
                trace_state(&request, ConnectionState::Error);
                tracing::warn!("stream for {} failed: {}", request, err);
                Ok(Session::Close)
            }
        }
    }

    /// Initiator role. Returns once the peer accepted the connection; the
    /// data transfer continues in the background.
    async fn connect(self: &Arc<Self>, request: &ConnectRequest, reverse: bool) -> Result<()> {
        trace_state(request, ConnectionState::ConnectVertexInitiator);
        let (local_vertex, local_endpoint) = local_side(request, reverse);
        let (remote_vertex, remote_endpoint) = local_side(request, !reverse);
        let local = if reverse {
            LocalEndpoint::Input(self.input(local_vertex, local_endpoint)?)
        } else {
            LocalEndpoint::Output(self.output(local_vertex, local_endpoint)?)
        };

        let remote = self
            .data
            .vertices
            .get_row_for_active_vertex(remote_vertex)
            .await?
            .ok_or_else(|| CraError::ActiveVertexNotFound(remote_vertex.to_string()))?;
        if remote.instance_name == self.instance() && self.try_fuse(request)? {
            return Ok(());
        }
        let (address, port) = match self
            .data
            .vertices
            .get_row_for_instance(&remote.instance_name)
            .await?
        {
            Some(instance) => (instance.address, instance.port),
            None => (remote.address.clone(), remote.port),
        };

        let token = self.shutdown.child_token();
        self.bind(local_vertex, local_endpoint, request, token.clone())?;
        let message = if reverse {
            ControlMessage::ConnectVertexReceiverReverse
        } else {
            ControlMessage::ConnectVertexReceiver
        };
        let (reply, conn) = match self.handshake(&address, port, message, request).await {
            Ok(exchanged) => exchanged,
            Err(err) => {
                self.unbind(local_vertex, local_endpoint);
                trace_state(request, ConnectionState::Error);
                return Err(err);
            }
        };
        if reply != CraErrorCode::Success {
            self.unbind(local_vertex, local_endpoint);
            self.dialer.checkin(conn).await;
            trace_state(request, ConnectionState::Error);
            return Err(CraError::from_code(reply, remote_vertex, remote_endpoint)
                .unwrap_or_else(|| CraError::Protocol(format!("unexpected reply {reply:?}"))));
        }

        trace_state(request, ConnectionState::DataStreaming);
        let this = Arc::clone(self);
        let request = request.clone();
        tokio::spawn(async move {
            this.stream_initiated(conn, local, request, token).await;
        });
        Ok(())
    }

    async fn handshake(
        &self,
        address: &str,
        port: u16,
        message: ControlMessage,
        request: &ConnectRequest,
    ) -> Result<(CraErrorCode, StreamConnection)> {
        let frame = ControlFrame::with(message, request)?;
        let (reply, conn) = self.dialer.request(address, port, &frame).await?;
        let code = reply
            .ready_code()
            .map_err(|err| CraError::Protocol(err.to_string()))?;
        Ok((code, conn))
    }

    async fn stream_initiated(
        &self,
        mut conn: StreamConnection,
        local: LocalEndpoint,
        request: ConnectRequest,
        token: CancellationToken,
    ) {
        let result = local.run(&mut conn.stream, &request, token.clone()).await;
        let reverse = matches!(local, LocalEndpoint::Input(_));
        let (vertex, endpoint) = local_side(&request, reverse);
        self.unbind(vertex, endpoint);

        match result {
            Ok(()) if !token.is_cancelled() => {
                trace_state(&request, ConnectionState::Release);
                self.dialer.checkin(conn).await;
            }
            Ok(()) => self.dialer.dispose(conn).await,
            Err(err) => {
                trace_state(&request, ConnectionState::Error);
                tracing::warn!("stream for {} failed: {}", request, err);
            }
        }
    }

    /// Wire two co-located endpoints in-process. Returns false if the
    /// output declines fusion.
    fn try_fuse(self: &Arc<Self>, request: &ConnectRequest) -> Result<bool> {
        let output = self.output(&request.from_vertex, &request.from_endpoint)?;
        let input = self.input(&request.to_vertex, &request.to_endpoint)?;
        if !output.can_fuse_with(input.as_ref(), &request.to_vertex, &request.to_endpoint) {
            return Ok(false);
        }

        let token = self.shutdown.child_token();
        self.bind(&request.from_vertex, &request.from_endpoint, request, token.clone())?;
        if let Err(err) = self.bind(&request.to_vertex, &request.to_endpoint, request, token.clone()) {
            self.unbind(&request.from_vertex, &request.from_endpoint);
            return Err(err);
        }
        tracing::debug!("fusing {} in-process", request);
        trace_state(request, ConnectionState::DataStreaming);

        let this = Arc::clone(self);
        let request = request.clone();
        tokio::spawn(async move {
            let result = output
                .to_input(
                    input,
                    &request.from_vertex,
                    &request.from_endpoint,
                    &request.to_vertex,
                    &request.to_endpoint,
                    token,
                )
                .await;
            this.unbind(&request.from_vertex, &request.from_endpoint);
            this.unbind(&request.to_vertex, &request.to_endpoint);
            match result {
                Ok(()) => trace_state(&request, ConnectionState::Release),
                Err(err) => {
                    trace_state(&request, ConnectionState::Error);
                    tracing::warn!("fused stream for {} failed: {}", request, err);
                }
            }
        });
        Ok(true)
    }

    fn input(&self, vertex: &str, endpoint: &str) -> Result<Arc<dyn AsyncInputEndpoint>> {
        let vertices = self.vertices.read().expect("vertices poisoned");
        let hosted = vertices
            .get(vertex)
            .ok_or_else(|| CraError::VertexNotFound(vertex.to_string()))?;
        hosted
            .inputs
            .get(endpoint)
            .cloned()
            .ok_or_else(|| CraError::VertexInputNotFound {
                vertex: vertex.to_string(),
                endpoint: endpoint.to_string(),
            })
    }

    fn output(&self, vertex: &str, endpoint: &str) -> Result<Arc<dyn AsyncOutputEndpoint>> {
        let vertices = self.vertices.read().expect("vertices poisoned");
        let hosted = vertices
            .get(vertex)
            .ok_or_else(|| CraError::VertexNotFound(vertex.to_string()))?;
        hosted
            .outputs
            .get(endpoint)
            .cloned()
            .ok_or_else(|| CraError::VertexOutputNotFound {
                vertex: vertex.to_string(),
                endpoint: endpoint.to_string(),
            })
    }

    fn bind(
        &self,
        vertex: &str,
        endpoint: &str,
        request: &ConnectRequest,
        token: CancellationToken,
    ) -> Result<()> {
        let mut bindings = self.bindings.lock().expect("bindings poisoned");
        let key = (vertex.to_string(), endpoint.to_string());
        if bindings.contains_key(&key) {
            return Err(CraError::ConnectionEstablishFailed(format!(
                "{vertex}.{endpoint} is already connected"
            )));
        }
        bindings.insert(
            key,
            Binding {
                connection: request.clone(),
                token,
            },
        );
        Ok(())
    }

    fn unbind(&self, vertex: &str, endpoint: &str) {
        self.bindings
            .lock()
            .expect("bindings poisoned")
            .remove(&(vertex.to_string(), endpoint.to_string()));
    }

    fn disconnect_local(&self, request: &ConnectRequest) -> usize {
        let mut bindings = self.bindings.lock().expect("bindings poisoned");
        let mut cancelled = 0;
        bindings.retain(|_, binding| {
            if binding.connection == *request {
                binding.token.cancel();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    async fn load_vertex(&self, vertex_name: &str) -> Result<()> {
        if self
            .vertices
            .read()
            .expect("vertices poisoned")
            .contains_key(vertex_name)
        {
            return Err(CraError::VertexAlreadyExists(vertex_name.to_string()));
        }
        let row = self
            .data
            .vertices
            .get_row_for_vertex(self.instance(), vertex_name)
            .await?
            .ok_or_else(|| CraError::VertexNotFound(vertex_name.to_string()))?;
        let mut vertex = self
            .registry
            .create(&row.vertex_create_action)
            .ok_or_else(|| {
                CraError::Unsupported(format!(
                    "no vertex factory registered for {}",
                    row.vertex_create_action
                ))
            })?;

        let mut ctx = VertexContext::new(self.instance(), vertex_name);
        vertex
            .initialize(&mut ctx, &row.vertex_parameter)
            .await
            .map_err(CraError::from_anyhow)?;
        let (inputs, outputs) = ctx.into_endpoints();
        for name in inputs.keys() {
            self.data
                .endpoints
                .add_endpoint(EndpointInfo::new(vertex_name, name, true, true))
                .await?;
        }
        for name in outputs.keys() {
            self.data
                .endpoints
                .add_endpoint(EndpointInfo::new(vertex_name, name, false, true))
                .await?;
        }

        let mut vertices = self.vertices.write().expect("vertices poisoned");
        if vertices.contains_key(vertex_name) {
            return Err(CraError::VertexAlreadyExists(vertex_name.to_string()));
        }
        vertices.insert(
            vertex_name.to_string(),
            HostedVertex {
                vertex,
                inputs,
                outputs,
            },
        );
        tracing::info!(instance = %self.instance(), "loaded vertex {}", vertex_name);
        Ok(())
    }

    async fn unload_vertex(&self, vertex_name: &str) -> Result<()> {
        let hosted = self
            .vertices
            .write()
            .expect("vertices poisoned")
            .remove(vertex_name)
            .ok_or_else(|| CraError::VertexNotFound(vertex_name.to_string()))?;
        self.bindings
            .lock()
            .expect("bindings poisoned")
            .retain(|(vertex, _), binding| {
                if vertex == vertex_name {
                    binding.token.cancel();
                    false
                } else {
                    true
                }
            });
        hosted.vertex.dispose().await;
        tracing::info!(instance = %self.instance(), "unloaded vertex {}", vertex_name);
        Ok(())
    }
}

/// The (vertex, endpoint) on the side that hosts the input when `input_side`
/// is true, else the output side.
fn local_side(request: &ConnectRequest, input_side: bool) -> (&str, &str) {
    if input_side {
        (&request.to_vertex, &request.to_endpoint)
    } else {
        (&request.from_vertex, &request.from_endpoint)
    }
}

fn code_of(result: Result<()>) -> CraErrorCode {
    match result {
        Ok(()) => CraErrorCode::Success,
        Err(err) => {
            tracing::warn!("request failed: {}", err);
            err.code()
        }
    }
}

fn parse<T: DeserializeOwned>(frame: &ControlFrame) -> Result<T> {
    frame
        .parse()
        .map_err(|err| CraError::Protocol(format!("bad {:?} payload: {err}", frame.message)))
}

async fn reply(stream: &mut BoxedStream, code: CraErrorCode) -> Result<()> {
    write_frame(stream, &ControlFrame::ready(code)?)
        .await
        .map_err(|err| CraError::Protocol(err.to_string()))
}

#[cfg(test)]
#[path = "tests/worker_tests.rs"]
mod tests;
