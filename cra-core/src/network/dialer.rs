use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{CraError, CraErrorCode, Result};

use super::connection_pool::PeerPools;
use super::frame::{ControlFrame, read_frame, write_frame};
use super::stream::{BoxedStream, SecureStreamConnectionDescriptor, StreamConnection};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens control streams to workers, reusing pooled ones when available.
pub struct Dialer {
    local_address: String,
    local_port: u16,
    pools: PeerPools,
    secure: Option<Arc<dyn SecureStreamConnectionDescriptor>>,
}

impl Dialer {
    pub fn new(
        local_address: impl Into<String>,
        local_port: u16,
        pool_capacity: usize,
        secure: Option<Arc<dyn SecureStreamConnectionDescriptor>>,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            local_port,
            pools: PeerPools::new(pool_capacity),
            secure,
        }
    }

    pub fn pools(&self) -> &PeerPools {
        &self.pools
    }

    /// A pooled stream to `address:port`, or a freshly opened one. The flag
    /// is true for a fresh socket.
    pub async fn checkout(&self, address: &str, port: u16) -> Result<(StreamConnection, bool)> {
        let peer = format!("{address}:{port}");
        if let Some(conn) = self.pools.get(&peer) {
            return Ok((conn, false));
        }
        let conn = self.open(address, port).await?;
        Ok((conn, true))
    }

    async fn open(&self, address: &str, port: u16) -> Result<StreamConnection> {
        let peer = format!("{address}:{port}");
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer))
            .await
            .map_err(|_| CraError::ConnectionEstablishFailed(format!("connect to {peer} timed out")))?
            .map_err(|err| CraError::ConnectionEstablishFailed(format!("connect to {peer}: {err}")))?;
        tcp.set_nodelay(true)?;
        self.pools.record_created(&peer);

        let mut stream: BoxedStream = Box::new(tcp);
        if let Some(secure) = &self.secure {
            stream = secure.create_secure_client(stream).await.map_err(|err| {
                CraError::ConnectionEstablishFailed(format!("secure handshake with {peer}: {err}"))
            })?;
        }
        Ok(StreamConnection {
            from_address: self.local_address.clone(),
            from_port: self.local_port,
            to_address: address.to_string(),
            to_port: port,
            stream,
        })
    }

    /// Send `frame` and await one reply frame. A pooled stream that turns
    /// out to be dead is discarded and the request is retried once on a
    /// fresh socket.
    pub async fn request(
        &self,
        address: &str,
        port: u16,
        frame: &ControlFrame,
    ) -> Result<(ControlFrame, StreamConnection)> {
        let (mut conn, fresh) = self.checkout(address, port).await?;
        match exchange(&mut conn.stream, frame).await {
            Ok(reply) => Ok((reply, conn)),
            Err(err) if !fresh => {
                tracing::debug!("pooled stream to {} is stale: {}", conn.peer(), err);
                let mut conn = self.open(address, port).await?;
                let reply = exchange(&mut conn.stream, frame).await?;
                Ok((reply, conn))
            }
            Err(err) => Err(err),
        }
    }

    /// Request/reply round trip expecting a `Ready` reply. The stream goes
    /// back to the pool afterwards.
    pub async fn call(&self, address: &str, port: u16, frame: &ControlFrame) -> Result<CraErrorCode> {
        let (reply, conn) = self.request(address, port, frame).await?;
        let code = reply
            .ready_code()
            .map_err(|err| CraError::Protocol(err.to_string()))?;
        self.checkin(conn).await;
        Ok(code)
    }

    /// Return a healthy stream to its pool; a full pool closes it.
    pub async fn checkin(&self, conn: StreamConnection) {
        if let Err(conn) = self.pools.return_connection(conn) {
            self.dispose(conn).await;
        }
    }

    pub async fn dispose(&self, conn: StreamConnection) {
        let peer = conn.peer();
        let result = match &self.secure {
            Some(secure) => secure.teardown_secure_client(conn.stream).await,
            None => {
                let mut stream = conn.stream;
                tokio::io::AsyncWriteExt::shutdown(&mut stream)
                    .await
                    .map_err(anyhow::Error::from)
            }
        };
        if let Err(err) = result {
            tracing::debug!("closing stream to {} failed: {}", peer, err);
        }
    }

    /// Close every pooled stream.
    pub fn free(&self) -> usize {
        self.pools.free()
    }
}

async fn exchange(stream: &mut BoxedStream, frame: &ControlFrame) -> Result<ControlFrame> {
    write_frame(stream, frame)
        .await
        .map_err(|err| CraError::ConnectionEstablishFailed(err.to_string()))?;
    read_frame(stream)
        .await
        .map_err(|err| CraError::ConnectionEstablishFailed(err.to_string()))
}
