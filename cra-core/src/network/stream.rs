use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Any duplex byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Pluggable transform applied to every worker-to-worker stream, typically a
/// TLS wrap. Errors from the create calls are handshake failures.
#[async_trait]
pub trait SecureStreamConnectionDescriptor: Send + Sync {
    async fn create_secure_client(&self, stream: BoxedStream) -> anyhow::Result<BoxedStream>;

    async fn create_secure_server(&self, stream: BoxedStream) -> anyhow::Result<BoxedStream>;

    async fn teardown_secure_client(&self, mut stream: BoxedStream) -> anyhow::Result<()> {
        stream.shutdown().await?;
        Ok(())
    }

    async fn teardown_secure_server(&self, mut stream: BoxedStream) -> anyhow::Result<()> {
        stream.shutdown().await?;
        Ok(())
    }
}

/// A pooled stream together with the endpoints it was opened between.
pub struct StreamConnection {
    pub from_address: String,
    pub from_port: u16,
    pub to_address: String,
    pub to_port: u16,
    pub stream: BoxedStream,
}

impl StreamConnection {
    pub fn peer(&self) -> String {
        format!("{}:{}", self.to_address, self.to_port)
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("from", &format!("{}:{}", self.from_address, self.from_port))
            .field("to", &self.peer())
            .finish()
    }
}
