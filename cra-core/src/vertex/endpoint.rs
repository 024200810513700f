use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::network::stream::BoxedStream;

/// Buffer size of the in-process pipe used by fused connections.
pub const FUSED_PIPE_CAPACITY: usize = 64 * 1024;

/// Receiving side of a connection.
///
/// `from_stream` returns once the peer ends its data sequence, the stream
/// closes, or `cancel` fires. The stream stays owned by the caller.
#[async_trait]
pub trait AsyncInputEndpoint: Send + Sync {
    async fn from_stream(
        &self,
        stream: &mut BoxedStream,
        other_vertex: &str,
        other_endpoint: &str,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Sending side of a connection.
#[async_trait]
pub trait AsyncOutputEndpoint: Send + Sync {
    async fn to_stream(
        &self,
        stream: &mut BoxedStream,
        other_vertex: &str,
        other_endpoint: &str,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Whether a co-located `input` may be wired in-process through
    /// [`to_input`](AsyncOutputEndpoint::to_input). When false the worker
    /// connects over a loopback socket instead.
    fn can_fuse_with(
        &self,
        _input: &dyn AsyncInputEndpoint,
        _other_vertex: &str,
        _other_endpoint: &str,
    ) -> bool {
        true
    }

    /// Drive a co-located input directly. The default pipes both sides
    /// through an in-memory duplex stream.
    async fn to_input(
        &self,
        input: Arc<dyn AsyncInputEndpoint>,
        this_vertex: &str,
        this_endpoint: &str,
        other_vertex: &str,
        other_endpoint: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (writer, reader) = tokio::io::duplex(FUSED_PIPE_CAPACITY);
        let mut writer: BoxedStream = Box::new(writer);
        let mut reader: BoxedStream = Box::new(reader);

        let write = async {
            self.to_stream(&mut writer, other_vertex, other_endpoint, cancel.clone())
                .await?;
            writer.shutdown().await?;
            Ok::<(), anyhow::Error>(())
        };
        let read = input.from_stream(&mut reader, this_vertex, this_endpoint, cancel.clone());
        tokio::try_join!(write, read)?;
        Ok(())
    }
}
