use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::network::frame::{read_bytes, write_bytes, write_end};
use crate::network::stream::BoxedStream;

use super::endpoint::{AsyncInputEndpoint, AsyncOutputEndpoint};
use super::{Vertex, VertexContext};

const CHANNEL_CAPACITY: usize = 1024;

/// Writes every record received on a channel as one length-prefixed record.
/// The data sequence ends when all senders are dropped.
pub struct ChannelOutputEndpoint {
    source: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ChannelOutputEndpoint {
    pub fn new() -> (Self, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                source: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }
}

#[async_trait]
impl AsyncOutputEndpoint for ChannelOutputEndpoint {
    async fn to_stream(
        &self,
        stream: &mut BoxedStream,
        _other_vertex: &str,
        _other_endpoint: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut source = self.source.lock().await;
        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                record = source.recv() => record,
            };
            match record {
                Some(record) => write_bytes(stream, &record).await?,
                None => break,
            }
        }
        write_end(stream).await
    }
}

/// Forwards every record read from the stream into a channel.
pub struct ChannelInputEndpoint {
    sink: mpsc::Sender<Vec<u8>>,
}

impl ChannelInputEndpoint {
    pub fn new() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { sink: tx }, rx)
    }
}

#[async_trait]
impl AsyncInputEndpoint for ChannelInputEndpoint {
    async fn from_stream(
        &self,
        stream: &mut BoxedStream,
        other_vertex: &str,
        other_endpoint: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                record = read_bytes(stream) => record?,
            };
            let Some(record) = record else {
                return Ok(());
            };
            if self.sink.send(record).await.is_err() {
                tracing::debug!(
                    "input from {}.{} dropped: receiver closed",
                    other_vertex,
                    other_endpoint
                );
                return Ok(());
            }
        }
    }
}

/// Channel ends of every [`ChannelVertex`] created from one factory, keyed by
/// vertex name.
#[derive(Clone, Default)]
pub struct ChannelTaps {
    writers: Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
    readers: Arc<Mutex<HashMap<String, mpsc::Receiver<Vec<u8>>>>>,
}

impl ChannelTaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender feeding the `output` endpoint of `vertex`.
    pub fn take_writer(&self, vertex: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.writers.lock().expect("taps poisoned").remove(vertex)
    }

    /// Receiver drained from the `input` endpoint of `vertex`.
    pub fn take_reader(&self, vertex: &str) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.readers.lock().expect("taps poisoned").remove(vertex)
    }
}

/// Vertex with one `input` and one `output` endpoint, both backed by
/// channels published through [`ChannelTaps`].
pub struct ChannelVertex {
    taps: ChannelTaps,
}

impl ChannelVertex {
    pub const INPUT: &'static str = "input";
    pub const OUTPUT: &'static str = "output";

    pub fn new(taps: ChannelTaps) -> Self {
        Self { taps }
    }

    pub fn factory(taps: ChannelTaps) -> impl Fn() -> Box<dyn Vertex> + Send + Sync + 'static {
        move || -> Box<dyn Vertex> { Box::new(ChannelVertex::new(taps.clone())) }
    }
}

#[async_trait]
impl Vertex for ChannelVertex {
    async fn initialize(&mut self, ctx: &mut VertexContext, _parameter: &[u8]) -> Result<()> {
        let (input, reader) = ChannelInputEndpoint::new();
        let (output, writer) = ChannelOutputEndpoint::new();
        ctx.add_input(Self::INPUT, Arc::new(input))?;
        ctx.add_output(Self::OUTPUT, Arc::new(output))?;
        let vertex = ctx.vertex_name().to_string();
        self.taps
            .readers
            .lock()
            .expect("taps poisoned")
            .insert(vertex.clone(), reader);
        self.taps
            .writers
            .lock()
            .expect("taps poisoned")
            .insert(vertex, writer);
        Ok(())
    }
}
