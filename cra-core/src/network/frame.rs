use anyhow::{Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CraErrorCode;
use crate::metadata::VertexConnectionInfo;

/// Typed prefix of every control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlMessage {
    LoadVertex = 0,
    ConnectVertexInitiator = 1,
    ConnectVertexReceiver = 2,
    ConnectVertexInitiatorReverse = 3,
    ConnectVertexReceiverReverse = 4,
    Ping = 5,
    Ready = 6,
    Release = 7,
    DisconnectVertex = 8,
    UnloadVertex = 9,
}

impl TryFrom<u8> for ControlMessage {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ControlMessage::LoadVertex),
            1 => Ok(ControlMessage::ConnectVertexInitiator),
            2 => Ok(ControlMessage::ConnectVertexReceiver),
            3 => Ok(ControlMessage::ConnectVertexInitiatorReverse),
            4 => Ok(ControlMessage::ConnectVertexReceiverReverse),
            5 => Ok(ControlMessage::Ping),
            6 => Ok(ControlMessage::Ready),
            7 => Ok(ControlMessage::Release),
            8 => Ok(ControlMessage::DisconnectVertex),
            9 => Ok(ControlMessage::UnloadVertex),
            other => Err(anyhow!("unknown control message: {}", other)),
        }
    }
}

/// Wire frame: `[len:u32][message:u8][payload:bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub message: ControlMessage,
    pub payload: Vec<u8>,
}

impl ControlFrame {
    pub fn new(message: ControlMessage, payload: Vec<u8>) -> Self {
        Self { message, payload }
    }

    pub fn empty(message: ControlMessage) -> Self {
        Self::new(message, Vec::new())
    }

    /// Frame carrying a bincode-encoded request or reply.
    pub fn with<T: Serialize>(message: ControlMessage, body: &T) -> Result<Self> {
        Ok(Self::new(message, bincode::serialize(body)?))
    }

    pub fn ready(code: CraErrorCode) -> Result<Self> {
        Self::with(
            ControlMessage::Ready,
            &ReadyReply {
                code: u32::from(code),
            },
        )
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Decode a `Ready` reply into its status code.
    pub fn ready_code(&self) -> Result<CraErrorCode> {
        if self.message != ControlMessage::Ready {
            return Err(anyhow!("expected Ready, got {:?}", self.message));
        }
        let reply: ReadyReply = self.parse()?;
        CraErrorCode::try_from(reply.code)
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len = 1 + self.payload.len();
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.push(self.message as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let Some((&message, payload)) = body.split_first() else {
            return Err(anyhow!("control frame body is empty"));
        };
        Ok(Self {
            message: ControlMessage::try_from(message)?,
            payload: payload.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadVertexRequest {
    pub vertex_name: String,
}

/// Names of both ends of one wire. Used by every connect variant and by
/// `DisconnectVertex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub from_vertex: String,
    pub from_endpoint: String,
    pub to_vertex: String,
    pub to_endpoint: String,
}

impl ConnectRequest {
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
        }
    }
}

impl From<&VertexConnectionInfo> for ConnectRequest {
    fn from(value: &VertexConnectionInfo) -> Self {
        Self::new(
            &value.from_vertex,
            &value.from_endpoint,
            &value.to_vertex,
            &value.to_endpoint,
        )
    }
}

impl std::fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.from_vertex, self.from_endpoint, self.to_vertex, self.to_endpoint
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyReply {
    pub code: u32,
}

pub async fn read_frame<R>(reader: &mut R) -> Result<ControlFrame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let body_len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    ControlFrame::decode(&body)
}

/// Like [`read_frame`], but a clean end of stream before the length prefix
/// yields `None`.
pub async fn try_read_frame<R>(reader: &mut R) -> Result<Option<ControlFrame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let body_len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(Some(ControlFrame::decode(&body)?))
}

pub async fn write_frame<W>(writer: &mut W, frame: &ControlFrame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Length value that terminates a data sequence.
const END_OF_DATA: u32 = u32::MAX;

/// Write one length-prefixed data record: `[len:u32][bytes]`.
pub async fn write_bytes<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if bytes.len() >= END_OF_DATA as usize {
        return Err(anyhow!("data record too large: {}", bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Mark the end of a data sequence without closing the stream, so the
/// stream can go on carrying control frames.
pub async fn write_end<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&END_OF_DATA.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one data record. `None` means the peer ended the sequence or closed
/// the stream at a record boundary.
pub async fn read_bytes<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len == END_OF_DATA {
        return Ok(None);
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;
    Ok(Some(bytes))
}

#[cfg(test)]
#[path = "tests/frame_tests.rs"]
mod tests;
