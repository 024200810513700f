//! Error taxonomy shared by the metadata layer, the control protocol and the
//! client library.
//!
//! [`CraErrorCode`] is the closed set of codes that travels over the wire in
//! `Ready` replies. [`CraError`] is the typed, in-process error carrying the
//! names involved.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CraError>;

/// Wire-level status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CraErrorCode {
    Success = 0,
    VertexNotFound = 1,
    ActiveVertexNotFound = 2,
    VertexOutputNotFound = 3,
    VertexInputNotFound = 4,
    VertexEndpointNotFound = 5,
    VertexAlreadyExists = 6,
    ServerRecovering = 7,
    ConnectionAdditionRace = 8,
    ConnectionEstablishFailed = 9,
    VerticesEndpointsNotMatched = 10,
}

impl TryFrom<u32> for CraErrorCode {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> anyhow::Result<Self> {
        match value {
            0 => Ok(CraErrorCode::Success),
            1 => Ok(CraErrorCode::VertexNotFound),
            2 => Ok(CraErrorCode::ActiveVertexNotFound),
            3 => Ok(CraErrorCode::VertexOutputNotFound),
            4 => Ok(CraErrorCode::VertexInputNotFound),
            5 => Ok(CraErrorCode::VertexEndpointNotFound),
            6 => Ok(CraErrorCode::VertexAlreadyExists),
            7 => Ok(CraErrorCode::ServerRecovering),
            8 => Ok(CraErrorCode::ConnectionAdditionRace),
            9 => Ok(CraErrorCode::ConnectionEstablishFailed),
            10 => Ok(CraErrorCode::VerticesEndpointsNotMatched),
            other => Err(anyhow::anyhow!("unknown error code: {}", other)),
        }
    }
}

impl From<CraErrorCode> for u32 {
    fn from(value: CraErrorCode) -> Self {
        value as u32
    }
}

#[derive(Debug, Error)]
pub enum CraError {
    #[error("vertex {0} not found")]
    VertexNotFound(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("no active instance of vertex {0}")]
    ActiveVertexNotFound(String),

    #[error("output endpoint {endpoint} not found on vertex {vertex}")]
    VertexOutputNotFound { vertex: String, endpoint: String },

    #[error("input endpoint {endpoint} not found on vertex {vertex}")]
    VertexInputNotFound { vertex: String, endpoint: String },

    #[error("endpoint {endpoint} not found on vertex {vertex}")]
    VertexEndpointNotFound { vertex: String, endpoint: String },

    #[error("vertex {0} already exists")]
    VertexAlreadyExists(String),

    #[error("instance {0} is recovering")]
    ServerRecovering(String),

    #[error("concurrent update raced connection {0}")]
    ConnectionAdditionRace(String),

    #[error("failed to establish connection: {0}")]
    ConnectionEstablishFailed(String),

    #[error("endpoints of {from} and {to} do not match")]
    VerticesEndpointsNotMatched { from: String, to: String },

    #[error("version conflict on {kind} {key}: expected {expected}, found {actual}")]
    VersionConflict {
        kind: &'static str,
        key: String,
        expected: String,
        actual: String,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CraError {
    /// Unwrap a `CraError` raised inside code returning `anyhow::Result`,
    /// such as a vertex initializer.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<CraError>() {
            Ok(err) => err,
            Err(err) => CraError::Other(err),
        }
    }

    /// The wire code a worker reports for this error.
    pub fn code(&self) -> CraErrorCode {
        match self {
            CraError::VertexNotFound(_) | CraError::InstanceNotFound(_) => {
                CraErrorCode::VertexNotFound
            }
            CraError::ActiveVertexNotFound(_) => CraErrorCode::ActiveVertexNotFound,
            CraError::VertexOutputNotFound { .. } => CraErrorCode::VertexOutputNotFound,
            CraError::VertexInputNotFound { .. } => CraErrorCode::VertexInputNotFound,
            CraError::VertexEndpointNotFound { .. } => CraErrorCode::VertexEndpointNotFound,
            CraError::VertexAlreadyExists(_) => CraErrorCode::VertexAlreadyExists,
            CraError::ServerRecovering(_) => CraErrorCode::ServerRecovering,
            CraError::ConnectionAdditionRace(_) => CraErrorCode::ConnectionAdditionRace,
            CraError::VerticesEndpointsNotMatched { .. } => {
                CraErrorCode::VerticesEndpointsNotMatched
            }
            _ => CraErrorCode::ConnectionEstablishFailed,
        }
    }

    /// Rebuild a typed error from a reply code. `vertex`/`endpoint` name the
    /// subject of the request so the error stays readable on the client side.
    pub fn from_code(code: CraErrorCode, vertex: &str, endpoint: &str) -> Option<Self> {
        let vertex = vertex.to_string();
        let endpoint = endpoint.to_string();
        let err = match code {
            CraErrorCode::Success => return None,
            CraErrorCode::VertexNotFound => CraError::VertexNotFound(vertex),
            CraErrorCode::ActiveVertexNotFound => CraError::ActiveVertexNotFound(vertex),
            CraErrorCode::VertexOutputNotFound => CraError::VertexOutputNotFound { vertex, endpoint },
            CraErrorCode::VertexInputNotFound => CraError::VertexInputNotFound { vertex, endpoint },
            CraErrorCode::VertexEndpointNotFound => {
                CraError::VertexEndpointNotFound { vertex, endpoint }
            }
            CraErrorCode::VertexAlreadyExists => CraError::VertexAlreadyExists(vertex),
            CraErrorCode::ServerRecovering => CraError::ServerRecovering(vertex),
            CraErrorCode::ConnectionAdditionRace => CraError::ConnectionAdditionRace(vertex),
            CraErrorCode::ConnectionEstablishFailed => {
                CraError::ConnectionEstablishFailed(format!("{vertex}.{endpoint}"))
            }
            CraErrorCode::VerticesEndpointsNotMatched => CraError::VerticesEndpointsNotMatched {
                from: vertex,
                to: endpoint,
            },
        };
        Some(err)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CraError::VertexNotFound(_)
                | CraError::InstanceNotFound(_)
                | CraError::ActiveVertexNotFound(_)
                | CraError::VertexOutputNotFound { .. }
                | CraError::VertexInputNotFound { .. }
                | CraError::VertexEndpointNotFound { .. }
        )
    }
}

impl From<bincode::Error> for CraError {
    fn from(value: bincode::Error) -> Self {
        CraError::Serialization(value.to_string())
    }
}

impl From<serde_json::Error> for CraError {
    fn from(value: serde_json::Error) -> Self {
        CraError::Serialization(value.to_string())
    }
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
