use std::fmt;

use crate::network::frame::ConnectRequest;

/// Per-request connection establishment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ResolveEndpoints,
    ChooseInitiator,
    ConnectVertexInitiator,
    ConnectVertexReceiver,
    DataStreaming,
    Release,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::ResolveEndpoints => "RESOLVE_ENDPOINTS",
            ConnectionState::ChooseInitiator => "CHOOSE_INITIATOR",
            ConnectionState::ConnectVertexInitiator => "CONNECT_VERTEX_INITIATOR",
            ConnectionState::ConnectVertexReceiver => "CONNECT_VERTEX_RECEIVER",
            ConnectionState::DataStreaming => "DATA_STREAMING",
            ConnectionState::Release => "RELEASE",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Which side opens the socket for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionInitiator {
    /// The instance hosting the output endpoint.
    FromSide,
    /// The instance hosting the input endpoint.
    ToSide,
    /// The side hosted on the caller's own instance, else `FromSide`.
    #[default]
    Auto,
}

impl ConnectionInitiator {
    /// Resolve `Auto` against the instances hosting both ends.
    pub fn resolve(self, local_instance: Option<&str>, from_instance: &str, to_instance: &str) -> Self {
        match self {
            ConnectionInitiator::Auto => match local_instance {
                Some(local) if local == to_instance && local != from_instance => {
                    ConnectionInitiator::ToSide
                }
                _ => ConnectionInitiator::FromSide,
            },
            fixed => fixed,
        }
    }
}

pub(crate) fn trace_state(request: &ConnectRequest, state: ConnectionState) {
    tracing::debug!(connection = %request, "connection state {}", state);
}
