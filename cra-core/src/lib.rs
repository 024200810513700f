//! # CRA Core
//!
//! Runtime pieces shared by every CRA process:
//!
//! - [`metadata`]: placement, endpoint, connection and shard-epoch rows with
//!   versioned stores ([`MemoryRowStore`](metadata::MemoryRowStore),
//!   [`FileRowStore`](metadata::FileRowStore)).
//! - [`network`]: control frames, pooled peer streams and the secure stream hook.
//! - [`vertex`]: the [`Vertex`](vertex::Vertex) trait and its async endpoints.
//! - [`worker`]: the [`Worker`](worker::Worker) hosting vertices and running
//!   the connection protocol.
//! - [`client`]: the [`ClientLibrary`](client::ClientLibrary) that places
//!   vertices and wires them.

pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod network;
pub mod vertex;
pub mod worker;

pub use error::{CraError, CraErrorCode, Result};
