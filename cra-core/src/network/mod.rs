//! Control framing, stream abstractions and the per-peer connection pool.

pub mod connection_pool;
pub mod dialer;
pub mod frame;
pub mod stream;

pub use connection_pool::{ConnectionPool, PeerPools};
pub use dialer::Dialer;
pub use frame::*;
pub use stream::{AsyncStream, BoxedStream, SecureStreamConnectionDescriptor, StreamConnection};
