//! Metadata rows, store contracts and the in-memory / file-backed backends.

pub mod blob;
pub mod file;
pub mod providers;
pub mod store;
pub mod types;

pub use blob::{BlobStorageProvider, MemoryBlobStore};
pub use file::{FileBlobStore, FileRowStore};
pub use providers::{
    DataProvider, EndpointInfoProvider, ShardedVertexInfoProvider, VertexConnectionInfoProvider,
    VertexInfoProvider,
};
pub use store::{MemoryRowStore, RowStore, update_with_retry};
pub use types::*;

#[cfg(test)]
#[path = "tests/metadata_tests.rs"]
mod tests;
