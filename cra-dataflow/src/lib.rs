//! # CRA Dataflow
//!
//! Sharded dataset pipelines compiled onto CRA vertices.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cra_core::client::ClientLibrary;
//! use cra_dataflow::{DeploymentDescriptor, FunctionRegistry, Record, ShardedDataset};
//!
//! # async fn run(client: ClientLibrary) -> cra_core::Result<()> {
//! let mut functions = FunctionRegistry::new();
//! functions.register_producer("numbers", |shard, _| {
//!     Ok((0..10).map(|v| Record::int(shard as u64, v)).collect())
//! });
//!
//! let mut subscription = ShardedDataset::produce("numbers")
//!     .shuffle_by_key()
//!     .deploy(
//!         &client,
//!         Arc::new(functions),
//!         DeploymentDescriptor::new("numbers")
//!             .with_instances(["w1", "w2"])
//!             .with_shard_count(4),
//!     )
//!     .await?;
//! let results = subscription.collect().await?;
//! subscription.close(&client).await;
//! # Ok(())
//! # }
//! ```
//!
//! - [`sharded_dataset`]: [`ShardedDataset`], the expression builder.
//! - [`topology`]: [`OperatorsTopology`] with its tasks, transform attribution and
//!   vertex edges.
//! - [`registry`]: [`FunctionRegistry`], the named functions every process
//!   resolves compiled tasks against.
//! - [`operators`]: the vertices running each task shard.
//! - [`deploy`]: placement, wiring and the result [`Subscription`].

pub mod dataset;
pub mod deploy;
pub mod descriptors;
pub mod operators;
pub mod partitioner;
pub mod registry;
pub mod scheduler;
pub mod sharded_dataset;
pub mod tasks;
pub mod topology;

pub use dataset::{Dataset, Record};
pub use deploy::{DeploymentDescriptor, Subscription};
pub use operators::operator_vertex_registry;
pub use registry::{FunctionRegistry, RegisteredFunction};
pub use sharded_dataset::ShardedDataset;
pub use topology::OperatorsTopology;

pub use cra_core;
