//! # kore-zero
//!
//! Partitioned tensor storage for sharded (ZeRO stage 3) training.
//!
//! - [`partition`] splits a logical tensor into per-rank [`ShardSpec`]s
//! - [`TensorStore`] owns every shard's physical allocation and an
//!   indirection table through which all [`View`]s resolve, so moving a
//!   storage between device and host re-points its views in one step
//! - [`BufferManager`] carves per-parameter views out of large contiguous
//!   working buffers and relocates them with their alias layout intact

pub mod contiguous;
pub mod error;
pub mod partition;
pub mod store;
pub mod view;

pub use contiguous::{AliasMap, BufferManager};
pub use error::StoreError;
pub use partition::{padded_shard_len, partition, verify_partition, ShardSpec, TensorId};
pub use store::{StorageInfo, TensorStore, ViewLease};
pub use view::{ResolvedView, View};

pub type Result<T> = std::result::Result<T, StoreError>;
