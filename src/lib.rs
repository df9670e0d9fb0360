//! trajgrid: out-of-core spatial index for trajectory datasets
//!
//! Indexes the positions of many moving objects sampled at discrete time
//! steps and answers fixed-radius neighborhood queries against datasets
//! too large to hold in memory.
//!
//! ## Architecture
//! - Index layer: Morton-keyed per-timestep hash tables, binary-search
//!   lookup, trajectory IDs fetched from disk on demand
//! - Build layer: two-pass batched builder over shard files, bounded
//!   memory regardless of dataset size
//! - Query layer: four radius-query modes (single step, dual radius,
//!   time range, moving trajectory) with exact-distance verification
//! - Dispatch layer: worker-pool execution with callbacks delivered on a
//!   single owner thread
//!
//! ## Example
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use trajgrid::{LoadOptions, QueryEngine, SpatialHashManager, Vec3};
//! use trajgrid::shard::BinaryShardReader;
//!
//! # fn main() -> trajgrid::Result<()> {
//! let dataset = Path::new("/data/run1");
//! let manager = Arc::new(SpatialHashManager::new(Arc::new(BinaryShardReader::new())));
//! manager.load_hash_tables(dataset, 10.0, LoadOptions::range(0, 99))?;
//!
//! let engine = QueryEngine::new(manager);
//! let results = engine.query_radius(dataset, &Vec3::new(5.0, 5.0, 5.0), 25.0, 10.0, 42)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod index;
pub mod manager;
pub mod query;
pub mod shard;
pub mod types;

mod error;

pub use config::{BuildConfig, LoadOptions, DEFAULT_BATCH_SIZE};
pub use dispatch::{
    weak_callback, AsyncQueryDispatcher, DualRadiusRequest, OwnerHandle, OwnerQueue, QueryRequest,
};
pub use error::{GridError, Result};
pub use index::{BuildReport, IncrementalBuilder, SpatialHashTable};
pub use manager::{SpatialHashManager, CELL_SIZE_TOLERANCE};
pub use query::QueryEngine;
pub use types::{
    Aabb, SpatialQueryResult, TrajectoryQueryResult, TrajectorySample, TrajectorySamplePoint, Vec3,
};
