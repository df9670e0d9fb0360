//! Spatial index: Morton codec, per-timestep hash tables, builders

pub mod builder;
pub mod hash_table;
pub mod incremental;
pub mod morton;

pub use hash_table::{HashEntry, HashTableHeader, SpatialHashTable};
pub use incremental::{BuildReport, IncrementalBuilder, ScanSummary};
