//! Build and load configuration
//!
//! Plain serde-serializable option structs with sensible defaults.
//! `BuildConfig` drives index construction (both the per-timestep builder
//! and the incremental out-of-core builder); `LoadOptions` drives the
//! manager's load path.

use crate::types::{Aabb, Vec3};
use serde::{Deserialize, Serialize};

/// Default number of shards processed per batch during incremental builds.
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Configuration for building spatial hash tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Cell edge length in world units, uniform in all dimensions. Must be > 0.
    pub cell_size: f32,

    /// Bounding box used for cell coordinates. Ignored when
    /// `compute_bounding_box` is set.
    pub bbox: Aabb,

    /// Compute the bounding box from the data instead of using `bbox`.
    pub compute_bounding_box: bool,

    /// Absolute expansion applied to a computed bounding box, in world units.
    pub bounding_box_margin: f32,

    /// Number of shards loaded per batch in pass 2. Bounds peak memory.
    pub batch_size: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cell_size: 10.0,
            bbox: Aabb::new(Vec3::ZERO, Vec3::ZERO),
            compute_bounding_box: true,
            bounding_box_margin: 1.0,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl BuildConfig {
    pub fn new(cell_size: f32) -> Self {
        Self { cell_size, ..Default::default() }
    }

    /// Use a caller-supplied bounding box instead of scanning the data.
    pub fn with_bbox(mut self, bbox: Aabb) -> Self {
        self.bbox = bbox;
        self.compute_bounding_box = false;
        self
    }

    pub fn with_margin(mut self, margin: f32) -> Self {
        self.bounding_box_margin = margin;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Options for loading a range of hash tables through the manager
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadOptions {
    /// First time step to load (inclusive)
    pub start_time_step: i32,

    /// Last time step to load (inclusive)
    pub end_time_step: i32,

    /// Build the tables from shard data when they are missing on disk.
    pub auto_create: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { start_time_step: 0, end_time_step: 0, auto_create: true }
    }
}

impl LoadOptions {
    pub fn range(start_time_step: i32, end_time_step: i32) -> Self {
        Self { start_time_step, end_time_step, ..Default::default() }
    }

    /// Fail with `MissingData` instead of building when tables are absent.
    pub fn no_auto_create(mut self) -> Self {
        self.auto_create = false;
        self
    }
}
