//! Shard store access
//!
//! A shard file covers a contiguous interval of time steps for many
//! trajectories. The index core consumes shards exclusively through the
//! [`ShardReader`] trait so the storage backend can be swapped: the
//! default [`BinaryShardReader`] reads `shard-<N>.bin` files from a
//! dataset directory, while [`InMemoryShardReader`] serves fixtures in
//! tests and embedded callers.

use crate::types::Vec3;
use crate::Result;
use std::path::{Path, PathBuf};

pub mod binary;
pub mod memory;

pub use binary::{write_shard, BinaryShardReader};
pub use memory::InMemoryShardReader;

/// One trajectory's data within a shard interval
#[derive(Debug, Clone, PartialEq)]
pub struct ShardEntry {
    pub trajectory_id: u32,

    /// Index of the first valid sample within the interval, -1 when the
    /// entry has no valid samples. Advisory; consumers skip NaN anyway.
    pub start_offset_in_interval: i32,

    /// Number of non-NaN samples in `positions`
    pub valid_sample_count: i32,

    /// Exactly `interval_size` positions; NaN components mark missing
    /// samples.
    pub positions: Vec<Vec3>,
}

/// A fully loaded shard
#[derive(Debug, Clone, PartialEq)]
pub struct ShardData {
    /// Global time step of position index 0 in every entry
    pub interval_start_time_step: i32,

    /// Number of time steps the shard covers (positive)
    pub interval_size: i32,

    pub entries: Vec<ShardEntry>,
}

impl ShardData {
    pub fn new(interval_start_time_step: i32, interval_size: i32) -> Self {
        Self { interval_start_time_step, interval_size, entries: Vec::new() }
    }

    /// Global time step of position index `index` within any entry.
    ///
    /// Position arrays span the whole interval (NaN-padded), so the array
    /// index is the interval-local step.
    pub fn global_time_step(&self, index: usize) -> i32 {
        self.interval_start_time_step + index as i32
    }

    /// Last global time step covered by this shard (inclusive).
    pub fn interval_end_time_step(&self) -> i32 {
        self.interval_start_time_step + self.interval_size - 1
    }

    /// Whether this shard covers any step of `[ts0, ts1]`.
    pub fn overlaps(&self, ts0: i32, ts1: i32) -> bool {
        self.interval_start_time_step <= ts1 && self.interval_end_time_step() >= ts0
    }

    /// Append one trajectory, deriving offset and valid count from the
    /// NaN pattern. `positions` must have `interval_size` elements.
    pub fn push_trajectory(&mut self, trajectory_id: u32, positions: Vec<Vec3>) {
        debug_assert_eq!(positions.len(), self.interval_size as usize);
        let start_offset_in_interval = positions
            .iter()
            .position(|p| !p.has_nan())
            .map(|i| i as i32)
            .unwrap_or(-1);
        let valid_sample_count = positions.iter().filter(|p| !p.has_nan()).count() as i32;
        self.entries.push(ShardEntry {
            trajectory_id,
            start_offset_in_interval,
            valid_sample_count,
            positions,
        });
    }
}

/// Source of shard data for the builder and the query engine.
///
/// Implementations must be shareable across the worker pool.
pub trait ShardReader: Send + Sync {
    /// Enumerate the dataset's shard files in lexicographic order.
    fn discover(&self, dataset_dir: &Path) -> Result<Vec<PathBuf>>;

    /// Load one shard completely.
    fn load_shard(&self, path: &Path) -> Result<ShardData>;
}

/// Parse the `<N>` of a `shard-<N>.bin` filename.
pub fn parse_timestep_from_filename(path: &Path) -> Option<i32> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("shard-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestep_from_filename() {
        assert_eq!(parse_timestep_from_filename(Path::new("shard-0.bin")), Some(0));
        assert_eq!(parse_timestep_from_filename(Path::new("/data/shard-120.bin")), Some(120));
        assert_eq!(parse_timestep_from_filename(Path::new("shard--5.bin")), Some(-5));
        assert_eq!(parse_timestep_from_filename(Path::new("other-3.bin")), None);
        assert_eq!(parse_timestep_from_filename(Path::new("shard-x.bin")), None);
    }

    #[test]
    fn test_global_time_step_convention() {
        let shard = ShardData::new(40, 20);
        assert_eq!(shard.global_time_step(0), 40);
        assert_eq!(shard.global_time_step(19), 59);
        assert_eq!(shard.interval_end_time_step(), 59);
    }

    #[test]
    fn test_overlaps() {
        let shard = ShardData::new(40, 20); // covers [40, 59]
        assert!(shard.overlaps(0, 40));
        assert!(shard.overlaps(59, 100));
        assert!(shard.overlaps(45, 50));
        assert!(!shard.overlaps(0, 39));
        assert!(!shard.overlaps(60, 100));
    }

    #[test]
    fn test_push_trajectory_derives_metadata() {
        let nan = Vec3::splat(f32::NAN);
        let mut shard = ShardData::new(0, 4);
        shard.push_trajectory(7, vec![nan, Vec3::splat(1.0), nan, Vec3::splat(2.0)]);

        let entry = &shard.entries[0];
        assert_eq!(entry.start_offset_in_interval, 1);
        assert_eq!(entry.valid_sample_count, 2);

        shard.push_trajectory(8, vec![nan, nan, nan, nan]);
        assert_eq!(shard.entries[1].start_offset_in_interval, -1);
        assert_eq!(shard.entries[1].valid_sample_count, 0);
    }
}
