//! Per-timestep hash table construction
//!
//! Buckets one time step's samples by Morton cell, sorts the occupied
//! cells, and lays the trajectory IDs out as one flat array so the result
//! can be saved directly in the on-disk format.

use crate::config::BuildConfig;
use crate::index::hash_table::{HashEntry, SpatialHashTable};
use crate::index::morton;
use crate::types::{Aabb, TrajectorySample};
use crate::{GridError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Build one time step's hash table from its samples.
///
/// Within-cell ID order is the sample encounter order, which is
/// deterministic for a fixed input slice.
pub fn build_for_time_step(
    time_step: i32,
    samples: &[TrajectorySample],
    config: &BuildConfig,
) -> Result<SpatialHashTable> {
    if config.cell_size <= 0.0 {
        return Err(GridError::InvalidArgument(format!(
            "cell size must be positive, got {}",
            config.cell_size
        )));
    }

    let mut table = SpatialHashTable::default();
    table.header.time_step = time_step as u32;
    table.header.cell_size = config.cell_size;
    table.header.bbox_min = config.bbox.min;
    table.header.bbox_max = config.bbox.max;

    if samples.is_empty() {
        return Ok(table);
    }

    let mut cells: HashMap<u64, Vec<u32>> = HashMap::new();
    for sample in samples {
        if sample.position.has_nan() {
            continue;
        }
        let (cx, cy, cz) =
            morton::cell_from_world(&sample.position, &config.bbox.min, config.cell_size);
        let key = morton::encode_clamped(cx, cy, cz);
        cells.entry(key).or_default().push(sample.trajectory_id);
    }

    let mut keys: Vec<u64> = cells.keys().copied().collect();
    keys.sort_unstable();

    table.entries.reserve(keys.len());
    table.trajectory_ids.reserve(samples.len());

    let mut current_index = 0u32;
    for key in keys {
        let ids = &cells[&key];
        table.entries.push(HashEntry::new(key, current_index, ids.len() as u32));
        table.trajectory_ids.extend_from_slice(ids);
        current_index += ids.len() as u32;
    }

    table.header.num_entries = table.entries.len() as u32;
    table.header.num_ids = table.trajectory_ids.len() as u32;

    Ok(table)
}

/// Fold all samples into a bounding box, expanded by `margin`.
///
/// NaN positions are skipped. An input with no finite samples yields the
/// degenerate box at the origin.
pub fn compute_bounding_box(time_step_samples: &[Vec<TrajectorySample>], margin: f32) -> Aabb {
    let mut bbox = Aabb::empty();
    let mut any = false;

    for samples in time_step_samples {
        for sample in samples {
            if sample.position.has_nan() {
                continue;
            }
            bbox.expand(&sample.position);
            any = true;
        }
    }

    if !any {
        return Aabb::new(crate::types::Vec3::ZERO, crate::types::Vec3::ZERO);
    }

    bbox.expand_by_margin(margin);
    bbox
}

/// Directory name for a cell size, formatted to three decimals.
///
/// `format!` is locale-independent, so the decimal separator is always '.'.
pub fn cell_size_dir_name(cell_size: f32) -> String {
    format!("cellsize_{:.3}", cell_size)
}

/// Directory holding every timestep file for one cell size.
pub fn table_dir(dataset_dir: &Path, cell_size: f32) -> PathBuf {
    dataset_dir
        .join("spatial_hashing")
        .join(cell_size_dir_name(cell_size))
}

/// Full path of one timestep's hash table file.
pub fn output_filename(dataset_dir: &Path, cell_size: f32, time_step: i32) -> PathBuf {
    table_dir(dataset_dir, cell_size).join(format!("timestep_{:05}.bin", time_step))
}
