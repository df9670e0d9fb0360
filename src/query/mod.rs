//! Fixed-radius query engine
//!
//! All query modes follow the same three-stage shape:
//!
//! 1. **Candidate generation**: walk the `(2r+1)^3` cell neighborhood in
//!    the relevant hash tables and union the trajectory IDs. Conservative:
//!    a candidate's cell is within range, its exact position may not be.
//! 2. **Exact-position fetch**: pull the candidates' real positions for
//!    the queried time range from the shard store, skipping NaN samples.
//! 3. **Distance verification**: keep samples within the radius and
//!    annotate them with the exact distance.
//!
//! The engine reads cached tables through the manager but never mutates
//! the cache: a table that isn't cached is loaded locally for the single
//! query and dropped afterwards, which keeps workers safe alongside the
//! owner thread.

use crate::index::builder::output_filename;
use crate::index::SpatialHashTable;
use crate::manager::SpatialHashManager;
use crate::types::{SpatialQueryResult, TrajectoryQueryResult, TrajectorySamplePoint, Vec3};
use crate::{index::morton, GridError, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Stateless facade over the manager and the shard store.
pub struct QueryEngine {
    manager: Arc<SpatialHashManager>,
}

impl QueryEngine {
    pub fn new(manager: Arc<SpatialHashManager>) -> Self {
        Self { manager }
    }

    /// Mode A: all trajectories within `radius` of `position` at one
    /// time step, with their verified sample.
    pub fn query_radius(
        &self,
        dataset_dir: &Path,
        position: &Vec3,
        radius: f32,
        cell_size: f32,
        time_step: i32,
    ) -> Result<Vec<TrajectoryQueryResult>> {
        let table = match self.table_for(dataset_dir, cell_size, time_step) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };

        let candidates = candidate_ids(&table, position, radius)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let fetched = self.fetch_positions(dataset_dir, &candidates, time_step, time_step)?;
        Ok(filter_by_distance(fetched, position, radius))
    }

    /// Mode A, legacy shape: one `(id, distance)` per trajectory, sorted
    /// ascending by distance.
    pub fn query_radius_legacy(
        &self,
        dataset_dir: &Path,
        position: &Vec3,
        radius: f32,
        cell_size: f32,
        time_step: i32,
    ) -> Result<Vec<SpatialQueryResult>> {
        let results = self.query_radius(dataset_dir, position, radius, cell_size, time_step)?;

        let mut flat: Vec<SpatialQueryResult> = results
            .into_iter()
            .filter_map(|r| {
                r.sample_points
                    .iter()
                    .map(|s| s.distance)
                    .min_by(|a, b| a.total_cmp(b))
                    .map(|distance| SpatialQueryResult { trajectory_id: r.trajectory_id, distance })
            })
            .collect();
        flat.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(flat)
    }

    /// Dual-radius variant of Mode A: partition verified samples into an
    /// inner set (`d <= inner_radius`) and an outer-only set
    /// (`inner_radius < d <= outer_radius`).
    pub fn query_dual_radius(
        &self,
        dataset_dir: &Path,
        position: &Vec3,
        inner_radius: f32,
        outer_radius: f32,
        cell_size: f32,
        time_step: i32,
    ) -> Result<(Vec<TrajectoryQueryResult>, Vec<TrajectoryQueryResult>)> {
        if inner_radius > outer_radius {
            return Err(GridError::Range(format!(
                "inner radius {} exceeds outer radius {}",
                inner_radius, outer_radius
            )));
        }

        let outer = self.query_radius(dataset_dir, position, outer_radius, cell_size, time_step)?;

        let mut inner_results = Vec::new();
        let mut outer_results = Vec::new();
        for result in outer {
            let (inner_samples, outer_samples): (Vec<_>, Vec<_>) = result
                .sample_points
                .into_iter()
                .partition(|s| s.distance <= inner_radius);

            if !inner_samples.is_empty() {
                inner_results.push(TrajectoryQueryResult {
                    trajectory_id: result.trajectory_id,
                    sample_points: inner_samples,
                });
            }
            if !outer_samples.is_empty() {
                outer_results.push(TrajectoryQueryResult {
                    trajectory_id: result.trajectory_id,
                    sample_points: outer_samples,
                });
            }
        }
        Ok((inner_results, outer_results))
    }

    /// Mode B: all trajectories that come within `radius` of `position`
    /// at any time step of `[start, end]`, with every verified sample.
    pub fn query_radius_over_time_range(
        &self,
        dataset_dir: &Path,
        position: &Vec3,
        radius: f32,
        cell_size: f32,
        start_time_step: i32,
        end_time_step: i32,
    ) -> Result<Vec<TrajectoryQueryResult>> {
        if start_time_step > end_time_step {
            return Err(GridError::Range(format!(
                "start time step {} exceeds end time step {}",
                start_time_step, end_time_step
            )));
        }

        let mut candidates = HashSet::new();
        for time_step in start_time_step..=end_time_step {
            match self.table_for(dataset_dir, cell_size, time_step) {
                Some(table) => {
                    candidates.extend(candidate_ids(&table, position, radius)?);
                }
                None => {
                    warn!(time_step, "no hash table for time step, skipping");
                }
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let fetched =
            self.fetch_positions(dataset_dir, &candidates, start_time_step, end_time_step)?;
        Ok(filter_by_distance(fetched, position, radius))
    }

    /// Mode C: all trajectories that come within `radius` of the moving
    /// query trajectory during `[start, end]`.
    ///
    /// A returned trajectory's samples run from its first in-range time
    /// step through its last, inclusive; samples in between are retained
    /// even when they momentarily leave the radius.
    pub fn query_trajectory_radius_over_time_range(
        &self,
        dataset_dir: &Path,
        trajectory_id: u32,
        radius: f32,
        cell_size: f32,
        start_time_step: i32,
        end_time_step: i32,
    ) -> Result<Vec<TrajectoryQueryResult>> {
        if start_time_step > end_time_step {
            return Err(GridError::Range(format!(
                "start time step {} exceeds end time step {}",
                start_time_step, end_time_step
            )));
        }

        // The query trajectory's own path over the range
        let own = HashSet::from([trajectory_id]);
        let own_positions =
            self.fetch_positions(dataset_dir, &own, start_time_step, end_time_step)?;
        let query_path: HashMap<i32, Vec<Vec3>> = match own_positions.into_iter().next() {
            Some((_, samples)) => {
                let mut by_step: HashMap<i32, Vec<Vec3>> = HashMap::new();
                for (time_step, position) in samples {
                    by_step.entry(time_step).or_default().push(position);
                }
                by_step
            }
            None => {
                warn!(trajectory_id, "query trajectory has no samples in range");
                return Ok(Vec::new());
            }
        };

        // Candidates near any point of the query path, per-timestep tables
        let mut candidates = HashSet::new();
        let mut steps: Vec<i32> = query_path.keys().copied().collect();
        steps.sort_unstable();
        for time_step in steps {
            let table = match self.table_for(dataset_dir, cell_size, time_step) {
                Some(table) => table,
                None => {
                    warn!(time_step, "no hash table for time step, skipping");
                    continue;
                }
            };
            for position in &query_path[&time_step] {
                candidates.extend(candidate_ids(&table, position, radius)?);
            }
        }
        candidates.remove(&trajectory_id);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let fetched =
            self.fetch_positions(dataset_dir, &candidates, start_time_step, end_time_step)?;

        let mut results = Vec::new();
        for (id, samples) in fetched {
            // Distance of each sample to the query trajectory at the same
            // time step (minimum when the query has several samples there)
            let annotated: Vec<TrajectorySamplePoint> = samples
                .into_iter()
                .map(|(time_step, position)| {
                    let distance = query_path
                        .get(&time_step)
                        .map(|refs| {
                            refs.iter()
                                .map(|r| r.distance(&position))
                                .min_by(|a, b| a.total_cmp(b))
                                .unwrap_or(f32::INFINITY)
                        })
                        .unwrap_or(f32::INFINITY);
                    TrajectorySamplePoint { position, time_step, distance }
                })
                .collect();

            // Entry-exit extension over the time-sorted sample list
            let first = annotated.iter().position(|s| s.distance <= radius);
            let last = annotated.iter().rposition(|s| s.distance <= radius);
            if let (Some(first), Some(last)) = (first, last) {
                results.push(TrajectoryQueryResult {
                    trajectory_id: id as i32,
                    sample_points: annotated[first..=last].to_vec(),
                });
            }
        }
        Ok(results)
    }

    /// Cached table if loaded, otherwise a local read-only load that is
    /// never inserted into the cache. `None` when no file exists (an
    /// empty or unbuilt time step).
    fn table_for(
        &self,
        dataset_dir: &Path,
        cell_size: f32,
        time_step: i32,
    ) -> Option<Arc<SpatialHashTable>> {
        if let Some(table) = self.manager.table(cell_size, time_step) {
            return Some(table);
        }
        let path = output_filename(dataset_dir, cell_size, time_step);
        if !path.exists() {
            return None;
        }
        match SpatialHashTable::load(&path) {
            Ok(table) => Some(Arc::new(table)),
            Err(err) => {
                warn!(path = %path.display(), %err, "local table load failed");
                None
            }
        }
    }

    /// Pull `(time_step, position)` pairs for the candidate set over
    /// `[start, end]`, grouped by trajectory and sorted by time step.
    fn fetch_positions(
        &self,
        dataset_dir: &Path,
        ids: &HashSet<u32>,
        start_time_step: i32,
        end_time_step: i32,
    ) -> Result<HashMap<u32, Vec<(i32, Vec3)>>> {
        let reader = self.manager.reader();
        let mut grouped: HashMap<u32, Vec<(i32, Vec3)>> = HashMap::new();

        for path in reader.discover(dataset_dir)? {
            let shard = reader.load_shard(&path)?;
            if !shard.overlaps(start_time_step, end_time_step) {
                continue;
            }
            for entry in &shard.entries {
                if !ids.contains(&entry.trajectory_id) {
                    continue;
                }
                for (i, position) in entry.positions.iter().enumerate() {
                    if position.has_nan() {
                        continue;
                    }
                    let time_step = shard.global_time_step(i);
                    if time_step < start_time_step || time_step > end_time_step {
                        continue;
                    }
                    grouped
                        .entry(entry.trajectory_id)
                        .or_default()
                        .push((time_step, *position));
                }
            }
        }

        // Shards are discovered in lexicographic order, which is not
        // necessarily time order.
        for samples in grouped.values_mut() {
            samples.sort_by_key(|(time_step, _)| *time_step);
        }
        Ok(grouped)
    }
}

/// Union the IDs of every cell within `ceil(radius / cell_size)` cells of
/// the query position's cell.
fn candidate_ids(table: &SpatialHashTable, position: &Vec3, radius: f32) -> Result<HashSet<u32>> {
    let cell_size = table.header.cell_size;
    let cell_radius = (radius / cell_size).ceil() as i32;
    let (cx, cy, cz) = morton::cell_from_world(position, &table.header.bbox_min, cell_size);

    let mut ids = HashSet::new();
    let mut seen_keys = HashSet::new();
    for dx in -cell_radius..=cell_radius {
        for dy in -cell_radius..=cell_radius {
            for dz in -cell_radius..=cell_radius {
                let key = morton::encode_clamped(cx + dx, cy + dy, cz + dz);
                // Clamping can alias out-of-bbox cells onto one key
                if !seen_keys.insert(key) {
                    continue;
                }
                if let Some(index) = table.find_entry(key) {
                    ids.extend(table.ids_for_entry(index)?);
                }
            }
        }
    }
    Ok(ids)
}

/// Keep samples within `radius` of `reference`, annotated with the exact
/// distance; drop trajectories with no surviving sample.
fn filter_by_distance(
    fetched: HashMap<u32, Vec<(i32, Vec3)>>,
    reference: &Vec3,
    radius: f32,
) -> Vec<TrajectoryQueryResult> {
    let mut results = Vec::new();
    for (id, samples) in fetched {
        let sample_points: Vec<TrajectorySamplePoint> = samples
            .into_iter()
            .filter_map(|(time_step, position)| {
                let distance = reference.distance(&position);
                (distance <= radius).then_some(TrajectorySamplePoint {
                    position,
                    time_step,
                    distance,
                })
            })
            .collect();
        if !sample_points.is_empty() {
            results.push(TrajectoryQueryResult { trajectory_id: id as i32, sample_points });
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadOptions;
    use crate::shard::{InMemoryShardReader, ShardData};
    use tempfile::TempDir;

    /// Three stationary trajectories, one time step:
    /// id 1 at (5,5,5), id 2 at (8,8,8), id 3 at (15,5,5).
    fn static_fixture() -> (TempDir, Arc<SpatialHashManager>) {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(InMemoryShardReader::new());

        let mut shard = ShardData::new(0, 1);
        shard.push_trajectory(1, vec![Vec3::splat(5.0)]);
        shard.push_trajectory(2, vec![Vec3::splat(8.0)]);
        shard.push_trajectory(3, vec![Vec3::new(15.0, 5.0, 5.0)]);
        reader.add_shard(dir.path(), shard);

        let manager = Arc::new(SpatialHashManager::new(reader));
        manager
            .load_hash_tables(dir.path(), 10.0, LoadOptions::range(0, 0))
            .unwrap();
        (dir, manager)
    }

    fn ids_of(results: &[TrajectoryQueryResult]) -> Vec<i32> {
        let mut ids: Vec<i32> = results.iter().map(|r| r.trajectory_id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_radius_query_exactness() {
        let (dir, manager) = static_fixture();
        let engine = QueryEngine::new(manager);
        let q = Vec3::splat(5.0);

        // r = 4: only trajectory 1 (distance 0); 2 is at sqrt(27) ~ 5.196
        let results = engine.query_radius(dir.path(), &q, 4.0, 10.0, 0).unwrap();
        assert_eq!(ids_of(&results), vec![1]);
        assert_eq!(results[0].sample_points[0].distance, 0.0);

        // r = 6: trajectories 1 and 2
        let results = engine.query_radius(dir.path(), &q, 6.0, 10.0, 0).unwrap();
        assert_eq!(ids_of(&results), vec![1, 2]);
    }

    #[test]
    fn test_no_false_negatives_across_cell_boundary() {
        // Trajectory 3 sits in the neighboring cell but within r = 11
        let (dir, manager) = static_fixture();
        let engine = QueryEngine::new(manager);

        let results = engine
            .query_radius(dir.path(), &Vec3::splat(5.0), 11.0, 10.0, 0)
            .unwrap();
        assert_eq!(ids_of(&results), vec![1, 2, 3]);
    }

    #[test]
    fn test_legacy_results_sorted_by_distance() {
        let (dir, manager) = static_fixture();
        let engine = QueryEngine::new(manager);

        let results = engine
            .query_radius_legacy(dir.path(), &Vec3::splat(5.0), 20.0, 10.0, 0)
            .unwrap();
        let ids: Vec<i32> = results.iter().map(|r| r.trajectory_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!((results[1].distance - 27.0f32.sqrt()).abs() < 1e-4);
        assert!((results[2].distance - 10.0).abs() < 1e-5);
    }

    #[test]
    fn test_dual_radius_partition() {
        let (dir, manager) = static_fixture();
        let engine = QueryEngine::new(manager);

        let (inner, outer) = engine
            .query_dual_radius(dir.path(), &Vec3::splat(5.0), 1.0, 20.0, 10.0, 0)
            .unwrap();
        assert_eq!(ids_of(&inner), vec![1]);
        assert_eq!(ids_of(&outer), vec![2, 3]);

        // Inner and outer-only never share a sample
        for result in &inner {
            assert!(result.sample_points.iter().all(|s| s.distance <= 1.0));
        }
        for result in &outer {
            assert!(result
                .sample_points
                .iter()
                .all(|s| s.distance > 1.0 && s.distance <= 20.0));
        }
    }

    #[test]
    fn test_dual_radius_rejects_inverted_radii() {
        let (dir, manager) = static_fixture();
        let engine = QueryEngine::new(manager);
        assert!(matches!(
            engine.query_dual_radius(dir.path(), &Vec3::ZERO, 5.0, 1.0, 10.0, 0),
            Err(GridError::Range(_))
        ));
    }

    #[test]
    fn test_query_outside_bbox_is_empty() {
        let (dir, manager) = static_fixture();
        let engine = QueryEngine::new(manager);
        let results = engine
            .query_radius(dir.path(), &Vec3::splat(-500.0), 5.0, 10.0, 0)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_unloaded_table_uses_local_load() {
        let (dir, manager) = static_fixture();
        manager.unload_all();
        let engine = QueryEngine::new(manager.clone());

        let results = engine
            .query_radius(dir.path(), &Vec3::splat(5.0), 6.0, 10.0, 0)
            .unwrap();
        assert_eq!(ids_of(&results), vec![1, 2]);
        // Local loads never populate the cache
        assert_eq!(manager.memory_stats().0, 0);
    }

    /// Two trajectories moving over five time steps.
    fn moving_fixture() -> (TempDir, Arc<SpatialHashManager>) {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(InMemoryShardReader::new());

        let mut shard = ShardData::new(0, 5);
        // Query trajectory 100 moves along the x axis
        shard.push_trajectory(
            100,
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(5.0, 0.0, 0.0),
                Vec3::new(10.0, 0.0, 0.0),
                Vec3::new(15.0, 0.0, 0.0),
                Vec3::new(20.0, 0.0, 0.0),
            ],
        );
        // Trajectory 7 dips into range at t=2, leaves at t=3, returns at t=4
        shard.push_trajectory(
            7,
            vec![
                Vec3::new(0.0, 100.0, 0.0),
                Vec3::new(100.0, 3.0, 0.0),
                Vec3::new(10.0, 1.0, 0.0),
                Vec3::new(100.0, 3.0, 0.0),
                Vec3::new(20.0, 3.0, 0.0),
            ],
        );
        reader.add_shard(dir.path(), shard);

        let manager = Arc::new(SpatialHashManager::new(reader));
        manager
            .load_hash_tables(dir.path(), 5.0, LoadOptions::range(0, 4))
            .unwrap();
        (dir, manager)
    }

    #[test]
    fn test_time_range_query_unions_candidates() {
        let (dir, manager) = moving_fixture();
        let engine = QueryEngine::new(manager);

        // Near (10, 0, 0): trajectory 100 passes through, trajectory 7
        // comes within 5 only at t=2
        let results = engine
            .query_radius_over_time_range(dir.path(), &Vec3::new(10.0, 0.0, 0.0), 2.0, 5.0, 0, 4)
            .unwrap();
        assert_eq!(ids_of(&results), vec![7, 100]);

        let t7 = results.iter().find(|r| r.trajectory_id == 7).unwrap();
        assert_eq!(t7.sample_points.len(), 1);
        assert_eq!(t7.sample_points[0].time_step, 2);

        // Samples come back in time-step order
        let t100 = results.iter().find(|r| r.trajectory_id == 100).unwrap();
        let steps: Vec<i32> = t100.sample_points.iter().map(|s| s.time_step).collect();
        let mut sorted = steps.clone();
        sorted.sort_unstable();
        assert_eq!(steps, sorted);
    }

    #[test]
    fn test_time_range_collapses_to_single_step() {
        let (dir, manager) = static_fixture();
        let engine = QueryEngine::new(manager);
        let q = Vec3::splat(5.0);

        let single = engine.query_radius(dir.path(), &q, 6.0, 10.0, 0).unwrap();
        let range = engine
            .query_radius_over_time_range(dir.path(), &q, 6.0, 10.0, 0, 0)
            .unwrap();
        assert_eq!(ids_of(&single), ids_of(&range));
    }

    #[test]
    fn test_time_range_rejects_inverted_range() {
        let (dir, manager) = static_fixture();
        let engine = QueryEngine::new(manager);
        assert!(matches!(
            engine.query_radius_over_time_range(dir.path(), &Vec3::ZERO, 5.0, 10.0, 3, 1),
            Err(GridError::Range(_))
        ));
    }

    #[test]
    fn test_trajectory_query_entry_exit_extension() {
        let (dir, manager) = moving_fixture();
        let engine = QueryEngine::new(manager);

        let results = engine
            .query_trajectory_radius_over_time_range(dir.path(), 100, 5.0, 5.0, 0, 4)
            .unwrap();
        assert_eq!(ids_of(&results), vec![7]);

        // In range at t=2 (d=1) and t=4 (d=3); t=3 (d~85) is retained by
        // the entry-exit extension, t=0 and t=1 are not.
        let samples = &results[0].sample_points;
        let steps: Vec<i32> = samples.iter().map(|s| s.time_step).collect();
        assert_eq!(steps, vec![2, 3, 4]);
        assert!((samples[0].distance - 1.0).abs() < 1e-5);
        assert!(samples[1].distance > 5.0);
        assert!((samples[2].distance - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_trajectory_query_excludes_self() {
        let (dir, manager) = moving_fixture();
        let engine = QueryEngine::new(manager);

        let results = engine
            .query_trajectory_radius_over_time_range(dir.path(), 100, 50.0, 5.0, 0, 4)
            .unwrap();
        assert!(results.iter().all(|r| r.trajectory_id != 100));
    }

    #[test]
    fn test_trajectory_query_unknown_id_is_empty() {
        let (dir, manager) = moving_fixture();
        let engine = QueryEngine::new(manager);

        let results = engine
            .query_trajectory_radius_over_time_range(dir.path(), 999, 5.0, 5.0, 0, 4)
            .unwrap();
        assert!(results.is_empty());
    }
}
