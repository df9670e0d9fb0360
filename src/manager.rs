//! Hash table manager
//!
//! Owns the cache of loaded per-timestep hash tables, keyed by
//! (cell size, time step) with a 0.001 cell-size tolerance. Tables are
//! immutable once loaded and are handed out as `Arc` clones, so a query
//! keeps its table alive even if the manager unloads it mid-flight.
//!
//! Cache mutation is expected to happen on the owner thread; workers only
//! read. The manager never loads into the cache on behalf of a worker.

use crate::config::{BuildConfig, LoadOptions};
use crate::dispatch::OwnerHandle;
use crate::index::builder::output_filename;
use crate::index::{IncrementalBuilder, SpatialHashTable};
use crate::shard::ShardReader;
use crate::types::Vec3;
use crate::{GridError, Result};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Absolute tolerance for comparing cell sizes
pub const CELL_SIZE_TOLERANCE: f32 = 0.001;

/// Cache key: time step plus cell size quantized to the tolerance, so
/// equality and hashing agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableKey {
    cell_size_ticks: i64,
    time_step: i32,
}

impl TableKey {
    pub fn new(cell_size: f32, time_step: i32) -> Self {
        Self {
            cell_size_ticks: (cell_size / CELL_SIZE_TOLERANCE).round() as i64,
            time_step,
        }
    }

    pub fn time_step(&self) -> i32 {
        self.time_step
    }

    fn matches_cell_size(&self, cell_size: f32) -> bool {
        self.cell_size_ticks == (cell_size / CELL_SIZE_TOLERANCE).round() as i64
    }
}

/// Owner of loaded hash tables and entry point for builds.
pub struct SpatialHashManager {
    reader: Arc<dyn ShardReader>,
    tables: DashMap<TableKey, Arc<SpatialHashTable>>,
    build_in_progress: Arc<AtomicBool>,
}

impl SpatialHashManager {
    pub fn new(reader: Arc<dyn ShardReader>) -> Self {
        Self {
            reader,
            tables: DashMap::new(),
            build_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shard store this manager was constructed with.
    pub fn reader(&self) -> &Arc<dyn ShardReader> {
        &self.reader
    }

    /// Load every table of `[start, end]` for `cell_size`, building the
    /// whole dataset first when files are missing and `auto_create` is on.
    ///
    /// Auto-create always builds the full dataset, not just the requested
    /// range; the subsequent load is range-limited. Returns the number of
    /// tables loaded (a timestep with no file on disk is empty, not an
    /// error). A table whose header contradicts the requested cell size or
    /// time step is reported and skipped.
    pub fn load_hash_tables(
        &self,
        dataset_dir: &Path,
        cell_size: f32,
        options: LoadOptions,
    ) -> Result<usize> {
        let LoadOptions { start_time_step, end_time_step, auto_create } = options;
        if start_time_step > end_time_step {
            return Err(GridError::Range(format!(
                "start time step {} exceeds end time step {}",
                start_time_step, end_time_step
            )));
        }

        let all_exist = (start_time_step..=end_time_step)
            .all(|ts| output_filename(dataset_dir, cell_size, ts).exists());

        if !all_exist {
            if auto_create {
                info!(cell_size, "hash tables missing, building dataset");
                let builder = IncrementalBuilder::new(self.reader.clone());
                builder.build(dataset_dir, &BuildConfig::new(cell_size))?;
            } else if !(start_time_step..=end_time_step)
                .any(|ts| output_filename(dataset_dir, cell_size, ts).exists())
            {
                return Err(GridError::MissingData(format!(
                    "no hash tables for cell size {:.3} in {} and auto-create is disabled",
                    cell_size,
                    dataset_dir.display()
                )));
            }
        }

        let mut loaded = 0usize;
        for time_step in start_time_step..=end_time_step {
            let path = output_filename(dataset_dir, cell_size, time_step);
            if !path.exists() {
                // Empty timestep: no file was written at build time.
                continue;
            }
            match self.load_hash_table(&path, cell_size, time_step) {
                Ok(_) => loaded += 1,
                Err(err) => {
                    error!(path = %path.display(), %err, "failed to load hash table");
                }
            }
        }

        info!(
            loaded,
            requested = end_time_step - start_time_step + 1,
            cell_size,
            "hash table load complete"
        );
        Ok(loaded)
    }

    /// Load a single table file into the cache.
    ///
    /// Returns `Ok(false)` when the key is already cached (the cache is
    /// left untouched), `Ok(true)` when the table was newly loaded.
    pub fn load_hash_table(&self, path: &Path, cell_size: f32, time_step: i32) -> Result<bool> {
        let key = TableKey::new(cell_size, time_step);
        if self.tables.contains_key(&key) {
            warn!(cell_size, time_step, "hash table already loaded, refusing re-load");
            return Ok(false);
        }

        let table = SpatialHashTable::load(path)?;

        if (table.header.cell_size - cell_size).abs() >= CELL_SIZE_TOLERANCE {
            return Err(GridError::Validation(format!(
                "cell size mismatch in {}: expected {:.3}, header has {:.3}",
                path.display(),
                cell_size,
                table.header.cell_size
            )));
        }
        if table.header.time_step != time_step as u32 {
            return Err(GridError::Validation(format!(
                "time step mismatch in {}: expected {}, header has {}",
                path.display(),
                time_step,
                table.header.time_step
            )));
        }

        self.tables.insert(key, Arc::new(table));
        Ok(true)
    }

    /// Drop every cached table for `cell_size`. Returns the number removed.
    pub fn unload_hash_tables(&self, cell_size: f32) -> usize {
        let keys: Vec<TableKey> = self
            .tables
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.matches_cell_size(cell_size))
            .collect();
        for key in &keys {
            self.tables.remove(key);
        }
        info!(cell_size, count = keys.len(), "unloaded hash tables");
        keys.len()
    }

    /// Drop the whole cache. Returns the number removed.
    pub fn unload_all(&self) -> usize {
        let count = self.tables.len();
        self.tables.clear();
        info!(count, "unloaded all hash tables");
        count
    }

    /// Distinct loaded cell sizes, ascending.
    pub fn loaded_cell_sizes(&self) -> Vec<f32> {
        let mut ticks: Vec<(i64, f32)> = self
            .tables
            .iter()
            .map(|e| (e.key().cell_size_ticks, e.value().header.cell_size))
            .collect();
        ticks.sort_by_key(|(t, _)| *t);
        ticks.dedup_by_key(|(t, _)| *t);
        ticks.into_iter().map(|(_, s)| s).collect()
    }

    /// Loaded time steps for one cell size, ascending.
    pub fn loaded_time_steps(&self, cell_size: f32) -> Vec<i32> {
        let mut steps: Vec<i32> = self
            .tables
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.matches_cell_size(cell_size))
            .map(|k| k.time_step)
            .collect();
        steps.sort_unstable();
        steps
    }

    pub fn is_loaded(&self, cell_size: f32, time_step: i32) -> bool {
        self.tables.contains_key(&TableKey::new(cell_size, time_step))
    }

    /// Cached table for a key, shared for the caller's lifetime.
    pub fn table(&self, cell_size: f32, time_step: i32) -> Option<Arc<SpatialHashTable>> {
        self.tables
            .get(&TableKey::new(cell_size, time_step))
            .map(|e| e.value().clone())
    }

    /// (table count, approximate resident bytes)
    pub fn memory_stats(&self) -> (usize, usize) {
        let count = self.tables.len();
        let bytes = self.tables.iter().map(|e| e.value().memory_bytes()).sum();
        (count, bytes)
    }

    /// IDs of the single cell containing `position` at `time_step`.
    pub fn query_cell(&self, position: &Vec3, cell_size: f32, time_step: i32) -> Result<Vec<u32>> {
        let table = self.table(cell_size, time_step).ok_or_else(|| {
            GridError::MissingData(format!(
                "no hash table loaded for cell size {:.3}, time step {}",
                cell_size, time_step
            ))
        })?;
        table.query_at_position(position)
    }

    pub fn build_in_progress(&self) -> bool {
        self.build_in_progress.load(Ordering::SeqCst)
    }

    /// Build the dataset's tables on a background thread.
    ///
    /// Only one build may be in flight per manager; a second call returns
    /// `Concurrency` without starting anything. On completion the build
    /// posts to the owner queue, which loads the requested range and
    /// clears the in-progress flag; the flag stays set until the owner
    /// thread pumps its queue.
    pub fn create_hash_tables_async(
        self: &Arc<Self>,
        dataset_dir: PathBuf,
        config: BuildConfig,
        load: LoadOptions,
        owner: &OwnerHandle,
    ) -> Result<()> {
        if self.build_in_progress.swap(true, Ordering::SeqCst) {
            return Err(GridError::Concurrency(
                "a hash table build is already in progress".into(),
            ));
        }

        let manager = self.clone();
        let owner = owner.clone();
        std::thread::spawn(move || {
            let builder = IncrementalBuilder::new(manager.reader.clone());
            let build_result = builder.build(&dataset_dir, &config);

            let manager_for_owner = manager.clone();
            let cell_size = config.cell_size;
            let posted = owner.post(move || {
                match build_result {
                    Ok(report) => {
                        let options = LoadOptions { auto_create: false, ..load };
                        if let Err(err) =
                            manager_for_owner.load_hash_tables(&dataset_dir, cell_size, options)
                        {
                            error!(%err, "post-build load failed");
                        } else {
                            info!(tables = report.tables_written, "async build finished");
                        }
                    }
                    Err(err) => error!(%err, "async hash table build failed"),
                }
                manager_for_owner.build_in_progress.store(false, Ordering::SeqCst);
            });

            if !posted {
                // Owner queue is gone; make sure the flag is not stuck.
                manager.build_in_progress.store(false, Ordering::SeqCst);
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OwnerQueue;
    use crate::shard::{InMemoryShardReader, ShardData};
    use std::time::Duration;
    use tempfile::TempDir;

    fn dataset_with_reader() -> (TempDir, Arc<InMemoryShardReader>) {
        let dir = TempDir::new().unwrap();
        let reader = Arc::new(InMemoryShardReader::new());

        let mut shard = ShardData::new(0, 4);
        shard.push_trajectory(
            1,
            vec![Vec3::splat(5.0), Vec3::splat(6.0), Vec3::splat(7.0), Vec3::splat(8.0)],
        );
        shard.push_trajectory(
            2,
            vec![
                Vec3::new(15.0, 5.0, 5.0),
                Vec3::new(15.0, 6.0, 5.0),
                Vec3::new(15.0, 7.0, 5.0),
                Vec3::new(15.0, 8.0, 5.0),
            ],
        );
        reader.add_shard(dir.path(), shard);
        (dir, reader)
    }

    #[test]
    fn test_table_key_tolerance() {
        assert_eq!(TableKey::new(10.0, 3), TableKey::new(10.0004, 3));
        assert_ne!(TableKey::new(10.0, 3), TableKey::new(10.002, 3));
        assert_ne!(TableKey::new(10.0, 3), TableKey::new(10.0, 4));
    }

    #[test]
    fn test_auto_create_and_introspection() {
        let (dir, reader) = dataset_with_reader();
        let manager = SpatialHashManager::new(reader);

        let loaded = manager
            .load_hash_tables(dir.path(), 10.0, LoadOptions::range(0, 3))
            .unwrap();
        assert_eq!(loaded, 4);

        assert_eq!(manager.loaded_cell_sizes(), vec![10.0]);
        assert_eq!(manager.loaded_time_steps(10.0), vec![0, 1, 2, 3]);
        assert!(manager.is_loaded(10.0, 2));
        assert!(!manager.is_loaded(10.0, 4));
        assert!(!manager.is_loaded(5.0, 0));

        let (count, bytes) = manager.memory_stats();
        assert_eq!(count, 4);
        // Each table: header + two entries, IDs deferred
        assert_eq!(bytes, 4 * (64 + 2 * 16));

        assert_eq!(manager.query_cell(&Vec3::splat(5.0), 10.0, 0).unwrap(), vec![1]);
    }

    #[test]
    fn test_missing_without_auto_create() {
        let (dir, reader) = dataset_with_reader();
        let manager = SpatialHashManager::new(reader);

        let result = manager.load_hash_tables(
            dir.path(),
            10.0,
            LoadOptions::range(0, 3).no_auto_create(),
        );
        assert!(matches!(result, Err(GridError::MissingData(_))));
    }

    #[test]
    fn test_refuses_cached_reload() {
        let (dir, reader) = dataset_with_reader();
        let manager = SpatialHashManager::new(reader);
        manager
            .load_hash_tables(dir.path(), 10.0, LoadOptions::range(0, 0))
            .unwrap();

        let path = output_filename(dir.path(), 10.0, 0);
        assert!(!manager.load_hash_table(&path, 10.0, 0).unwrap());
        assert_eq!(manager.memory_stats().0, 1);
    }

    #[test]
    fn test_header_mismatch_is_skipped() {
        let (dir, reader) = dataset_with_reader();
        let manager = SpatialHashManager::new(reader);
        manager
            .load_hash_tables(dir.path(), 10.0, LoadOptions::range(0, 3))
            .unwrap();
        manager.unload_all();

        // Asking for the wrong time step against the real file fails validation
        let path = output_filename(dir.path(), 10.0, 0);
        assert!(matches!(
            manager.load_hash_table(&path, 10.0, 7),
            Err(GridError::Validation(_))
        ));
        assert!(matches!(
            manager.load_hash_table(&path, 9.0, 0),
            Err(GridError::Validation(_))
        ));
        assert_eq!(manager.memory_stats().0, 0);
    }

    #[test]
    fn test_unload_by_cell_size() {
        let (dir, reader) = dataset_with_reader();
        let manager = SpatialHashManager::new(reader);
        manager
            .load_hash_tables(dir.path(), 10.0, LoadOptions::range(0, 3))
            .unwrap();
        manager
            .load_hash_tables(dir.path(), 20.0, LoadOptions::range(0, 3))
            .unwrap();
        assert_eq!(manager.loaded_cell_sizes().len(), 2);

        assert_eq!(manager.unload_hash_tables(10.0), 4);
        assert_eq!(manager.loaded_cell_sizes(), vec![20.0]);

        assert_eq!(manager.unload_all(), 4);
        assert_eq!(manager.memory_stats().0, 0);
    }

    #[test]
    fn test_unload_keeps_outstanding_references_alive() {
        let (dir, reader) = dataset_with_reader();
        let manager = SpatialHashManager::new(reader);
        manager
            .load_hash_tables(dir.path(), 10.0, LoadOptions::range(0, 0))
            .unwrap();

        let table = manager.table(10.0, 0).unwrap();
        manager.unload_all();

        // The Arc clone still answers queries
        assert_eq!(table.query_at_position(&Vec3::splat(5.0)).unwrap(), vec![1]);
    }

    #[test]
    fn test_async_build_single_flight() {
        let (dir, reader) = dataset_with_reader();
        let manager = Arc::new(SpatialHashManager::new(reader));
        let queue = OwnerQueue::new();

        manager
            .create_hash_tables_async(
                dir.path().to_path_buf(),
                BuildConfig::new(10.0),
                LoadOptions::range(0, 3),
                &queue.handle(),
            )
            .unwrap();

        // The flag clears only on the owner thread, so a second build is
        // refused deterministically until we pump the queue.
        assert!(matches!(
            manager.create_hash_tables_async(
                dir.path().to_path_buf(),
                BuildConfig::new(10.0),
                LoadOptions::range(0, 3),
                &queue.handle(),
            ),
            Err(GridError::Concurrency(_))
        ));

        assert!(queue.run_until(Duration::from_secs(10), || !manager.build_in_progress()));
        assert_eq!(manager.loaded_time_steps(10.0), vec![0, 1, 2, 3]);
    }
}
