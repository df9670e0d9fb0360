//! Incremental out-of-core index construction
//!
//! Turns a directory of shard files into one hash-table file per time
//! step in two passes:
//!
//! 1. **Scan** every shard once to establish the global time range and
//!    (optionally) the bounding box. Shards are loaded and freed one at
//!    a time.
//! 2. **Batch build**: shards are processed in fixed-size batches. Each
//!    batch is extracted into per-timestep sample buckets in parallel,
//!    then every occupied timestep's table is built and saved in
//!    parallel. Peak memory is bounded by the batch size, not the
//!    dataset size.
//!
//! A timestep with no samples produces no file; queries against it
//! return empty.

use crate::config::BuildConfig;
use crate::index::builder;
use crate::shard::ShardReader;
use crate::types::{Aabb, TrajectorySample};
use crate::{GridError, Result};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of pass 1
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub min_time_step: i32,
    pub max_time_step: i32,
    /// Final bounding box used for every table (computed + margin, or the
    /// configured one)
    pub bbox: Aabb,
    /// Shards that loaded successfully, in lexicographic order
    pub shard_paths: Vec<PathBuf>,
    pub shards_skipped: usize,
}

/// Outcome of a full build
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub tables_written: usize,
    pub min_time_step: i32,
    pub max_time_step: i32,
    pub bbox: Aabb,
}

/// Two-pass batched builder over a shard store.
pub struct IncrementalBuilder {
    reader: Arc<dyn ShardReader>,
}

impl IncrementalBuilder {
    pub fn new(reader: Arc<dyn ShardReader>) -> Self {
        Self { reader }
    }

    /// Run both passes and write the tables under
    /// `<dataset_dir>/spatial_hashing/cellsize_<...>/`.
    pub fn build(&self, dataset_dir: &Path, config: &BuildConfig) -> Result<BuildReport> {
        if config.cell_size <= 0.0 {
            return Err(GridError::InvalidArgument(format!(
                "cell size must be positive, got {}",
                config.cell_size
            )));
        }
        if !config.compute_bounding_box && !config.bbox.is_valid() {
            return Err(GridError::InvalidArgument(
                "supplied bounding box has min > max".into(),
            ));
        }

        let scan = self.scan(dataset_dir, config)?;
        info!(
            min_ts = scan.min_time_step,
            max_ts = scan.max_time_step,
            shards = scan.shard_paths.len(),
            skipped = scan.shards_skipped,
            "scan pass complete"
        );

        let tables_written = self.build_batches(dataset_dir, config, &scan)?;
        info!(tables_written, "batch build complete");

        Ok(BuildReport {
            tables_written,
            min_time_step: scan.min_time_step,
            max_time_step: scan.max_time_step,
            bbox: scan.bbox,
        })
    }

    /// Pass 1: fold time range and bounding box over every shard.
    ///
    /// A shard that fails to load is logged and skipped; the pass fails
    /// only when no shard could be read at all.
    pub fn scan(&self, dataset_dir: &Path, config: &BuildConfig) -> Result<ScanSummary> {
        let candidates = self.reader.discover(dataset_dir)?;

        let mut min_time_step = i32::MAX;
        let mut max_time_step = i32::MIN;
        let mut bbox = Aabb::empty();
        let mut shard_paths = Vec::with_capacity(candidates.len());
        let mut shards_skipped = 0usize;

        for path in candidates {
            let shard = match self.reader.load_shard(&path) {
                Ok(shard) => shard,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable shard");
                    shards_skipped += 1;
                    continue;
                }
            };

            min_time_step = min_time_step.min(shard.interval_start_time_step);
            max_time_step = max_time_step.max(shard.interval_end_time_step());

            if config.compute_bounding_box {
                for entry in &shard.entries {
                    for position in &entry.positions {
                        if !position.has_nan() {
                            bbox.expand(position);
                        }
                    }
                }
            }

            shard_paths.push(path);
            // shard dropped here; pass 1 never holds more than one
        }

        if shard_paths.is_empty() {
            return Err(GridError::MissingData(format!(
                "no readable shards in {}",
                dataset_dir.display()
            )));
        }

        let bbox = if config.compute_bounding_box {
            if !bbox.is_valid() {
                return Err(GridError::MissingData(
                    "dataset contains no finite positions to bound".into(),
                ));
            }
            let mut bbox = bbox;
            bbox.expand_by_margin(config.bounding_box_margin);
            bbox
        } else {
            config.bbox
        };

        Ok(ScanSummary {
            min_time_step,
            max_time_step,
            bbox,
            shard_paths,
            shards_skipped,
        })
    }

    /// Pass 2: extract and build, one batch of shards at a time.
    fn build_batches(
        &self,
        dataset_dir: &Path,
        config: &BuildConfig,
        scan: &ScanSummary,
    ) -> Result<usize> {
        let batch_size = config.batch_size.max(1);
        let table_config = config.clone().with_bbox(scan.bbox);

        let tables_written = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<GridError>> = Mutex::new(None);

        let record_error = |err: GridError| {
            failed.store(true, Ordering::SeqCst);
            let mut slot = first_error.lock();
            if slot.is_none() {
                error!(%err, "batch build failed");
                *slot = Some(err);
            }
        };

        for (batch_index, batch_paths) in scan.shard_paths.chunks(batch_size).enumerate() {
            // Load the whole batch in parallel.
            let shards: Vec<_> = batch_paths
                .par_iter()
                .map(|path| self.reader.load_shard(path))
                .collect();

            let mut loaded = Vec::with_capacity(shards.len());
            for shard in shards {
                match shard {
                    Ok(shard) => loaded.push(shard),
                    Err(err) => {
                        record_error(err);
                        break;
                    }
                }
            }
            if failed.load(Ordering::SeqCst) {
                break;
            }

            let batch_min = loaded.iter().map(|s| s.interval_start_time_step).min().unwrap();
            let batch_max = loaded.iter().map(|s| s.interval_end_time_step()).max().unwrap();
            let bucket_count = (batch_max - batch_min + 1) as usize;

            // Extract samples in parallel across shards. Each worker fills
            // local buckets and merges them under the mutex once per shard,
            // so the per-bucket order stays race-free.
            let buckets: Mutex<Vec<Vec<TrajectorySample>>> =
                Mutex::new(vec![Vec::new(); bucket_count]);

            loaded.par_iter().for_each(|shard| {
                if failed.load(Ordering::SeqCst) {
                    return;
                }

                let mut local: Vec<Vec<TrajectorySample>> = vec![Vec::new(); bucket_count];
                for entry in &shard.entries {
                    for (i, position) in entry.positions.iter().enumerate() {
                        if position.has_nan() {
                            continue;
                        }
                        let time_step = shard.global_time_step(i);
                        let slot = (time_step - batch_min) as usize;
                        local[slot].push(TrajectorySample::new(
                            entry.trajectory_id,
                            time_step,
                            *position,
                        ));
                    }
                }

                let mut shared = buckets.lock();
                for (slot, mut samples) in local.into_iter().enumerate() {
                    if !samples.is_empty() {
                        shared[slot].append(&mut samples);
                    }
                }
            });

            drop(loaded);
            let buckets = buckets.into_inner();

            // Build and save every occupied timestep of the batch in parallel.
            buckets.into_par_iter().enumerate().for_each(|(slot, samples)| {
                if failed.load(Ordering::SeqCst) || samples.is_empty() {
                    return;
                }
                let time_step = batch_min + slot as i32;

                let result = builder::build_for_time_step(time_step, &samples, &table_config)
                    .and_then(|table| {
                        let path = builder::output_filename(dataset_dir, config.cell_size, time_step);
                        table.save(&path)
                    });

                match result {
                    Ok(()) => {
                        tables_written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => record_error(err),
                }
            });

            if failed.load(Ordering::SeqCst) {
                break;
            }

            info!(batch = batch_index, batch_min, batch_max, "batch processed");
        }

        // Completed batches stay on disk; partial output is never deleted.
        if let Some(err) = first_error.into_inner() {
            return Err(err);
        }
        Ok(tables_written.load(Ordering::Relaxed))
    }
}
