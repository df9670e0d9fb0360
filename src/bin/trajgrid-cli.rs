//! Command-line driver for the trajgrid index engine
//!
//! `build` turns a set of shard files into per-timestep hash tables;
//! `query` runs a single radius query against a built dataset.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trajgrid::shard::{BinaryShardReader, ShardData, ShardReader};
use trajgrid::{
    BuildConfig, GridError, LoadOptions, QueryEngine, Result, SpatialHashManager, Vec3,
};

#[derive(Parser)]
#[command(name = "trajgrid-cli", version, about = "Spatial hash index for trajectory datasets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build hash tables from trajectory shard files
    Build {
        /// Shard files (shard-<N>.bin)
        #[arg(required = true)]
        shards: Vec<PathBuf>,

        /// Output dataset directory
        #[arg(short, long)]
        output: PathBuf,

        /// Cell size in world units
        #[arg(short, long, default_value_t = 10.0)]
        cell_size: f32,

        /// Margin added to the computed bounding box
        #[arg(long, default_value_t = 1.0)]
        margin: f32,

        /// Shards processed per batch
        #[arg(long, default_value_t = trajgrid::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },

    /// Query trajectories within a radius of a point at one time step
    Query {
        /// Dataset directory (shards + spatial_hashing/)
        dataset: PathBuf,

        /// Query position as x,y,z
        #[arg(short, long, value_parser = parse_position)]
        position: Vec3,

        /// Search radius in world units
        #[arg(short, long)]
        radius: f32,

        /// Cell size of the tables to use
        #[arg(short, long, default_value_t = 10.0)]
        cell_size: f32,

        /// Time step to query
        #[arg(short, long)]
        time_step: i32,
    },
}

fn parse_position(s: &str) -> std::result::Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected x,y,z, got '{}'", s));
    }
    let coord = |i: usize| -> std::result::Result<f32, String> {
        parts[i].trim().parse().map_err(|e| format!("bad coordinate '{}': {}", parts[i], e))
    };
    Ok(Vec3::new(coord(0)?, coord(1)?, coord(2)?))
}

/// Restricts discovery to an explicit shard list so the builder only
/// sees the files named on the command line.
struct ExplicitShards {
    paths: Vec<PathBuf>,
    inner: BinaryShardReader,
}

impl ShardReader for ExplicitShards {
    fn discover(&self, _dataset_dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(self.paths.clone())
    }

    fn load_shard(&self, path: &Path) -> Result<ShardData> {
        self.inner.load_shard(path)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build { shards, output, cell_size, margin, batch_size } => {
            let mut paths = shards;
            for path in &paths {
                if !path.is_file() {
                    return Err(GridError::MissingData(format!(
                        "shard file not found: {}",
                        path.display()
                    )));
                }
            }
            paths.sort();

            let reader = Arc::new(ExplicitShards { paths, inner: BinaryShardReader::new() });
            let builder = trajgrid::IncrementalBuilder::new(reader);
            let config = BuildConfig::new(cell_size)
                .with_margin(margin)
                .with_batch_size(batch_size);

            let report = builder.build(&output, &config)?;
            println!(
                "built {} hash tables for time steps [{}, {}] under {}",
                report.tables_written,
                report.min_time_step,
                report.max_time_step,
                output.join("spatial_hashing").display()
            );
            Ok(())
        }

        Command::Query { dataset, position, radius, cell_size, time_step } => {
            let manager = Arc::new(SpatialHashManager::new(Arc::new(BinaryShardReader::new())));
            manager.load_hash_tables(
                &dataset,
                cell_size,
                LoadOptions::range(time_step, time_step).no_auto_create(),
            )?;

            let engine = QueryEngine::new(manager);
            let mut results =
                engine.query_radius_legacy(&dataset, &position, radius, cell_size, time_step)?;
            results.sort_by(|a, b| a.distance.total_cmp(&b.distance));

            if results.is_empty() {
                println!("no trajectories within {} at time step {}", radius, time_step);
            } else {
                for result in results {
                    println!("trajectory {:>8}  distance {:.3}", result.trajectory_id, result.distance);
                }
            }
            Ok(())
        }
    }
}
