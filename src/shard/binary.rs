//! On-disk shard reader and writer
//!
//! ## File format (`shard-<N>.bin`)
//! ```text
//! [Header: 32 bytes] [Entry 0] [Entry 1] ...
//! Entry: [id: u32] [start_offset: i32] [valid_count: i32]
//!        [positions: interval_size * 3 * f32]
//! ```
//! Little-endian, packed. Missing samples are NaN triples.

use super::{ShardData, ShardEntry, ShardReader};
use crate::types::Vec3;
use crate::{GridError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic number for shard files (ASCII "TDSH", little-endian)
pub const SHARD_MAGIC: u32 = 0x4853_4454;

/// Shard format version
pub const SHARD_VERSION: u32 = 1;

const SHARD_HEADER_SIZE: usize = 32;
const ENTRY_HEADER_SIZE: usize = 12;

/// Reads `shard-<N>.bin` files from a dataset directory.
#[derive(Debug, Default, Clone)]
pub struct BinaryShardReader;

impl BinaryShardReader {
    pub fn new() -> Self {
        Self
    }
}

impl ShardReader for BinaryShardReader {
    fn discover(&self, dataset_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for dir_entry in std::fs::read_dir(dataset_dir)? {
            let path = dir_entry?.path();
            let is_shard = path
                .extension()
                .map(|ext| ext == "bin")
                .unwrap_or(false)
                && super::parse_timestep_from_filename(&path).is_some();
            if is_shard && path.is_file() {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(GridError::MissingData(format!(
                "no shard files found in {}",
                dataset_dir.display()
            )));
        }
        paths.sort();
        Ok(paths)
    }

    fn load_shard(&self, path: &Path) -> Result<ShardData> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(256 * 1024, file);

        let mut header = [0u8; SHARD_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let u32_at = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        let i32_at = |at: usize| i32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);

        let magic = u32_at(0);
        if magic != SHARD_MAGIC {
            return Err(GridError::Corrupted(path.to_path_buf()));
        }
        let version = u32_at(4);
        if version != SHARD_VERSION {
            return Err(GridError::Validation(format!(
                "unsupported shard version {} in {}",
                version,
                path.display()
            )));
        }

        let interval_start_time_step = i32_at(8);
        let interval_size = i32_at(12);
        let entry_count = u32_at(16);

        if interval_size <= 0 {
            return Err(GridError::Corrupted(path.to_path_buf()));
        }

        let mut shard = ShardData::new(interval_start_time_step, interval_size);
        shard.entries.reserve(entry_count as usize);

        let positions_bytes = interval_size as usize * 12;
        let mut entry_header = [0u8; ENTRY_HEADER_SIZE];
        let mut positions_buf = vec![0u8; positions_bytes];

        for _ in 0..entry_count {
            reader.read_exact(&mut entry_header)?;
            let trajectory_id = u32::from_le_bytes(entry_header[0..4].try_into().unwrap());
            let start_offset_in_interval = i32::from_le_bytes(entry_header[4..8].try_into().unwrap());
            let valid_sample_count = i32::from_le_bytes(entry_header[8..12].try_into().unwrap());

            reader.read_exact(&mut positions_buf)?;
            let positions: Vec<Vec3> = positions_buf
                .chunks_exact(12)
                .map(|c| {
                    Vec3::new(
                        f32::from_le_bytes(c[0..4].try_into().unwrap()),
                        f32::from_le_bytes(c[4..8].try_into().unwrap()),
                        f32::from_le_bytes(c[8..12].try_into().unwrap()),
                    )
                })
                .collect();

            shard.entries.push(ShardEntry {
                trajectory_id,
                start_offset_in_interval,
                valid_sample_count,
                positions,
            });
        }

        debug!(
            path = %path.display(),
            interval_start = interval_start_time_step,
            interval_size,
            entries = shard.entries.len(),
            "loaded shard"
        );
        Ok(shard)
    }
}

/// Write a shard in the binary format, creating parent directories.
pub fn write_shard(path: &Path, shard: &ShardData) -> Result<()> {
    if shard.interval_size <= 0 {
        return Err(GridError::InvalidArgument(format!(
            "interval size must be positive, got {}",
            shard.interval_size
        )));
    }
    for entry in &shard.entries {
        if entry.positions.len() != shard.interval_size as usize {
            return Err(GridError::InvalidArgument(format!(
                "trajectory {} has {} positions, interval size is {}",
                entry.trajectory_id,
                entry.positions.len(),
                shard.interval_size
            )));
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(256 * 1024, file);

    let mut header = [0u8; SHARD_HEADER_SIZE];
    header[0..4].copy_from_slice(&SHARD_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&SHARD_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&shard.interval_start_time_step.to_le_bytes());
    header[12..16].copy_from_slice(&shard.interval_size.to_le_bytes());
    header[16..20].copy_from_slice(&(shard.entries.len() as u32).to_le_bytes());
    writer.write_all(&header)?;

    for entry in &shard.entries {
        writer.write_all(&entry.trajectory_id.to_le_bytes())?;
        writer.write_all(&entry.start_offset_in_interval.to_le_bytes())?;
        writer.write_all(&entry.valid_sample_count.to_le_bytes())?;
        for p in &entry.positions {
            writer.write_all(&p.x.to_le_bytes())?;
            writer.write_all(&p.y.to_le_bytes())?;
            writer.write_all(&p.z.to_le_bytes())?;
        }
    }
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_shard() -> ShardData {
        let nan = Vec3::splat(f32::NAN);
        let mut shard = ShardData::new(10, 3);
        shard.push_trajectory(1, vec![Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0), nan]);
        shard.push_trajectory(2, vec![nan, Vec3::new(7.0, 8.0, 9.0), Vec3::new(10.0, 11.0, 12.0)]);
        shard
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard-10.bin");

        let shard = sample_shard();
        write_shard(&path, &shard).unwrap();

        let loaded = BinaryShardReader::new().load_shard(&path).unwrap();
        assert_eq!(loaded.interval_start_time_step, 10);
        assert_eq!(loaded.interval_size, 3);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[0].trajectory_id, 1);
        assert_eq!(loaded.entries[0].start_offset_in_interval, 0);
        assert_eq!(loaded.entries[0].valid_sample_count, 2);
        assert_eq!(loaded.entries[0].positions[1], Vec3::new(4.0, 5.0, 6.0));
        assert!(loaded.entries[0].positions[2].has_nan());
        assert_eq!(loaded.entries[1].start_offset_in_interval, 1);
    }

    #[test]
    fn test_discover_sorted() {
        let dir = TempDir::new().unwrap();
        let shard = sample_shard();
        for name in ["shard-20.bin", "shard-0.bin", "shard-10.bin"] {
            write_shard(&dir.path().join(name), &shard).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let paths = BinaryShardReader::new().discover(dir.path()).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["shard-0.bin", "shard-10.bin", "shard-20.bin"]);
    }

    #[test]
    fn test_discover_empty_dir_is_missing_data() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            BinaryShardReader::new().discover(dir.path()),
            Err(GridError::MissingData(_))
        ));
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard-0.bin");
        write_shard(&path, &sample_shard()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 0xAA;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            BinaryShardReader::new().load_shard(&path),
            Err(GridError::Corrupted(_))
        ));
    }

    #[test]
    fn test_write_rejects_length_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut shard = ShardData::new(0, 5);
        shard.entries.push(ShardEntry {
            trajectory_id: 1,
            start_offset_in_interval: 0,
            valid_sample_count: 2,
            positions: vec![Vec3::ZERO; 2],
        });
        assert!(write_shard(&dir.path().join("shard-0.bin"), &shard).is_err());
    }

    #[test]
    fn test_truncated_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard-0.bin");
        write_shard(&path, &sample_shard()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(matches!(
            BinaryShardReader::new().load_shard(&path),
            Err(GridError::Io(_))
        ));
    }
}
