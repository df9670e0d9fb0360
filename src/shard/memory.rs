//! In-memory shard reader
//!
//! Serves shards registered programmatically, keyed by synthetic
//! `shard-<N>.bin` paths under the dataset directory. Used by tests and
//! by embedders that already hold trajectory data in memory.

use super::{ShardData, ShardReader};
use crate::{GridError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct InMemoryShardReader {
    shards: RwLock<BTreeMap<PathBuf, ShardData>>,
}

impl InMemoryShardReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard under `<dataset_dir>/shard-<interval_start>.bin`.
    pub fn add_shard(&self, dataset_dir: &Path, shard: ShardData) -> PathBuf {
        let path = dataset_dir.join(format!("shard-{}.bin", shard.interval_start_time_step));
        self.shards.write().insert(path.clone(), shard);
        path
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }
}

impl ShardReader for InMemoryShardReader {
    fn discover(&self, dataset_dir: &Path) -> Result<Vec<PathBuf>> {
        let shards = self.shards.read();
        let paths: Vec<PathBuf> = shards
            .keys()
            .filter(|p| p.starts_with(dataset_dir))
            .cloned()
            .collect();
        if paths.is_empty() {
            return Err(GridError::MissingData(format!(
                "no shards registered for {}",
                dataset_dir.display()
            )));
        }
        // BTreeMap iteration is already lexicographic
        Ok(paths)
    }

    fn load_shard(&self, path: &Path) -> Result<ShardData> {
        self.shards
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| GridError::MissingData(format!("shard not registered: {}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;

    #[test]
    fn test_register_and_load() {
        let reader = InMemoryShardReader::new();
        let dataset = Path::new("/virtual/run");

        let mut shard = ShardData::new(0, 2);
        shard.push_trajectory(1, vec![Vec3::ZERO, Vec3::splat(1.0)]);
        let path = reader.add_shard(dataset, shard.clone());

        let paths = reader.discover(dataset).unwrap();
        assert_eq!(paths, vec![path.clone()]);
        assert_eq!(reader.load_shard(&path).unwrap(), shard);
    }

    #[test]
    fn test_discover_scoped_to_dataset() {
        let reader = InMemoryShardReader::new();
        reader.add_shard(Path::new("/a"), ShardData::new(0, 1));
        reader.add_shard(Path::new("/b"), ShardData::new(0, 1));

        assert_eq!(reader.discover(Path::new("/a")).unwrap().len(), 1);
        assert!(reader.discover(Path::new("/c")).is_err());
    }

    #[test]
    fn test_unknown_path_is_missing_data() {
        let reader = InMemoryShardReader::new();
        assert!(matches!(
            reader.load_shard(Path::new("/nope/shard-0.bin")),
            Err(GridError::MissingData(_))
        ));
    }
}
