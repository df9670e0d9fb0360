//! Per-timestep spatial hash table
//!
//! ## File format
//! ```text
//! [Header: 64 bytes] [Entries: 16 bytes each] [Trajectory IDs: 4 bytes each]
//! ```
//! All fields little-endian, packed, no trailing bytes. Entries are sorted
//! by Z-order key for binary search.
//!
//! ## Memory model
//! Loading reads the header and entries only. The trajectory ID payload
//! stays on disk and is fetched per cell on demand, so a loaded table
//! costs `64 + 16 * num_entries` bytes regardless of how many IDs it owns.

use crate::index::morton;
use crate::types::Vec3;
use crate::{GridError, Result};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic number for hash table files (ASCII "TSHT", little-endian)
pub const HASH_TABLE_MAGIC: u32 = 0x5453_4854;

/// Hash table format version
pub const HASH_TABLE_VERSION: u32 = 1;

/// Serialized header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Serialized entry size in bytes
pub const ENTRY_SIZE: usize = 16;

/// File header (64 bytes on disk)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashTableHeader {
    pub magic: u32,
    pub version: u32,
    /// Time step this table represents
    pub time_step: u32,
    /// Cell edge length in world units
    pub cell_size: f32,
    pub bbox_min: Vec3,
    pub bbox_max: Vec3,
    /// Number of entries in the entries section
    pub num_entries: u32,
    /// Total number of trajectory IDs in the IDs section
    pub num_ids: u32,
    pub reserved: [u32; 4],
}

impl Default for HashTableHeader {
    fn default() -> Self {
        Self {
            magic: HASH_TABLE_MAGIC,
            version: HASH_TABLE_VERSION,
            time_step: 0,
            cell_size: 1.0,
            bbox_min: Vec3::ZERO,
            bbox_max: Vec3::ZERO,
            num_entries: 0,
            num_ids: 0,
            reserved: [0; 4],
        }
    }
}

impl HashTableHeader {
    fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.time_step.to_le_bytes());
        buf[12..16].copy_from_slice(&self.cell_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.bbox_min.x.to_le_bytes());
        buf[20..24].copy_from_slice(&self.bbox_min.y.to_le_bytes());
        buf[24..28].copy_from_slice(&self.bbox_min.z.to_le_bytes());
        buf[28..32].copy_from_slice(&self.bbox_max.x.to_le_bytes());
        buf[32..36].copy_from_slice(&self.bbox_max.y.to_le_bytes());
        buf[36..40].copy_from_slice(&self.bbox_max.z.to_le_bytes());
        buf[40..44].copy_from_slice(&self.num_entries.to_le_bytes());
        buf[44..48].copy_from_slice(&self.num_ids.to_le_bytes());
        for (i, r) in self.reserved.iter().enumerate() {
            let at = 48 + i * 4;
            buf[at..at + 4].copy_from_slice(&r.to_le_bytes());
        }
        buf
    }

    fn deserialize(buf: &[u8; HEADER_SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let f32_at = |at: usize| f32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Self {
            magic: u32_at(0),
            version: u32_at(4),
            time_step: u32_at(8),
            cell_size: f32_at(12),
            bbox_min: Vec3::new(f32_at(16), f32_at(20), f32_at(24)),
            bbox_max: Vec3::new(f32_at(28), f32_at(32), f32_at(36)),
            num_entries: u32_at(40),
            num_ids: u32_at(44),
            reserved: [u32_at(48), u32_at(52), u32_at(56), u32_at(60)],
        }
    }
}

/// One spatial cell (16 bytes on disk)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntry {
    /// Z-order (Morton) key of the cell
    pub z_order_key: u64,
    /// Start index into the trajectory IDs array
    pub start_index: u32,
    /// Number of trajectory IDs in this cell
    pub trajectory_count: u32,
}

impl HashEntry {
    pub fn new(z_order_key: u64, start_index: u32, trajectory_count: u32) -> Self {
        Self { z_order_key, start_index, trajectory_count }
    }

    fn serialize(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.z_order_key.to_le_bytes());
        buf[8..12].copy_from_slice(&self.start_index.to_le_bytes());
        buf[12..16].copy_from_slice(&self.trajectory_count.to_le_bytes());
        buf
    }

    fn deserialize(buf: &[u8]) -> Self {
        Self {
            z_order_key: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            start_index: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            trajectory_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

/// In-memory representation of one time step's spatial hash table
#[derive(Debug, Default)]
pub struct SpatialHashTable {
    pub header: HashTableHeader,

    /// Entries sorted ascending by Z-order key
    pub entries: Vec<HashEntry>,

    /// Flat trajectory ID array. Populated while building and saving;
    /// empty after `load` (IDs are then read from `source_path` on demand).
    pub trajectory_ids: Vec<u32>,

    /// Backing file for on-demand ID reads
    source_path: Option<PathBuf>,
}

impl SpatialHashTable {
    /// Binary search for the entry holding `key`.
    pub fn find_entry(&self, key: u64) -> Option<usize> {
        self.entries.binary_search_by_key(&key, |e| e.z_order_key).ok()
    }

    /// Trajectory IDs for one entry, reading from disk when non-resident.
    pub fn ids_for_entry(&self, entry_index: usize) -> Result<Vec<u32>> {
        let entry = self
            .entries
            .get(entry_index)
            .ok_or_else(|| GridError::InvalidArgument(format!("entry index {} out of range", entry_index)))?;

        if !self.trajectory_ids.is_empty() {
            let start = entry.start_index as usize;
            let end = start + entry.trajectory_count as usize;
            if end > self.trajectory_ids.len() {
                return Err(GridError::Validation(format!(
                    "entry slice [{}, {}) exceeds resident ID array of {}",
                    start,
                    end,
                    self.trajectory_ids.len()
                )));
            }
            return Ok(self.trajectory_ids[start..end].to_vec());
        }

        self.read_ids_from_disk(entry.start_index, entry.trajectory_count)
    }

    /// Look up all trajectory IDs in the cell containing `position`.
    ///
    /// Returns an empty vec when the cell is not present in the table.
    pub fn query_at_position(&self, position: &Vec3) -> Result<Vec<u32>> {
        let (cx, cy, cz) =
            morton::cell_from_world(position, &self.header.bbox_min, self.header.cell_size);
        let key = morton::encode_clamped(cx, cy, cz);
        match self.find_entry(key) {
            Some(index) => self.ids_for_entry(index),
            None => Ok(Vec::new()),
        }
    }

    /// Write the table to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        writer.write_all(&self.header.serialize())?;
        for entry in &self.entries {
            writer.write_all(&entry.serialize())?;
        }
        for id in &self.trajectory_ids {
            writer.write_all(&id.to_le_bytes())?;
        }
        writer.flush()?;

        debug!(path = %path.display(), entries = self.entries.len(), ids = self.trajectory_ids.len(), "saved hash table");
        Ok(())
    }

    /// Load header and entries from `path`. The trajectory ID payload is
    /// left on disk and read per cell on demand.
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = HashTableHeader::deserialize(&header_buf);

        if header.magic != HASH_TABLE_MAGIC {
            return Err(GridError::Validation(format!(
                "invalid magic 0x{:08x} in {}",
                header.magic,
                path.display()
            )));
        }
        if header.version != HASH_TABLE_VERSION {
            return Err(GridError::Validation(format!(
                "unsupported version {} in {}",
                header.version,
                path.display()
            )));
        }
        if header.cell_size <= 0.0 {
            return Err(GridError::Validation(format!(
                "non-positive cell size {} in {}",
                header.cell_size,
                path.display()
            )));
        }

        let mut entries = Vec::with_capacity(header.num_entries as usize);
        let mut entry_buf = [0u8; ENTRY_SIZE];
        for _ in 0..header.num_entries {
            file.read_exact(&mut entry_buf)?;
            entries.push(HashEntry::deserialize(&entry_buf));
        }

        let table = Self {
            header,
            entries,
            trajectory_ids: Vec::new(),
            source_path: Some(path.to_path_buf()),
        };
        table.validate()?;

        debug!(path = %path.display(), entries = table.entries.len(), "loaded hash table (IDs deferred)");
        Ok(table)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.header.magic != HASH_TABLE_MAGIC {
            return Err(GridError::Validation("invalid magic number".into()));
        }
        if self.header.version != HASH_TABLE_VERSION {
            return Err(GridError::Validation(format!(
                "unsupported version {}",
                self.header.version
            )));
        }
        if self.header.cell_size <= 0.0 {
            return Err(GridError::Validation(format!(
                "cell size must be positive, got {}",
                self.header.cell_size
            )));
        }
        if self.header.num_entries as usize != self.entries.len() {
            return Err(GridError::Validation(format!(
                "header claims {} entries, table holds {}",
                self.header.num_entries,
                self.entries.len()
            )));
        }
        if !self.trajectory_ids.is_empty()
            && self.header.num_ids as usize != self.trajectory_ids.len()
        {
            return Err(GridError::Validation(format!(
                "header claims {} trajectory IDs, table holds {}",
                self.header.num_ids,
                self.trajectory_ids.len()
            )));
        }

        for window in self.entries.windows(2) {
            if window[1].z_order_key <= window[0].z_order_key {
                return Err(GridError::Validation(format!(
                    "entries not strictly ascending at key 0x{:x}",
                    window[1].z_order_key
                )));
            }
        }

        // When IDs are non-resident the header count is the authority.
        let id_count = self.header.num_ids;
        for entry in &self.entries {
            let end = entry.start_index as u64 + entry.trajectory_count as u64;
            if end > id_count as u64 {
                return Err(GridError::Validation(format!(
                    "entry slice [{}, {}) exceeds ID array of {}",
                    entry.start_index, end, id_count
                )));
            }
        }

        Ok(())
    }

    /// Approximate resident memory footprint in bytes.
    pub fn memory_bytes(&self) -> usize {
        HEADER_SIZE + self.entries.len() * ENTRY_SIZE + self.trajectory_ids.len() * 4
    }

    fn read_ids_from_disk(&self, start_index: u32, count: u32) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let end = start_index as u64 + count as u64;
        if end > self.header.num_ids as u64 {
            return Err(GridError::Validation(format!(
                "ID range [{}, {}) exceeds array of {}",
                start_index, end, self.header.num_ids
            )));
        }

        let path = self
            .source_path
            .as_ref()
            .ok_or_else(|| GridError::MissingData("hash table has no backing file for ID reads".into()))?;

        let mut file = File::open(path)?;
        let offset = HEADER_SIZE as u64
            + self.header.num_entries as u64 * ENTRY_SIZE as u64
            + start_index as u64 * 4;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; count as usize * 4];
        file.read_exact(&mut buf)?;

        Ok(buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
