//! Memory-mapped header and position index.
//!
//! [`MappedIndex`] owns both the store file and the mapping over its header
//! and index table. The file handle can only be taken back through
//! [`MappedIndex::release`], which flushes and unmaps first, so a file can
//! never be replaced or deleted while a mapping over it is still alive.

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;

use super::{read_exact_at, write_all_at};
use crate::types::Key;
use crate::{Error, Result};

pub const MAGIC: &[u8; 4] = b"ASOC";
pub const FORMAT_VERSION: u32 = 1;

/// Largest index capacity a file may declare.
pub const MAX_CAPACITY: u32 = 1 << 31;

/// magic + version + record tag + meta slot count
const FIXED_HEADER_LEN: usize = 16;
/// On-disk marker for "no key set yet".
const NO_KEY: u32 = u32::MAX;

pub struct MappedIndex {
    file: File,
    map: MmapMut,
    meta_slots: usize,
}

impl MappedIndex {
    /// Create (or truncate) `path` with an empty index of `capacity` slots.
    pub fn create(path: &Path, tag: u32, meta_slots: usize, capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
            return Err(Error::format(format!(
                "index capacity must be a power of two in 1..={}, got {}",
                MAX_CAPACITY, capacity
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let index_end = index_end(meta_slots, capacity);
        // zero-filled, so every offset starts out absent
        file.set_len(index_end)?;

        let mut index = Self::map(file, meta_slots, index_end)?;
        index.map[0..4].copy_from_slice(MAGIC);
        index.write_u32(4, FORMAT_VERSION);
        index.write_u32(8, tag);
        index.write_u32(12, meta_slots as u32);
        let table = index.table_offset();
        index.write_u32(table, capacity);
        index.write_u32(table + 4, NO_KEY);
        Ok(index)
    }

    /// Open an existing file, validating its header against the codec.
    pub fn open(path: &Path, tag: u32, meta_slots: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        let header_len = (FIXED_HEADER_LEN + meta_slots * 8) as u64;
        if len < header_len + 8 {
            return Err(Error::format(format!(
                "{:?} is too short to hold a store header ({} bytes)",
                path, len
            )));
        }

        let mut fixed = [0u8; FIXED_HEADER_LEN];
        read_exact_at(&file, &mut fixed, 0)?;
        if &fixed[0..4] != MAGIC {
            return Err(Error::format(format!("{:?}: bad magic bytes", path)));
        }
        let version = le_u32(&fixed[4..8]);
        if version != FORMAT_VERSION {
            return Err(Error::format(format!(
                "{:?}: unsupported format version {}",
                path, version
            )));
        }
        let stored_tag = le_u32(&fixed[8..12]);
        if stored_tag != tag {
            return Err(Error::format(format!(
                "{:?}: record type mismatch (file has {:#x}, expected {:#x})",
                path, stored_tag, tag
            )));
        }
        let stored_slots = le_u32(&fixed[12..16]) as usize;
        if stored_slots != meta_slots {
            return Err(Error::format(format!(
                "{:?}: expected {} metadata slots, file has {}",
                path, meta_slots, stored_slots
            )));
        }

        let mut table = [0u8; 8];
        read_exact_at(&file, &mut table, header_len)?;
        let capacity = le_u32(&table[0..4]);
        let max_key = le_u32(&table[4..8]);
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
            return Err(Error::format(format!(
                "{:?}: bogus index capacity {}",
                path, capacity
            )));
        }
        if max_key != NO_KEY && max_key >= capacity {
            return Err(Error::format(format!(
                "{:?}: max key {} not below capacity {}",
                path, max_key, capacity
            )));
        }
        let index_end = index_end(meta_slots, capacity);
        if len < index_end {
            return Err(Error::format(format!(
                "{:?}: index table truncated ({} < {} bytes)",
                path, len, index_end
            )));
        }

        Self::map(file, meta_slots, index_end)
    }

    fn map(file: File, meta_slots: usize, len: u64) -> Result<Self> {
        // SAFETY: the mapping never outlives `file`, and only this instance
        // writes to the header region while it is mapped.
        let map = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };
        Ok(Self {
            file,
            map,
            meta_slots,
        })
    }

    fn table_offset(&self) -> usize {
        FIXED_HEADER_LEN + self.meta_slots * 8
    }

    fn slot_offset(&self, key: Key) -> usize {
        self.table_offset() + 8 + key as usize * 8
    }

    pub fn capacity(&self) -> u32 {
        self.read_u32(self.table_offset())
    }

    pub fn max_key(&self) -> Option<Key> {
        match self.read_u32(self.table_offset() + 4) {
            NO_KEY => None,
            key => Some(key),
        }
    }

    pub fn set_max_key(&mut self, key: Key) {
        let at = self.table_offset() + 4;
        self.write_u32(at, key);
    }

    /// Absolute file offset of `key`'s record, if set.
    pub fn offset(&self, key: Key) -> Option<u64> {
        if key >= self.capacity() {
            return None;
        }
        match self.read_u64(self.slot_offset(key)) {
            0 => None,
            offset => Some(offset),
        }
    }

    pub fn set_offset(&mut self, key: Key, offset: u64) {
        debug_assert!(key < self.capacity());
        let at = self.slot_offset(key);
        self.write_u64(at, offset);
    }

    pub fn meta(&self, slot: usize) -> Result<u64> {
        let at = self.meta_offset(slot)?;
        Ok(self.read_u64(at))
    }

    pub fn set_meta(&mut self, slot: usize, value: u64) -> Result<()> {
        let at = self.meta_offset(slot)?;
        self.write_u64(at, value);
        Ok(())
    }

    fn meta_offset(&self, slot: usize) -> Result<usize> {
        if slot >= self.meta_slots {
            return Err(Error::MetaSlotOutOfRange {
                slot,
                slots: self.meta_slots,
            });
        }
        Ok(FIXED_HEADER_LEN + slot * 8)
    }

    /// First byte of the record region.
    pub fn index_end(&self) -> u64 {
        self.map.len() as u64
    }

    /// The underlying file, for record I/O past the mapped region.
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Persist header, index and record writes.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush, unmap, and hand back the file handle.
    pub fn release(self) -> Result<File> {
        self.flush()?;
        let Self { file, map, .. } = self;
        drop(map);
        Ok(file)
    }

    /// Write raw bytes into the record region.
    pub fn write_at(&self, bytes: &[u8], offset: u64) -> Result<()> {
        debug_assert!(offset >= self.index_end());
        write_all_at(&self.file, bytes, offset)?;
        Ok(())
    }

    fn read_u32(&self, at: usize) -> u32 {
        le_u32(&self.map[at..at + 4])
    }

    fn read_u64(&self, at: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[at..at + 8]);
        u64::from_le_bytes(buf)
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.map[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, at: usize, value: u64) {
        self.map[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn index_end(meta_slots: usize, capacity: u32) -> u64 {
    (FIXED_HEADER_LEN + meta_slots * 8 + 8) as u64 + capacity as u64 * 8
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}
