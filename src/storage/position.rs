//! Indexed position store
//!
//! Maps small integer keys to variable-size records in a single append-only
//! file. Records are never reused in place unless the new serialization fits
//! in the old slot; everything else is appended and the old bytes become
//! garbage until the next [`PositionStore::reindex`].

use bytes::BytesMut;
use parking_lot::RwLock;
use std::fs;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::mmap::{MappedIndex, MAX_CAPACITY};
use super::{read_exact_at, RecordCodec};
use crate::types::Key;
use crate::{Error, Result};

/// Point-in-time statistics of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub capacity: u32,
    pub max_key: Option<Key>,
    pub live_records: usize,
    pub file_len: u64,
    /// Bytes in the record region, live and dead.
    pub record_bytes: u64,
    /// Reindex passes performed by this instance.
    pub reindexes: u64,
}

struct StoreState {
    index: MappedIndex,
    /// Current end of file; the next record is appended here.
    end: u64,
}

/// Durable `key -> record` mapping backed by one file.
///
/// Mutations are serialized through a single lock per instance. Reads share
/// the lock so that a reindex never runs underneath them.
pub struct PositionStore<C: RecordCodec> {
    path: PathBuf,
    codec: C,
    state: RwLock<Option<StoreState>>,
    reindexes: AtomicU64,
}

impl<C: RecordCodec> PositionStore<C> {
    /// Open `path`, creating it with `initial_capacity` index slots if it
    /// does not exist yet.
    pub fn open(path: impl AsRef<Path>, codec: C, initial_capacity: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists() && fs::metadata(&path)?.len() > 0;
        let index = if exists {
            MappedIndex::open(&path, C::TYPE_TAG, C::META_SLOTS)?
        } else {
            MappedIndex::create(&path, C::TYPE_TAG, C::META_SLOTS, initial_capacity)?
        };
        let end = index.file_len()?;

        tracing::info!(
            path = %path.display(),
            capacity = index.capacity(),
            max_key = ?index.max_key(),
            created = !exists,
            "Opened position store",
        );

        Ok(Self {
            path,
            codec,
            state: RwLock::new(Some(StoreState { index, end })),
            reindexes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Load the record stored under `key`.
    pub fn get(&self, key: Key) -> Result<Option<C::Record>> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        match state.index.offset(key) {
            None => Ok(None),
            Some(offset) => {
                let bytes = self.read_raw(state, offset)?;
                self.codec.decode(&bytes).map(Some)
            }
        }
    }

    pub fn contains(&self, key: Key) -> Result<bool> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        Ok(state.index.offset(key).is_some())
    }

    /// Append `record` and point `key` at it, growing the index first when
    /// `key` is beyond the current capacity.
    pub fn add(&self, key: Key, record: &C::Record) -> Result<()> {
        let mut guard = self.state.write();
        self.add_locked(&mut guard, key, record)
    }

    /// Overwrite `key`'s record in place if the new serialization fits in
    /// the old slot, otherwise append it like [`PositionStore::add`].
    pub fn update(&self, key: Key, record: &C::Record) -> Result<()> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(Error::Closed)?;

        let Some(offset) = state.index.offset(key) else {
            return self.add_locked(&mut guard, key, record);
        };

        let mut prefix = vec![0u8; C::LEN_PREFIX];
        read_exact_at(state.index.file(), &mut prefix, offset)?;
        let old_len = self.codec.stored_len(&prefix)?;
        let new_len = self.codec.encoded_len(record);
        if new_len > old_len {
            return self.add_locked(&mut guard, key, record);
        }

        let mut buf = BytesMut::with_capacity(new_len);
        self.codec.encode(record, &mut buf);
        state.index.write_at(&buf, offset)?;
        Ok(())
    }

    /// Grow the index to at least `target` slots and rewrite the file,
    /// dropping every dead byte of the record region.
    pub fn reindex(&self, target: usize) -> Result<()> {
        let mut guard = self.state.write();
        self.reindex_locked(&mut guard, target)
    }

    /// Reclaim garbage without growing the index.
    pub fn compact(&self) -> Result<()> {
        let mut guard = self.state.write();
        let capacity = guard.as_ref().ok_or(Error::Closed)?.index.capacity();
        self.reindex_locked(&mut guard, capacity as usize)
    }

    pub fn meta(&self, slot: usize) -> Result<u64> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        state.index.meta(slot)
    }

    pub fn set_meta(&self, slot: usize, value: u64) -> Result<()> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(Error::Closed)?;
        state.index.set_meta(slot, value)
    }

    /// Every key with a stored record, ascending.
    pub fn keys(&self) -> Result<Vec<Key>> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        Ok(live_keys(&state.index).collect())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        Ok(StoreStats {
            capacity: state.index.capacity(),
            max_key: state.index.max_key(),
            live_records: live_keys(&state.index).count(),
            file_len: state.end,
            record_bytes: state.end - state.index.index_end(),
            reindexes: self.reindexes.load(Ordering::Relaxed),
        })
    }

    /// Persist header, index and records.
    pub fn flush(&self) -> Result<()> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(Error::Closed)?;
        state.index.flush()
    }

    /// Flush and release the mapping. Consumes the store.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    /// Idempotent close shared by [`PositionStore::close`] and `Drop`.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let mut guard = self.state.write();
        if let Some(state) = guard.take() {
            drop(state.index.release()?);
            tracing::info!(path = %self.path.display(), "Closed position store");
        }
        Ok(())
    }

    fn add_locked(&self, slot: &mut Option<StoreState>, key: Key, record: &C::Record) -> Result<()> {
        if key >= MAX_CAPACITY {
            return Err(Error::KeyOutOfRange(key));
        }
        let capacity = slot.as_ref().ok_or(Error::Closed)?.index.capacity();
        if key >= capacity {
            self.reindex_locked(slot, key as usize + 1)?;
        }

        let state = slot.as_mut().ok_or(Error::Closed)?;
        let mut buf = BytesMut::with_capacity(self.codec.encoded_len(record));
        self.codec.encode(record, &mut buf);

        let offset = state.end;
        state.index.write_at(&buf, offset)?;
        state.end += buf.len() as u64;
        state.index.set_offset(key, offset);
        if state.index.max_key().map_or(true, |max| key > max) {
            state.index.set_max_key(key);
        }
        Ok(())
    }

    fn reindex_locked(&self, slot: &mut Option<StoreState>, target: usize) -> Result<()> {
        let started = Instant::now();
        let state = slot.as_ref().ok_or(Error::Closed)?;

        let old_capacity = state.index.capacity();
        let mut capacity = old_capacity as u64;
        while capacity < target as u64 {
            capacity *= 2;
        }
        if capacity > MAX_CAPACITY as u64 {
            return Err(Error::KeyOutOfRange(target.saturating_sub(1) as Key));
        }

        let tmp_path = self.path.with_extension("reindex");
        let live = match self.rewrite_into(state, &tmp_path, capacity as u32) {
            Ok(live) => live,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        };

        // the old mapping must be gone before the file underneath is replaced
        let old = slot.take().ok_or(Error::Closed)?;
        drop(old.index.release()?);
        fs::rename(&tmp_path, &self.path)?;

        let index = MappedIndex::open(&self.path, C::TYPE_TAG, C::META_SLOTS)?;
        let end = index.file_len()?;
        *slot = Some(StoreState { index, end });
        self.reindexes.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            path = %self.path.display(),
            old_capacity,
            new_capacity = capacity,
            live_records = live,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reindexed position store",
        );
        Ok(())
    }

    /// Stream every live record of `state` into a fresh file at `path`.
    fn rewrite_into(&self, state: &StoreState, path: &Path, capacity: u32) -> Result<usize> {
        let mut fresh = MappedIndex::create(path, C::TYPE_TAG, C::META_SLOTS, capacity)?;
        for slot in 0..C::META_SLOTS {
            fresh.set_meta(slot, state.index.meta(slot)?)?;
        }

        let mut placed = Vec::new();
        {
            let mut writer = BufWriter::new(fresh.file());
            let mut end = writer.seek(SeekFrom::Start(fresh.index_end()))?;
            for key in live_keys(&state.index) {
                let Some(offset) = state.index.offset(key) else {
                    continue;
                };
                let bytes = self.read_raw(state, offset)?;
                writer.write_all(&bytes)?;
                placed.push((key, end));
                end += bytes.len() as u64;
            }
            writer.flush()?;
        }

        for &(key, offset) in &placed {
            fresh.set_offset(key, offset);
        }
        if let Some(max_key) = state.index.max_key() {
            fresh.set_max_key(max_key);
        }
        drop(fresh.release()?);
        Ok(placed.len())
    }

    /// Raw bytes of the record at `offset`, length taken from its prefix.
    fn read_raw(&self, state: &StoreState, offset: u64) -> Result<Vec<u8>> {
        let file = state.index.file();
        let mut prefix = vec![0u8; C::LEN_PREFIX];
        read_exact_at(file, &mut prefix, offset)?;

        let len = self.codec.stored_len(&prefix)?;
        if len < C::LEN_PREFIX || offset + len as u64 > state.end {
            return Err(Error::format(format!(
                "record at offset {} with length {} runs past end of file ({})",
                offset, len, state.end
            )));
        }

        let mut bytes = vec![0u8; len];
        bytes[..C::LEN_PREFIX].copy_from_slice(&prefix);
        read_exact_at(file, &mut bytes[C::LEN_PREFIX..], offset + C::LEN_PREFIX as u64)?;
        Ok(bytes)
    }
}

impl<C: RecordCodec> Drop for PositionStore<C> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to close position store on drop");
        }
    }
}

fn live_keys(index: &MappedIndex) -> impl Iterator<Item = Key> + '_ {
    let upper = index.max_key().map_or(0, |max| max as u64 + 1);
    (0..upper)
        .map(|key| key as Key)
        .filter(move |&key| index.offset(key).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BufMut};
    use tempfile::TempDir;

    /// Length-prefixed byte strings.
    struct BlobCodec;

    impl RecordCodec for BlobCodec {
        type Record = Vec<u8>;
        const TYPE_TAG: u32 = 0xB10B;
        const META_SLOTS: usize = 1;
        const LEN_PREFIX: usize = 4;

        fn encoded_len(&self, record: &Vec<u8>) -> usize {
            4 + record.len()
        }

        fn stored_len(&self, mut prefix: &[u8]) -> Result<usize> {
            Ok(4 + prefix.get_u32_le() as usize)
        }

        fn encode(&self, record: &Vec<u8>, buf: &mut BytesMut) {
            buf.put_u32_le(record.len() as u32);
            buf.put_slice(record);
        }

        fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
            Ok(bytes[4..].to_vec())
        }
    }

    fn open(dir: &TempDir, capacity: u32) -> PositionStore<BlobCodec> {
        PositionStore::open(dir.path().join("blobs.db"), BlobCodec, capacity).unwrap()
    }

    #[test]
    fn test_add_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir, 8);

        assert_eq!(store.get(3).unwrap(), None);
        store.add(3, &b"three".to_vec()).unwrap();
        store.add(0, &b"zero".to_vec()).unwrap();

        assert_eq!(store.get(3).unwrap(), Some(b"three".to_vec()));
        assert_eq!(store.get(0).unwrap(), Some(b"zero".to_vec()));
        assert_eq!(store.get(1).unwrap(), None);
        assert_eq!(store.keys().unwrap(), vec![0, 3]);
        assert_eq!(store.stats().unwrap().max_key, Some(3));
    }

    #[test]
    fn test_update_in_place_when_it_fits() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir, 8);

        store.add(1, &b"abcdef".to_vec()).unwrap();
        let before = store.stats().unwrap().file_len;

        store.update(1, &b"xyz".to_vec()).unwrap();
        assert_eq!(store.stats().unwrap().file_len, before);
        assert_eq!(store.get(1).unwrap(), Some(b"xyz".to_vec()));

        store.update(1, &b"a much longer value".to_vec()).unwrap();
        assert!(store.stats().unwrap().file_len > before);
        assert_eq!(store.get(1).unwrap(), Some(b"a much longer value".to_vec()));
    }

    #[test]
    fn test_update_missing_key_appends() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir, 4);

        store.update(2, &b"new".to_vec()).unwrap();
        assert_eq!(store.get(2).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_growth_triggers_single_reindex() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir, 4);

        for key in 0..4 {
            store.add(key, &vec![key as u8; 3]).unwrap();
        }
        assert_eq!(store.stats().unwrap().reindexes, 0);

        store.add(20, &b"far".to_vec()).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.reindexes, 1);
        assert_eq!(stats.capacity, 32);
        assert_eq!(stats.max_key, Some(20));

        for key in 0..4 {
            assert_eq!(store.get(key).unwrap(), Some(vec![key as u8; 3]));
        }
        assert_eq!(store.get(20).unwrap(), Some(b"far".to_vec()));
    }

    #[test]
    fn test_compact_reclaims_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir, 4);

        store.add(1, &b"a".to_vec()).unwrap();
        for len in 2..10 {
            store.update(1, &vec![b'x'; len]).unwrap();
        }
        let before = store.stats().unwrap();

        store.compact().unwrap();
        let after = store.stats().unwrap();
        assert_eq!(after.capacity, before.capacity);
        assert!(after.record_bytes < before.record_bytes);
        assert_eq!(after.record_bytes, 4 + 9);
        assert_eq!(store.get(1).unwrap(), Some(vec![b'x'; 9]));
        assert!(!temp_dir.path().join("blobs.reindex").exists());
    }

    #[test]
    fn test_meta_and_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = open(&temp_dir, 2);
            store.add(0, &b"zero".to_vec()).unwrap();
            store.add(5, &b"five".to_vec()).unwrap();
            store.set_meta(0, 99).unwrap();
            store.close().unwrap();
        }

        let store = open(&temp_dir, 2);
        assert_eq!(store.meta(0).unwrap(), 99);
        assert_eq!(store.get(0).unwrap(), Some(b"zero".to_vec()));
        assert_eq!(store.get(5).unwrap(), Some(b"five".to_vec()));
        assert_eq!(store.stats().unwrap().capacity, 8);
    }

    #[test]
    fn test_meta_slot_out_of_range() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir, 4);

        let err = store.set_meta(1, u64::MAX).unwrap_err();
        assert!(matches!(err, Error::MetaSlotOutOfRange { slot: 1, slots: 1 }));
        assert!(store.meta(1).is_err());
        assert_eq!(store.stats().unwrap().capacity, 4);
    }

    #[test]
    fn test_failed_rewrite_keeps_old_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blobs.db");
        let store = open(&temp_dir, 4);

        store.add(0, &b"zero".to_vec()).unwrap();
        let corrupt_at = store.stats().unwrap().file_len;
        store.add(1, &b"one".to_vec()).unwrap();

        // a length prefix running past the end of the file
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        crate::storage::write_all_at(&file, &1000u32.to_le_bytes(), corrupt_at).unwrap();
        drop(file);

        let err = store.add(20, &b"far".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "got {err:?}");
        assert!(!temp_dir.path().join("blobs.reindex").exists());

        let stats = store.stats().unwrap();
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.reindexes, 0);
        assert_eq!(store.get(0).unwrap(), Some(b"zero".to_vec()));
        assert_eq!(store.get(20).unwrap(), None);
    }

    #[test]
    fn test_unwritable_reindex_target_is_retryable() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blobs.reindex");
        let store = open(&temp_dir, 4);
        store.add(3, &b"three".to_vec()).unwrap();

        fs::create_dir(&blocker).unwrap();
        assert!(matches!(
            store.add(9, &b"nine".to_vec()).unwrap_err(),
            Error::Io(_)
        ));
        assert_eq!(store.get(3).unwrap(), Some(b"three".to_vec()));

        fs::remove_dir(&blocker).unwrap();
        store.add(9, &b"nine".to_vec()).unwrap();
        assert_eq!(store.stats().unwrap().capacity, 16);
        assert_eq!(store.get(3).unwrap(), Some(b"three".to_vec()));
        assert_eq!(store.get(9).unwrap(), Some(b"nine".to_vec()));
    }

    #[test]
    fn test_drop_flushes() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = open(&temp_dir, 4);
            store.add(2, &b"kept".to_vec()).unwrap();
        }

        let store = open(&temp_dir, 4);
        assert_eq!(store.get(2).unwrap(), Some(b"kept".to_vec()));
    }

    #[test]
    fn test_key_out_of_range() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir, 4);

        let err = store.add(u32::MAX, &b"x".to_vec()).unwrap_err();
        assert!(matches!(err, Error::KeyOutOfRange(_)));
    }
}
