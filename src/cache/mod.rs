//! Write-back block cache
//!
//! [`CachedBlockStore`] absorbs many small merges in an in-memory working
//! set and writes each touched block once per flush. Reads only see
//! durable state: pending merges become visible after [`CachedBlockStore::flush`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

use crate::block::{
    AssociationBlock, BlockCodec, DEFAULT_BLOCK_CAPACITY, TOTAL_ASSOCIATIONS_SLOT,
};
use crate::merge::MergeOp;
use crate::storage::mmap::MAX_CAPACITY;
use crate::storage::{PositionStore, StoreStats};
use crate::types::{Key, Weight};
use crate::{Error, Result};

/// Runtime configuration of a [`CachedBlockStore`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Pending association count that forces a blocking flush.
    pub max_cached: usize,
    pub initial_index_capacity: u32,
    pub initial_block_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cached: 1_000_000,
            initial_index_capacity: 1024,
            initial_block_capacity: DEFAULT_BLOCK_CAPACITY,
        }
    }
}

/// Pending, not yet durable blocks keyed by source.
#[derive(Default)]
struct WorkingSet {
    pending: HashMap<Key, AssociationBlock>,
    /// Approximate number of cached associations.
    cached: usize,
}

/// Position store of association blocks with a write-back working set.
pub struct CachedBlockStore {
    store: PositionStore<BlockCodec>,
    working: Mutex<WorkingSet>,
    config: CacheConfig,
}

impl CachedBlockStore {
    pub fn open(path: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
        let store = PositionStore::open(path, BlockCodec, config.initial_index_capacity)?;
        Ok(Self {
            store,
            working: Mutex::new(WorkingSet::default()),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Empty block for `from` sized by the configured initial capacity.
    pub fn new_block(&self, from: Key) -> AssociationBlock {
        AssociationBlock::with_capacity(from, self.config.initial_block_capacity)
    }

    /// Fold `block` into the working set. The first merge for a source reads
    /// its stored block once, so every operator sees the durable prior value.
    ///
    /// Crossing `max_cached` flushes synchronously before returning. Sources
    /// the index can never address are rejected here, before they reach the
    /// working set.
    pub fn merge(&self, block: &AssociationBlock, op: MergeOp) -> Result<()> {
        if block.from_key() >= MAX_CAPACITY {
            return Err(Error::KeyOutOfRange(block.from_key()));
        }
        if block.is_empty() {
            return Ok(());
        }

        let mut working = self.working.lock();
        let from = block.from_key();
        match working.pending.get_mut(&from) {
            Some(pending) => {
                let before = pending.len();
                pending.merge(block, op)?;
                let added = pending.len() - before;
                working.cached += added;
            }
            None => {
                let folded = match self.store.get(from)? {
                    Some(mut stored) => {
                        stored.merge(block, op)?;
                        stored
                    }
                    None => block.clone(),
                };
                working.cached += folded.len();
                working.pending.insert(from, folded);
            }
        }

        if working.cached > self.config.max_cached {
            tracing::debug!(
                cached = working.cached,
                max_cached = self.config.max_cached,
                "Working set over threshold; flushing",
            );
            self.flush_locked(&mut working)?;
        }
        Ok(())
    }

    /// Build a block for `from` out of `(to, weight)` pairs and merge it.
    pub fn merge_associations<I>(&self, from: Key, pairs: I, op: MergeOp) -> Result<()>
    where
        I: IntoIterator<Item = (Key, Weight)>,
    {
        let mut block = self.new_block(from);
        for (to, weight) in pairs {
            block.merge_value(to, weight, op);
        }
        self.merge(&block, op)
    }

    /// Durable block of `from`. Pending merges are not visible here.
    pub fn get(&self, from: Key) -> Result<Option<AssociationBlock>> {
        self.store.get(from)
    }

    /// Write every pending block and clear the working set.
    pub fn flush(&self) -> Result<()> {
        let mut working = self.working.lock();
        self.flush_locked(&mut working)
    }

    fn flush_locked(&self, working: &mut WorkingSet) -> Result<()> {
        let blocks = working.pending.len();
        let mut total = self.store.meta(TOTAL_ASSOCIATIONS_SLOT)?;
        let mut written = 0usize;

        let mut keys: Vec<Key> = working.pending.keys().copied().collect();
        keys.sort_unstable();
        for from in keys {
            let Some(pending) = working.pending.get(&from) else {
                continue;
            };
            let (added, len) = self.write_back(pending)?;
            // the total tracks every durable block, so a later failure
            // cannot leave it behind the file
            total += added;
            self.store.set_meta(TOTAL_ASSOCIATIONS_SLOT, total)?;
            written += len;
            // only dropped once durable, so a failed flush can be retried
            if let Some(done) = working.pending.remove(&from) {
                working.cached = working.cached.saturating_sub(done.len());
            }
        }

        self.store.flush()?;
        working.cached = 0;

        tracing::debug!(blocks, associations = written, total, "Flushed working set");
        Ok(())
    }

    /// Write one folded block. Returns the number of new associations and
    /// the number of associations written.
    fn write_back(&self, pending: &AssociationBlock) -> Result<(u64, usize)> {
        let from = pending.from_key();
        match self.store.get(from)? {
            Some(mut stored) => {
                let before = stored.len();
                // pending already folds the stored value, so this is a replace
                stored.merge(pending, MergeOp::Overwrite)?;
                if !stored.is_changed() {
                    return Ok((0, 0));
                }
                self.store.update(from, &stored)?;
                Ok(((stored.len() - before) as u64, stored.len()))
            }
            None => {
                self.store.add(from, pending)?;
                Ok((pending.len() as u64, pending.len()))
            }
        }
    }

    /// Running total of durable associations.
    pub fn total_associations(&self) -> Result<u64> {
        self.store.meta(TOTAL_ASSOCIATIONS_SLOT)
    }

    pub fn pending_blocks(&self) -> usize {
        self.working.lock().pending.len()
    }

    pub fn pending_associations(&self) -> usize {
        self.working.lock().cached
    }

    /// Sources with a durable block.
    pub fn keys(&self) -> Result<Vec<Key>> {
        self.store.keys()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// Flush pending blocks, then rewrite the file to drop dead bytes.
    pub fn compact(&self) -> Result<()> {
        let mut working = self.working.lock();
        self.flush_locked(&mut working)?;
        self.store.compact()
    }

    /// Flush and release the store. Consumes it.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        self.store.shutdown()
    }
}

impl Drop for CachedBlockStore {
    fn drop(&mut self) {
        let working = self.working.get_mut();
        if working.pending.is_empty() {
            return;
        }
        let pending = working.pending.len();
        if let Err(err) = self.flush() {
            tracing::warn!(pending, error = %err, "Failed to flush working set on drop");
        }
    }
}
