use assocstore::block::AssociationBlock;
use assocstore::cache::{CacheConfig, CachedBlockStore};
use assocstore::merge::MergeOp;
use assocstore::Error;
use tempfile::TempDir;

fn config(initial_index_capacity: u32) -> CacheConfig {
    CacheConfig {
        initial_index_capacity,
        ..Default::default()
    }
}

#[test]
fn flushed_blocks_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("assoc.db");

    let mut written = Vec::new();
    {
        let store = CachedBlockStore::open(&path, config(8)).unwrap();
        for from in [0u32, 3, 7, 12] {
            let mut block = store.new_block(from);
            for to in (0..from * 3 + 1).rev() {
                block.merge_value(to * 2, to as f32 * 0.5 + from as f32, MergeOp::Sum);
            }
            store.merge(&block, MergeOp::Sum).unwrap();
            written.push(block);
        }
        store.flush().unwrap();
        store.close().unwrap();
    }

    let store = CachedBlockStore::open(&path, config(8)).unwrap();
    assert_eq!(store.keys().unwrap(), vec![0, 3, 7, 12]);
    for block in &written {
        let loaded = store.get(block.from_key()).unwrap().unwrap();
        assert_eq!(loaded.from_key(), block.from_key());
        assert_eq!(loaded.tos(), block.tos());
        assert_eq!(loaded.values(), block.values());
    }
    let expected: u64 = written.iter().map(|b| b.len() as u64).sum();
    assert_eq!(store.total_associations().unwrap(), expected);
}

#[test]
fn close_flushes_pending_merges() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("assoc.db");

    {
        let store = CachedBlockStore::open(&path, config(4)).unwrap();
        store
            .merge_associations(2, [(5, 1.0), (1, 2.0)], MergeOp::Sum)
            .unwrap();
        store.close().unwrap();
    }

    let store = CachedBlockStore::open(&path, config(4)).unwrap();
    let block = store.get(2).unwrap().unwrap();
    assert_eq!(block.tos(), &[1, 5]);
    assert_eq!(block.values(), &[2.0, 1.0]);
}

#[test]
fn reads_do_not_see_unflushed_merges() {
    let temp_dir = TempDir::new().unwrap();
    let store = CachedBlockStore::open(temp_dir.path().join("assoc.db"), config(4)).unwrap();

    store.merge_associations(1, [(2, 1.0)], MergeOp::Sum).unwrap();
    store.flush().unwrap();

    store.merge_associations(1, [(2, 4.0), (3, 1.0)], MergeOp::Sum).unwrap();
    let durable = store.get(1).unwrap().unwrap();
    assert_eq!(durable.tos(), &[2]);
    assert_eq!(durable.values(), &[1.0]);

    store.flush().unwrap();
    let durable = store.get(1).unwrap().unwrap();
    assert_eq!(durable.tos(), &[2, 3]);
    assert_eq!(durable.values(), &[5.0, 1.0]);
    assert_eq!(store.total_associations().unwrap(), 2);
}

#[test]
fn index_grows_to_smallest_power_of_two_in_one_pass() {
    let temp_dir = TempDir::new().unwrap();
    let store = CachedBlockStore::open(temp_dir.path().join("assoc.db"), config(4)).unwrap();

    for from in 0..4u32 {
        store
            .merge_associations(from, [(from + 100, from as f32)], MergeOp::Sum)
            .unwrap();
    }
    store.flush().unwrap();
    let before = store.stats().unwrap();
    assert_eq!(before.capacity, 4);
    assert_eq!(before.reindexes, 0);

    store.merge_associations(40, [(1, 1.0)], MergeOp::Sum).unwrap();
    store.flush().unwrap();

    let after = store.stats().unwrap();
    assert_eq!(after.capacity, 64);
    assert_eq!(after.reindexes, 1);
    assert_eq!(after.max_key, Some(40));
    for from in 0..4u32 {
        let block = store.get(from).unwrap().unwrap();
        assert_eq!(block.tos(), &[from + 100]);
        assert_eq!(block.values(), &[from as f32]);
    }
}

#[test]
fn compaction_keeps_live_blocks() {
    let temp_dir = TempDir::new().unwrap();
    let store = CachedBlockStore::open(temp_dir.path().join("assoc.db"), config(4)).unwrap();

    // every flush grows the block past its slot, leaving the old bytes behind
    for round in 0..6u32 {
        let pairs: Vec<_> = (0..(1 << round)).map(|to| (to, 1.0)).collect();
        store.merge_associations(1, pairs, MergeOp::Overwrite).unwrap();
        store.flush().unwrap();
    }
    let before = store.stats().unwrap();

    store.compact().unwrap();
    let after = store.stats().unwrap();
    assert!(after.file_len < before.file_len);
    assert_eq!(after.live_records, 1);
    assert_eq!(store.get(1).unwrap().unwrap().len(), 32);
}

#[test]
fn mismatched_sources_are_rejected() {
    let mut a = AssociationBlock::new(1);
    let mut b = AssociationBlock::new(2);
    b.merge_value(3, 1.0, MergeOp::Sum);

    let err = a.merge(&b, MergeOp::Sum).unwrap_err();
    assert!(matches!(
        err,
        Error::KeyMismatch {
            expected: 1,
            actual: 2
        }
    ));
}

#[test]
fn foreign_file_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("assoc.db");
    std::fs::write(&path, b"definitely not an association store").unwrap();

    let err = CachedBlockStore::open(&path, config(4)).err().unwrap();
    assert!(matches!(err, Error::Format(_)), "got {err:?}");
}
