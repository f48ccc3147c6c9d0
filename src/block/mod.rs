//! Association blocks
//!
//! An [`AssociationBlock`] is one sparse row: a source key plus parallel
//! arrays of ascending target keys and their weights.

use crate::merge::MergeOp;
use crate::types::{Hit, Key, Weight};
use crate::{Error, Result};

mod codec;

pub use codec::{BlockCodec, TOTAL_ASSOCIATIONS_SLOT};

/// Capacity used by [`AssociationBlock::new`].
pub const DEFAULT_BLOCK_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct AssociationBlock {
    from: Key,
    tos: Vec<Key>,
    values: Vec<Weight>,
    capacity: usize,
    /// Capacity at the last load or serialization.
    original_capacity: usize,
    changed: bool,
}

impl AssociationBlock {
    pub fn new(from: Key) -> Self {
        Self::with_capacity(from, DEFAULT_BLOCK_CAPACITY)
    }

    pub fn with_capacity(from: Key, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            from,
            tos: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            capacity,
            original_capacity: capacity,
            changed: false,
        }
    }

    /// Rebuild a block from decoded arrays. `tos` must be strictly ascending.
    pub(crate) fn from_parts(
        from: Key,
        capacity: usize,
        tos: Vec<Key>,
        values: Vec<Weight>,
    ) -> Result<Self> {
        if tos.len() != values.len() || tos.len() > capacity {
            return Err(Error::format(format!(
                "block {}: {} targets and {} values do not fit capacity {}",
                from,
                tos.len(),
                values.len(),
                capacity
            )));
        }
        if tos.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::format(format!(
                "block {}: targets are not strictly ascending",
                from
            )));
        }
        Ok(Self {
            from,
            tos,
            values,
            capacity,
            original_capacity: capacity,
            changed: false,
        })
    }

    pub fn from_key(&self) -> Key {
        self.from
    }

    pub fn len(&self) -> usize {
        self.tos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tos.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tos(&self) -> &[Key] {
        &self.tos
    }

    pub fn values(&self) -> &[Weight] {
        &self.values
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Whether capacity grew since the block was loaded or last serialized.
    pub fn is_grown(&self) -> bool {
        self.capacity > self.original_capacity
    }

    /// Record that the current state has been persisted.
    pub fn mark_persisted(&mut self) {
        self.original_capacity = self.capacity;
        self.changed = false;
    }

    pub fn get(&self, to: Key) -> Option<Weight> {
        self.tos.binary_search(&to).ok().map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, Weight)> + '_ {
        self.tos.iter().copied().zip(self.values.iter().copied())
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.iter().map(|(to, value)| Hit::new(to, value)).collect()
    }

    /// Merge a single association. Returns whether the block changed.
    pub fn merge_value(&mut self, to: Key, value: Weight, op: MergeOp) -> bool {
        match self.tos.binary_search(&to) {
            Ok(i) => {
                let merged = op.apply(self.values[i], value);
                if merged == self.values[i] {
                    return false;
                }
                self.values[i] = merged;
            }
            Err(i) => {
                self.grow(self.tos.len() + 1);
                self.tos.insert(i, to);
                self.values.insert(i, value);
            }
        }
        self.changed = true;
        true
    }

    /// Merge every association of `other` into this block, treating this
    /// block's weights as the old side of `op`.
    pub fn merge(&mut self, other: &AssociationBlock, op: MergeOp) -> Result<()> {
        if other.from != self.from {
            return Err(Error::KeyMismatch {
                expected: self.from,
                actual: other.from,
            });
        }
        if other.is_empty() {
            return Ok(());
        }

        let mut tos = Vec::with_capacity(self.tos.len() + other.tos.len());
        let mut values = Vec::with_capacity(tos.capacity());
        let mut changed = false;
        let (mut i, mut j) = (0, 0);

        while i < self.tos.len() && j < other.tos.len() {
            let (a, b) = (self.tos[i], other.tos[j]);
            if a < b {
                tos.push(a);
                values.push(self.values[i]);
                i += 1;
            } else if b < a {
                tos.push(b);
                values.push(other.values[j]);
                changed = true;
                j += 1;
            } else {
                let merged = op.apply(self.values[i], other.values[j]);
                changed |= merged != self.values[i];
                tos.push(a);
                values.push(merged);
                i += 1;
                j += 1;
            }
        }
        tos.extend_from_slice(&self.tos[i..]);
        values.extend_from_slice(&self.values[i..]);
        if j < other.tos.len() {
            changed = true;
            tos.extend_from_slice(&other.tos[j..]);
            values.extend_from_slice(&other.values[j..]);
        }

        self.grow(tos.len());
        self.tos = tos;
        self.values = values;
        self.changed |= changed;
        Ok(())
    }

    /// Double capacity until `size` entries fit.
    pub fn grow(&mut self, size: usize) {
        while self.capacity < size {
            self.capacity *= 2;
        }
    }
}

impl PartialEq for AssociationBlock {
    /// Blocks are equal when they hold the same associations.
    fn eq(&self, other: &Self) -> bool {
        self.from == other.from && self.tos == other.tos && self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn block(from: Key, pairs: &[(Key, Weight)]) -> AssociationBlock {
        let mut block = AssociationBlock::new(from);
        for &(to, value) in pairs {
            block.merge_value(to, value, MergeOp::Overwrite);
        }
        block
    }

    #[test]
    fn test_merge_value_inserts_sorted() {
        let b = block(1, &[(5, 0.5), (1, 0.1), (3, 0.3)]);
        assert_eq!(b.tos(), &[1, 3, 5]);
        assert_eq!(b.values(), &[0.1, 0.3, 0.5]);
        assert!(b.is_changed());
    }

    #[test]
    fn test_merge_value_combines_existing() {
        let mut b = block(1, &[(2, 1.0)]);
        assert!(b.merge_value(2, 0.5, MergeOp::Sum));
        assert_eq!(b.get(2), Some(1.5));

        assert!(b.merge_value(2, 0.5, MergeOp::Avg));
        assert_eq!(b.get(2), Some(1.0));
    }

    #[test]
    fn test_unchanged_value_keeps_clean() {
        let mut b = block(1, &[(2, 1.0)]);
        b.mark_persisted();
        assert!(!b.merge_value(2, 1.0, MergeOp::Overwrite));
        assert!(!b.is_changed());
        assert!(b.merge_value(2, 2.0, MergeOp::Overwrite));
        assert!(b.is_changed());
    }

    #[test]
    fn test_growth_doubles_capacity() {
        let mut b = AssociationBlock::with_capacity(1, 2);
        b.merge_value(10, 1.0, MergeOp::Sum);
        b.merge_value(20, 1.0, MergeOp::Sum);
        assert_eq!(b.capacity(), 2);
        assert!(!b.is_grown());

        b.merge_value(5, 1.0, MergeOp::Sum);
        assert_eq!(b.capacity(), 4);
        assert!(b.is_grown());
        assert_eq!(b.tos(), &[5, 10, 20]);

        b.mark_persisted();
        assert!(!b.is_grown());
    }

    #[test]
    fn test_block_merge_rejects_other_source() {
        let mut a = block(1, &[(2, 1.0)]);
        let b = block(2, &[(2, 1.0)]);
        let err = a.merge(&b, MergeOp::Sum).unwrap_err();
        assert!(matches!(err, Error::KeyMismatch { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_block_merge_keeps_operand_order() {
        let mut a = block(1, &[(1, 1.0), (3, 3.0)]);
        let b = block(1, &[(2, 2.0), (3, 9.0)]);
        a.merge(&b, MergeOp::Overwrite).unwrap();
        assert_eq!(a.tos(), &[1, 2, 3]);
        assert_eq!(a.values(), &[1.0, 2.0, 9.0]);
        assert_eq!(a.capacity(), 4);
    }

    #[test]
    fn test_block_merge_disjoint_is_union() {
        let mut a = block(1, &[(1, 1.0), (4, 4.0)]);
        let b = block(1, &[(2, 2.0), (8, 8.0)]);
        a.merge(&b, MergeOp::Sum).unwrap();
        assert_eq!(a.tos(), &[1, 2, 4, 8]);
        assert_eq!(a.values(), &[1.0, 2.0, 4.0, 8.0]);
    }

    proptest! {
        #[test]
        fn prop_tos_stay_strictly_ascending(pairs in prop::collection::vec((0u32..500, 0.0f32..10.0), 0..200)) {
            let mut b = AssociationBlock::with_capacity(7, 1);
            for &(to, value) in &pairs {
                b.merge_value(to, value, MergeOp::Overwrite);
            }
            prop_assert!(b.tos().windows(2).all(|w| w[0] < w[1]));
            prop_assert!(b.len() <= b.capacity());
            prop_assert!(b.capacity().is_power_of_two());

            // last write wins under overwrite
            for &(to, _) in &pairs {
                let last = pairs.iter().rev().find(|(t, _)| *t == to).map(|(_, v)| *v);
                prop_assert_eq!(b.get(to), last);
            }
        }

        #[test]
        fn prop_block_merge_matches_scalar_merges(
            left in prop::collection::vec((0u32..100, 0.0f32..10.0), 0..50),
            right in prop::collection::vec((0u32..100, 0.0f32..10.0), 0..50),
        ) {
            let a = block(3, &left);
            let b = block(3, &right);

            let mut zipped = a.clone();
            zipped.merge(&b, MergeOp::Sum).unwrap();

            let mut scalar = a.clone();
            for (to, value) in b.iter() {
                scalar.merge_value(to, value, MergeOp::Sum);
            }
            prop_assert_eq!(zipped, scalar);
        }
    }
}
