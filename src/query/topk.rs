//! Top-K selection by weight.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::types::Hit;

/// Orders hits by value, ties broken by target.
struct ByValue(Hit);

impl PartialEq for ByValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ByValue {}

impl PartialOrd for ByValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .value
            .total_cmp(&other.0.value)
            .then_with(|| other.0.target.cmp(&self.0.target))
    }
}

/// Keep the `k` highest weighted hits using a fixed-size min-heap.
///
/// The returned hits are in no particular order. `k == 0` keeps everything.
pub fn top_k(hits: Vec<Hit>, k: usize) -> Vec<Hit> {
    if k == 0 || hits.len() <= k {
        return hits;
    }

    let mut heap: BinaryHeap<Reverse<ByValue>> = BinaryHeap::with_capacity(k);
    for hit in hits {
        if heap.len() < k {
            heap.push(Reverse(ByValue(hit)));
        } else if let Some(mut lowest) = heap.peek_mut() {
            if ByValue(hit) > lowest.0 {
                *lowest = Reverse(ByValue(hit));
            }
        }
    }
    heap.into_vec().into_iter().map(|Reverse(ByValue(hit))| hit).collect()
}
