//! Query solver over the cached block store.
//!
//! Set primitives are linear merges over hit lists sorted by target.

use std::sync::Arc;

use super::solver::QuerySolver;
use super::topk::top_k;
use super::{Query, ResultSet};
use crate::cache::CachedBlockStore;
use crate::lookup::KeyLookup;
use crate::merge::MergeOp;
use crate::types::{FieldValue, Hit, Key};
use crate::Result;

pub struct FileAssociationSolver {
    store: Arc<CachedBlockStore>,
    lookup: Arc<dyn KeyLookup>,
}

impl FileAssociationSolver {
    pub fn new(store: Arc<CachedBlockStore>, lookup: Arc<dyn KeyLookup>) -> Self {
        Self { store, lookup }
    }

    pub fn store(&self) -> &Arc<CachedBlockStore> {
        &self.store
    }

    /// Evaluate `query` against durable state. Unflushed merges are not seen.
    pub fn query(&self, query: &Query) -> Result<Vec<Hit>> {
        let started = std::time::Instant::now();
        let hits = self.solve(query)?;
        tracing::debug!(
            hits = hits.len(),
            took_us = started.elapsed().as_micros() as u64,
            "Solved query",
        );
        Ok(hits)
    }
}

impl QuerySolver for FileAssociationSolver {
    fn lookup(&self, phrase: &str) -> Result<ResultSet> {
        let Some(from) = self.lookup.resolve(phrase)? else {
            return Ok(ResultSet::empty());
        };
        Ok(match self.store.get(from)? {
            Some(block) => ResultSet::positive(block.hits()),
            None => ResultSet::empty(),
        })
    }

    fn union(&self, a: Vec<Hit>, b: Vec<Hit>, op: MergeOp) -> Vec<Hit> {
        union(&a, &b, op)
    }

    fn intersection(&self, a: Vec<Hit>, b: Vec<Hit>, op: MergeOp) -> Vec<Hit> {
        intersection(&a, &b, op)
    }

    fn minus(&self, a: Vec<Hit>, b: Vec<Hit>) -> Vec<Hit> {
        minus(a, &b)
    }

    fn limit(&self, hits: Vec<Hit>, k: usize) -> Vec<Hit> {
        top_k(hits, k)
    }

    fn field_value(&self, target: Key, field: &str) -> Result<Option<FieldValue>> {
        self.lookup.get_field(target, field)
    }
}

pub fn union(a: &[Hit], b: &[Hit], op: MergeOp) -> Vec<Hit> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (x, y) = (a[i], b[j]);
        if x.target < y.target {
            out.push(x);
            i += 1;
        } else if y.target < x.target {
            out.push(y);
            j += 1;
        } else {
            out.push(Hit::new(x.target, op.apply(x.value, y.value)));
            i += 1;
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

pub fn intersection(a: &[Hit], b: &[Hit], op: MergeOp) -> Vec<Hit> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (x, y) = (a[i], b[j]);
        if x.target < y.target {
            i += 1;
        } else if y.target < x.target {
            j += 1;
        } else {
            out.push(Hit::new(x.target, op.apply(x.value, y.value)));
            i += 1;
            j += 1;
        }
    }
    out
}

pub fn minus(mut a: Vec<Hit>, b: &[Hit]) -> Vec<Hit> {
    let mut j = 0;
    a.retain(|hit| {
        while j < b.len() && b[j].target < hit.target {
            j += 1;
        }
        j == b.len() || b[j].target != hit.target
    });
    a
}
