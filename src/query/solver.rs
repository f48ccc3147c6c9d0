//! Generic boolean query solver
//!
//! [`QuerySolver`] evaluates the select expression as set algebra over
//! [`ResultSet`]s, then applies the filter and the limit. Implementors supply
//! leaf lookups and the set primitives.
//!
//! | expression | operands | result |
//! |---|---|---|
//! | `AND` | pos, pos | intersection |
//! | `AND` | pos, neg | pos minus neg |
//! | `AND` | neg, neg | union, still negated |
//! | `OR`  | pos, pos | union |
//! | `OR`  | any neg  | evaluation error |
//!
//! A negated final result is an evaluation error as well: answering it would
//! mean materializing every target in the store.

use super::filter::{self, Condition};
use super::{Expr, Query, ResultSet};
use crate::merge::MergeOp;
use crate::types::{FieldValue, Hit, Key};
use crate::{Error, Result};

pub trait QuerySolver {
    /// Targets associated with a single phrase. Never negated.
    fn lookup(&self, phrase: &str) -> Result<ResultSet>;

    /// Every target of `a` and `b`, combining weights with `op` where both
    /// contain the target.
    fn union(&self, a: Vec<Hit>, b: Vec<Hit>, op: MergeOp) -> Vec<Hit>;

    /// Targets in both `a` and `b`, weights combined as `op(a, b)`.
    fn intersection(&self, a: Vec<Hit>, b: Vec<Hit>, op: MergeOp) -> Vec<Hit>;

    /// Targets of `a` missing from `b`, with `a`'s weights.
    fn minus(&self, a: Vec<Hit>, b: Vec<Hit>) -> Vec<Hit>;

    /// The `k` highest weighted hits.
    fn limit(&self, hits: Vec<Hit>, k: usize) -> Vec<Hit>;

    /// Value of `field` for `target`, for filter evaluation.
    fn field_value(&self, target: Key, field: &str) -> Result<Option<FieldValue>>;

    /// Hook for [`Expr::Extension`] and other kinds this solver does not know.
    fn solve_extension(&self, expr: &Expr, _op: MergeOp) -> Result<ResultSet> {
        Err(Error::Unsupported(expr.to_string()))
    }

    /// Evaluate `query` into a list of hits. The hits are not sorted.
    fn solve(&self, query: &Query) -> Result<Vec<Hit>> {
        let select = query
            .select
            .as_ref()
            .ok_or_else(|| Error::InvalidQuery("query has no select expression".to_string()))?;

        let result = self.solve_select(select, query.merge_op)?;
        if result.negated {
            return Err(Error::evaluation(format!(
                "{} resolves to the complement of a set; every query must select a finite set",
                select
            )));
        }

        let mut hits = result.hits;
        if let Some(filter) = &query.filter {
            let conditions = filter::conjuncts(filter)?
                .into_iter()
                .map(Condition::new)
                .collect::<Result<Vec<_>>>()?;
            hits = filter::retain(hits, &conditions, |target, field| {
                self.field_value(target, field)
            })?;
        }

        if query.limit > 0 && hits.len() > query.limit {
            hits = self.limit(hits, query.limit);
        }
        Ok(hits)
    }

    fn solve_select(&self, expr: &Expr, op: MergeOp) -> Result<ResultSet> {
        match expr {
            Expr::Phrase { text } => {
                let result = self.lookup(text)?;
                debug_assert!(!result.negated);
                Ok(result)
            }
            Expr::Not { expr } => Ok(self.solve_select(expr, op)?.negate()),
            Expr::And { exprs } => {
                let (first, rest) = exprs.split_first().ok_or_else(|| {
                    Error::InvalidQuery(format!("{} has no operands", expr))
                })?;
                let mut acc = self.solve_select(first, op)?;
                for operand in rest {
                    let next = self.solve_select(operand, op)?;
                    acc = self.and(acc, next, op);
                }
                Ok(acc)
            }
            Expr::Or { exprs } => {
                let (first, rest) = exprs.split_first().ok_or_else(|| {
                    Error::InvalidQuery(format!("{} has no operands", expr))
                })?;
                let mut acc = self.solve_select(first, op)?;
                if acc.negated {
                    return Err(negated_or_operand(expr, first));
                }
                for operand in rest {
                    let next = self.solve_select(operand, op)?;
                    if next.negated {
                        return Err(negated_or_operand(expr, operand));
                    }
                    acc = ResultSet::positive(self.union(acc.hits, next.hits, op));
                }
                Ok(acc)
            }
            Expr::Compare(cmp) => Err(Error::InvalidQuery(format!(
                "field comparison {} cannot select targets; use it as a filter",
                cmp
            ))),
            Expr::Extension { .. } => self.solve_extension(expr, op),
        }
    }

    /// One step of the AND fold.
    fn and(&self, a: ResultSet, b: ResultSet, op: MergeOp) -> ResultSet {
        match (a.negated, b.negated) {
            (false, false) => ResultSet::positive(self.intersection(a.hits, b.hits, op)),
            (false, true) => ResultSet::positive(self.minus(a.hits, b.hits)),
            (true, false) => ResultSet::positive(self.minus(b.hits, a.hits)),
            // not A and not B == not (A or B)
            (true, true) => ResultSet::negative(self.union(a.hits, b.hits, op)),
        }
    }
}

fn negated_or_operand(or: &Expr, operand: &Expr) -> Error {
    Error::evaluation(format!(
        "operand {} of {} is negated; OR over a complement would need every target",
        operand, or
    ))
}
