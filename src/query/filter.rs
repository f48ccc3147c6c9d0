//! Filter evaluation
//!
//! Filters must reduce to a conjunction of field comparisons. Null handling:
//! - `EQ` holds only when both sides are null, `NE` is its complement
//! - ordering comparisons never hold for a null field value
//! - `MATCHES` holds for a null value against a null pattern, and for no
//!   other combination involving null

use regex::Regex;
use std::cmp::Ordering;

use super::{CompareOp, Expr, FieldComparison};
use crate::types::{FieldValue, Hit, Key};
use crate::{Error, Result};

/// A comparison ready to run against many targets.
pub struct Condition<'a> {
    comparison: &'a FieldComparison,
    pattern: Option<Regex>,
}

impl<'a> Condition<'a> {
    pub fn new(comparison: &'a FieldComparison) -> Result<Self> {
        let pattern = match (comparison.op, &comparison.value) {
            (CompareOp::Matches, Some(FieldValue::String(pattern))) => {
                let anchored = format!("^(?:{})$", pattern);
                Some(Regex::new(&anchored).map_err(|e| {
                    Error::evaluation(format!("invalid pattern in {}: {}", comparison, e))
                })?)
            }
            (CompareOp::Matches, Some(_)) => {
                return Err(Error::evaluation(format!(
                    "{}: MATCHES needs a string pattern",
                    comparison
                )))
            }
            _ => None,
        };
        Ok(Self {
            comparison,
            pattern,
        })
    }

    pub fn field(&self) -> &str {
        &self.comparison.field
    }

    /// Evaluate against the field value of one target.
    pub fn holds(&self, actual: Option<&FieldValue>) -> Result<bool> {
        let expected = self.comparison.value.as_ref();
        match self.comparison.op {
            CompareOp::Eq => Ok(equals(actual, expected)),
            CompareOp::Ne => Ok(!equals(actual, expected)),
            CompareOp::Lt => self.ordered(actual, expected, Ordering::is_lt),
            CompareOp::Le => self.ordered(actual, expected, Ordering::is_le),
            CompareOp::Gt => self.ordered(actual, expected, Ordering::is_gt),
            CompareOp::Ge => self.ordered(actual, expected, Ordering::is_ge),
            CompareOp::Matches => Ok(match (actual, &self.pattern) {
                (None, None) => true,
                (Some(value), Some(pattern)) => pattern.is_match(&render(value)),
                _ => false,
            }),
        }
    }

    fn ordered(
        &self,
        actual: Option<&FieldValue>,
        expected: Option<&FieldValue>,
        accept: fn(Ordering) -> bool,
    ) -> Result<bool> {
        let (Some(a), Some(b)) = (actual, expected) else {
            return Ok(false);
        };
        match compare(a, b) {
            Some(ordering) => Ok(accept(ordering)),
            None => Err(Error::evaluation(format!(
                "{}: cannot order {} against {}",
                self.comparison, a, b
            ))),
        }
    }
}

/// Flatten `filter` into its comparisons, failing for anything that is not
/// a conjunction of field comparisons.
pub fn conjuncts(filter: &Expr) -> Result<Vec<&FieldComparison>> {
    let mut out = Vec::new();
    collect(filter, filter, &mut out)?;
    Ok(out)
}

fn collect<'a>(root: &Expr, expr: &'a Expr, out: &mut Vec<&'a FieldComparison>) -> Result<()> {
    match expr {
        Expr::Compare(cmp) => {
            out.push(cmp);
            Ok(())
        }
        Expr::And { exprs } => exprs.iter().try_for_each(|e| collect(root, e, out)),
        other => Err(Error::evaluation(format!(
            "filter {} is not a conjunction of field comparisons (offending part: {})",
            root, other
        ))),
    }
}

/// Keep the hits whose fields satisfy every condition. `field_value` fetches
/// a target's field from the value store.
pub fn retain<F>(hits: Vec<Hit>, conditions: &[Condition<'_>], mut field_value: F) -> Result<Vec<Hit>>
where
    F: FnMut(Key, &str) -> Result<Option<FieldValue>>,
{
    let mut kept = Vec::with_capacity(hits.len());
    'hits: for hit in hits {
        for condition in conditions {
            let actual = field_value(hit.target, condition.field())?;
            if !condition.holds(actual.as_ref())? {
                continue 'hits;
            }
        }
        kept.push(hit);
    }
    Ok(kept)
}

fn equals(a: Option<&FieldValue>, b: Option<&FieldValue>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => compare(a, b) == Some(Ordering::Equal),
        _ => false,
    }
}

fn compare(a: &FieldValue, b: &FieldValue) -> Option<Ordering> {
    match (a, b) {
        (FieldValue::String(a), FieldValue::String(b)) => Some(a.cmp(b)),
        (FieldValue::Integer(a), FieldValue::Integer(b)) => Some(a.cmp(b)),
        (FieldValue::Float(a), FieldValue::Float(b)) => a.partial_cmp(b),
        (FieldValue::Integer(a), FieldValue::Float(b)) => (*a as f64).partial_cmp(b),
        (FieldValue::Float(a), FieldValue::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (FieldValue::Boolean(a), FieldValue::Boolean(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn render(value: &FieldValue) -> String {
    match value {
        FieldValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
