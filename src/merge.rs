//! Merge operators applied when two weights target the same key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::Weight;

/// Binary `(old, new) -> combined` weight combinator.
///
/// Operators are applied as a left fold. None of them is guaranteed to be
/// associative, and `Overwrite` is not commutative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeOp {
    /// Keep the new value.
    Overwrite,
    /// Add both values.
    #[default]
    Sum,
    /// Pairwise mean of old and new.
    Avg,
    /// Log-sum-exp soft union, `ln(e^old + e^new)`.
    LogSum,
}

impl MergeOp {
    pub fn apply(self, old: Weight, new: Weight) -> Weight {
        match self {
            MergeOp::Overwrite => new,
            MergeOp::Sum => old + new,
            MergeOp::Avg => (old + new) / 2.0,
            MergeOp::LogSum => {
                // factor out the max so large weights do not overflow exp()
                let hi = old.max(new);
                let lo = old.min(new);
                hi + (lo - hi).exp().ln_1p()
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeOp::Overwrite => "overwrite",
            MergeOp::Sum => "sum",
            MergeOp::Avg => "avg",
            MergeOp::LogSum => "logsum",
        }
    }
}

impl fmt::Display for MergeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(MergeOp::Overwrite),
            "sum" => Ok(MergeOp::Sum),
            "avg" => Ok(MergeOp::Avg),
            "logsum" => Ok(MergeOp::LogSum),
            other => anyhow::bail!("unsupported merge operator: {}", other),
        }
    }
}
