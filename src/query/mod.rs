//! Query model
//!
//! A [`Query`] selects targets with a boolean expression over phrases,
//! optionally narrows them with a conjunction of field comparisons, and
//! keeps the `limit` highest weighted hits.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::merge::MergeOp;
use crate::types::{FieldValue, Hit};

pub mod file;
pub mod filter;
pub mod solver;
pub mod topk;

pub use file::FileAssociationSolver;
pub use solver::QuerySolver;

/// Result cap applied when a query does not set one.
pub const DEFAULT_LIMIT: usize = 1000;

/// Query request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expr>,
    /// Maximum number of hits, 0 for unlimited.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Operator combining weights where selectors overlap.
    #[serde(default)]
    pub merge_op: MergeOp,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Query {
    pub fn new(select: Expr) -> Self {
        Self {
            select: Some(select),
            filter: None,
            limit: DEFAULT_LIMIT,
            merge_op: MergeOp::default(),
        }
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_merge_op(mut self, op: MergeOp) -> Self {
        self.merge_op = op;
        self
    }
}

/// Expression tree shared by the select and filter parts of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Expr {
    Phrase {
        text: String,
    },
    Not {
        expr: Box<Expr>,
    },
    And {
        exprs: Vec<Expr>,
    },
    Or {
        exprs: Vec<Expr>,
    },
    Compare(FieldComparison),
    /// Expression kinds only a specific solver understands.
    Extension {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Expr {
    pub fn phrase(text: impl Into<String>) -> Self {
        Expr::Phrase { text: text.into() }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not {
            expr: Box::new(expr),
        }
    }

    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Self {
        Expr::And {
            exprs: exprs.into_iter().collect(),
        }
    }

    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Or {
            exprs: exprs.into_iter().collect(),
        }
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, value: Option<FieldValue>) -> Self {
        Expr::Compare(FieldComparison {
            field: field.into(),
            op,
            value,
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, name: &str, exprs: &[Expr]) -> fmt::Result {
            write!(f, "{}(", name)?;
            for (i, expr) in exprs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", expr)?;
            }
            f.write_str(")")
        }

        match self {
            Expr::Phrase { text } => write!(f, "{:?}", text),
            Expr::Not { expr } => write!(f, "NOT({})", expr),
            Expr::And { exprs } => list(f, "AND", exprs),
            Expr::Or { exprs } => list(f, "OR", exprs),
            Expr::Compare(cmp) => write!(f, "{}", cmp),
            Expr::Extension { name, args } => write!(f, "{}({})", name, args.join(", ")),
        }
    }
}

/// `field <op> value`; a missing value compares as null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub field: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: Option<FieldValue>,
}

impl fmt::Display for FieldComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{} {} {}", self.field, self.op, value),
            None => write!(f, "{} {} null", self.field, self.op),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Regular expression matched against the whole field value.
    Matches,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Matches => "MATCHES",
        })
    }
}

/// Intermediate value of a select expression.
///
/// When `negated` is set the true answer is the complement of `hits` over
/// the universe of all targets. `hits` is always sorted by target.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    pub hits: Vec<Hit>,
    pub negated: bool,
}

impl ResultSet {
    pub fn positive(hits: Vec<Hit>) -> Self {
        Self {
            hits,
            negated: false,
        }
    }

    pub fn negative(hits: Vec<Hit>) -> Self {
        Self {
            hits,
            negated: true,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_subexpressions() {
        let expr = Expr::and([
            Expr::phrase("a"),
            Expr::or([Expr::not(Expr::phrase("b")), Expr::phrase("c")]),
        ]);
        assert_eq!(expr.to_string(), r#"AND("a", OR(NOT("b"), "c"))"#);

        let cmp = Expr::compare("lang", CompareOp::Eq, None);
        assert_eq!(cmp.to_string(), "lang = null");
    }

    #[test]
    fn test_query_from_json() {
        let query: Query = serde_json::from_str(
            r#"{
                "select": {"type": "and", "exprs": [
                    {"type": "phrase", "text": "a"},
                    {"type": "not", "expr": {"type": "phrase", "text": "b"}}
                ]},
                "filter": {"type": "compare", "field": "size", "op": "ge", "value": 3},
                "merge_op": "avg"
            }"#,
        )
        .unwrap();

        assert_eq!(query.limit, DEFAULT_LIMIT);
        assert_eq!(query.merge_op, MergeOp::Avg);
        assert_eq!(
            query.select,
            Some(Expr::and([Expr::phrase("a"), Expr::not(Expr::phrase("b"))]))
        );
        assert_eq!(
            query.filter,
            Some(Expr::compare("size", CompareOp::Ge, Some(FieldValue::Integer(3))))
        );
    }
}
