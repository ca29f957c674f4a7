use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::field::{FieldKind, FieldValue};

/// Relational operator carried by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Case-insensitive equality. Text only.
    IEq,
    /// Substring match. Text only.
    Contains,
}

impl Operator {
    /// Wire name used by the web client.
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Ge => "ge",
            Operator::Lt => "lt",
            Operator::Le => "le",
            Operator::IEq => "ieq",
            Operator::Contains => "contains",
        }
    }

    /// True for operators that have a direct native equivalent on an
    /// ordered column.
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            Operator::Eq | Operator::Ne | Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le
        )
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Operator::Eq | Operator::IEq => ordering == Ordering::Equal,
            Operator::Ne => ordering != Ordering::Equal,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Ge => ordering != Ordering::Less,
            Operator::Lt => ordering == Ordering::Less,
            Operator::Le => ordering != Ordering::Greater,
            Operator::Contains => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operator '{0}'")]
pub struct UnknownOperator(pub String);

impl FromStr for Operator {
    type Err = UnknownOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eq" | "=" | "==" => Ok(Operator::Eq),
            "ne" | "!=" | "<>" => Ok(Operator::Ne),
            "gt" | ">" => Ok(Operator::Gt),
            "ge" | ">=" => Ok(Operator::Ge),
            "lt" | "<" => Ok(Operator::Lt),
            "le" | "<=" => Ok(Operator::Le),
            "ieq" => Ok(Operator::IEq),
            "contains" | "like" => Ok(Operator::Contains),
            _ => Err(UnknownOperator(s.to_string())),
        }
    }
}

/// Evaluates one typed predicate between a message field value (left) and a
/// filter operand (right).
pub trait Comparator: Send + Sync + fmt::Debug {
    fn compare(&self, left: &FieldValue, right: &FieldValue) -> bool;

    fn operator(&self) -> Operator;
}

/// Text comparison. Ordering operators compare lexicographically.
#[derive(Debug, Clone, Copy)]
pub struct StringComparator {
    op: Operator,
}

impl StringComparator {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }
}

impl Comparator for StringComparator {
    fn compare(&self, left: &FieldValue, right: &FieldValue) -> bool {
        let left = left.as_text();
        let right = right.as_text();
        match self.op {
            Operator::IEq => left.to_lowercase() == right.to_lowercase(),
            Operator::Contains => left.contains(right.as_ref()),
            op => op.holds(left.as_ref().cmp(right.as_ref())),
        }
    }

    fn operator(&self) -> Operator {
        self.op
    }
}

/// 64-bit integer comparison. A text operand that does not parse counts as 0.
#[derive(Debug, Clone, Copy)]
pub struct NumericComparator {
    op: Operator,
}

impl NumericComparator {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }
}

impl Comparator for NumericComparator {
    fn compare(&self, left: &FieldValue, right: &FieldValue) -> bool {
        // No substring semantics for numbers.
        if self.op == Operator::Contains {
            return false;
        }
        self.op.holds(left.as_int().cmp(&right.as_int()))
    }

    fn operator(&self) -> Operator {
        self.op
    }
}

/// Pick the comparator variant for a field kind.
pub fn comparator_for(kind: FieldKind, op: Operator) -> Arc<dyn Comparator> {
    match kind {
        FieldKind::Numeric => Arc::new(NumericComparator::new(op)),
        FieldKind::Text => Arc::new(StringComparator::new(op)),
    }
}
