use std::sync::Arc;

use crate::comparator::{Comparator, Operator, comparator_for};
use crate::field::{FieldKind, FieldValue, ReservedField, field_kind};
use crate::message::Message;

/// Topic value that widens a historical query to every topic.
pub const ALL_TOPICS: &str = "all";

/// One field predicate.
#[derive(Debug, Clone)]
pub struct Filter {
    field_name: String,
    field_value: FieldValue,
    comparator: Arc<dyn Comparator>,
}

impl Filter {
    /// Build a predicate from a raw operand. The operand cast and the
    /// comparator variant both come from [`field_kind`].
    pub fn new(field_name: impl Into<String>, raw_value: &str, op: Operator) -> Self {
        let field_name = field_name.into();
        let kind = field_kind(&field_name);
        Self {
            field_value: FieldValue::cast(kind, raw_value),
            comparator: comparator_for(kind, op),
            field_name,
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn field_value(&self) -> &FieldValue {
        &self.field_value
    }

    /// Operator tag, used by backends that translate predicates into
    /// native query operators.
    pub fn operator(&self) -> Operator {
        self.comparator.operator()
    }

    pub fn compare(&self, left: &FieldValue) -> bool {
        self.comparator.compare(left, &self.field_value)
    }

    /// The predicate as a native column comparison, when it is one: a
    /// numeric reserved field with a relational operator.
    pub fn native_predicate(&self) -> Option<NativePredicate> {
        let field = ReservedField::parse(&self.field_name)?;
        if field.kind() != FieldKind::Numeric || !self.operator().is_relational() {
            return None;
        }
        Some(NativePredicate {
            field,
            op: self.operator(),
            value: self.field_value.as_int(),
        })
    }
}

/// A filter predicate a backend can push down into its own query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativePredicate {
    pub field: ReservedField,
    pub op: Operator,
    pub value: i64,
}

impl NativePredicate {
    /// Evaluate the predicate in process, for backends without a query
    /// language of their own.
    pub fn holds_for(&self, message: &Message) -> bool {
        comparator_for(FieldKind::Numeric, self.op)
            .compare(&self.field.extract(message), &FieldValue::Int(self.value))
    }
}

/// Query/predicate bundle sent by one subscriber.
#[derive(Debug, Clone)]
pub struct Filters {
    /// Empty means every topic.
    pub topic: String,
    pub filters: Vec<Filter>,
    /// Historical result bound.
    pub size: usize,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            topic: String::new(),
            filters: Vec::new(),
            size: Self::DEFAULT_SIZE,
        }
    }
}

impl Filters {
    pub const DEFAULT_SIZE: usize = 20;

    /// No topic and no field predicates.
    pub fn is_empty(&self) -> bool {
        self.topic.is_empty() && self.filters.is_empty()
    }

    /// Historical result bound, falling back to the default for zero.
    pub fn limit(&self) -> usize {
        if self.size == 0 {
            Self::DEFAULT_SIZE
        } else {
            self.size
        }
    }

    /// Topic a historical query is restricted to; `None` for every topic.
    pub fn topic_scope(&self) -> Option<&str> {
        let topic = self.topic.as_str();
        if topic.is_empty() || topic.eq_ignore_ascii_case(ALL_TOPICS) {
            None
        } else {
            Some(topic)
        }
    }

    /// Predicates the backend may evaluate natively.
    pub fn native_predicates(&self) -> impl Iterator<Item = NativePredicate> + '_ {
        self.filters.iter().filter_map(Filter::native_predicate)
    }
}
