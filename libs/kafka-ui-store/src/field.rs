//! The field table shared by filter construction and filter evaluation.
//!
//! Every reserved message field is listed exactly once in [`RESERVED_FIELDS`]
//! together with its value class. The operand of a [`Filter`](crate::Filter)
//! is cast with [`field_kind`] and the comparator is picked with the same
//! function, so the two can never disagree.

use std::borrow::Cow;

use chrono::SecondsFormat;

use crate::message::Message;

/// Value class of a filterable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Numeric,
    Text,
}

/// Fields every [`Message`] carries, addressable by filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedField {
    Offset,
    Partition,
    Timestamp,
    At,
    Size,
    Topic,
}

static RESERVED_FIELDS: [(&str, ReservedField, FieldKind); 6] = [
    ("offset", ReservedField::Offset, FieldKind::Numeric),
    ("partition", ReservedField::Partition, FieldKind::Numeric),
    ("timestamp", ReservedField::Timestamp, FieldKind::Numeric),
    ("size", ReservedField::Size, FieldKind::Numeric),
    ("at", ReservedField::At, FieldKind::Text),
    ("topic", ReservedField::Topic, FieldKind::Text),
];

impl ReservedField {
    /// Case-insensitive lookup of a reserved field by name.
    pub fn parse(name: &str) -> Option<Self> {
        RESERVED_FIELDS
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, field, _)| *field)
    }

    /// Persisted (lower-case) name of the field.
    pub fn name(self) -> &'static str {
        self.entry().0
    }

    pub fn kind(self) -> FieldKind {
        self.entry().2
    }

    /// Read this field out of a message.
    pub fn extract(self, message: &Message) -> FieldValue {
        match self {
            ReservedField::Offset => FieldValue::Int(message.offset),
            ReservedField::Partition => FieldValue::Int(i64::from(message.partition)),
            ReservedField::Timestamp => FieldValue::Int(message.timestamp),
            ReservedField::Size => FieldValue::Int(message.size),
            ReservedField::At => {
                FieldValue::Text(message.at.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            ReservedField::Topic => FieldValue::Text(message.topic.clone()),
        }
    }

    fn entry(self) -> &'static (&'static str, ReservedField, FieldKind) {
        RESERVED_FIELDS
            .iter()
            .find(|(_, field, _)| *field == self)
            .unwrap_or(&RESERVED_FIELDS[0])
    }
}

/// Value class of any field name: reserved fields per the table, header
/// keys are always text.
pub fn field_kind(name: &str) -> FieldKind {
    ReservedField::parse(name)
        .map(ReservedField::kind)
        .unwrap_or(FieldKind::Text)
}

/// A typed field value or filter operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(i64),
    Text(String),
}

impl FieldValue {
    /// Cast a raw operand to the given kind. Unparsable numbers become 0.
    pub fn cast(kind: FieldKind, raw: &str) -> Self {
        match kind {
            FieldKind::Numeric => FieldValue::Int(parse_int_or_zero(raw)),
            FieldKind::Text => FieldValue::Text(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            FieldValue::Int(v) => *v,
            FieldValue::Text(s) => parse_int_or_zero(s),
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Int(v) => Cow::Owned(v.to_string()),
            FieldValue::Text(s) => Cow::Borrowed(s),
        }
    }
}

fn parse_int_or_zero(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or(0)
}
