use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::field::{FieldValue, ReservedField};
use crate::filter::Filters;

/// One persisted broker record.
///
/// Field names are the persisted names in every backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub topic: String,
    pub headers: HashMap<String, String>,
    pub offset: i64,
    pub partition: i32,
    /// Broker event time, seconds since epoch.
    pub timestamp: i64,
    /// Same instant as `timestamp`.
    pub at: DateTime<Utc>,
    /// Byte length of the original payload.
    pub size: i64,
    /// Decoded payload body. Empty when the payload is not a JSON object.
    pub message: Map<String, Value>,
}

/// A consumed broker record before decoding, independent of the broker
/// client library.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    /// `None` when the broker reports a logical rather than a concrete offset.
    pub offset: Option<i64>,
    pub timestamp_ms: Option<i64>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
    pub payload: Option<Vec<u8>>,
}

/// Before/after pair of one change-feed event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changes {
    #[serde(rename = "old_val", default)]
    pub old_value: Option<Message>,
    #[serde(rename = "new_val", default)]
    pub new_value: Option<Message>,
}

impl Changes {
    /// Insert and update both collapse to the new state; deletes carry none.
    pub fn into_new_value(self) -> Option<Message> {
        self.new_value
    }
}

impl Message {
    /// Synthetic record announcing a topic name on the discovery stream.
    pub fn for_topic(name: impl Into<String>) -> Self {
        Self {
            topic: name.into(),
            ..Default::default()
        }
    }

    /// Decode a broker record. Never fails: bad offsets, timestamps and
    /// partitions become 0, a non-JSON payload becomes an empty body.
    pub fn from_record(record: RawRecord) -> Self {
        let offset = match record.offset {
            Some(offset) if offset >= 0 => offset,
            other => {
                tracing::warn!(topic = %record.topic, offset = ?other, "offset parse error, using 0");
                0
            }
        };

        let timestamp_ms = record.timestamp_ms.filter(|ms| *ms >= 0).unwrap_or(0);
        let at = DateTime::<Utc>::from_timestamp_millis(timestamp_ms).unwrap_or_default();

        let headers = record
            .headers
            .into_iter()
            .map(|(key, value)| {
                let value = value
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default();
                (key, value)
            })
            .collect();

        let payload = record.payload.unwrap_or_default();
        let message = if payload.is_empty() {
            Map::new()
        } else {
            match serde_json::from_slice::<Map<String, Value>>(&payload) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(topic = %record.topic, error = %e, "body parse error");
                    Map::new()
                }
            }
        };

        Self {
            topic: record.topic,
            headers,
            offset,
            partition: record.partition.max(0),
            timestamp: timestamp_ms / 1000,
            at,
            size: payload.len() as i64,
            message,
        }
    }

    /// Evaluate a filter bundle against this message.
    ///
    /// An entirely empty bundle never matches. Field predicates are AND-ed;
    /// a predicate naming neither a reserved field nor a present header
    /// rejects the message.
    pub fn matches(&self, filters: &Filters) -> bool {
        if filters.is_empty() {
            return false;
        }

        if !filters.topic.is_empty() && !eq_fold(&self.topic, &filters.topic) {
            return false;
        }

        for filter in &filters.filters {
            if filter.field_name().is_empty() {
                continue;
            }

            let left = match ReservedField::parse(filter.field_name()) {
                Some(field) => field.extract(self),
                None => match self.headers.get(filter.field_name()) {
                    Some(value) => FieldValue::Text(value.clone()),
                    None => return false,
                },
            };

            tracing::trace!(
                field = %filter.field_name(),
                value = ?left,
                operand = ?filter.field_value(),
                "evaluate filter"
            );
            if !filter.compare(&left) {
                return false;
            }
        }

        true
    }
}

fn eq_fold(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
}
