//! Wire format between the browser client and the server.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use kafka_ui_store::{Filter, Filters, Message, Operator, ReservedField};

/// Query parameter that selects the topic instead of building a predicate.
const TOPIC_PARAMETER: &str = "topic";

// ═══════════════════════════════════════════════════════════════
//  Inbound
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum ClientRequest {
    Topics,
    Messages(MessageRequest),
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub filters: Vec<FilterRequest>,
    #[serde(default)]
    pub size: Option<Scalar>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FilterRequest {
    #[serde(default)]
    pub parameter: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub value: Option<Scalar>,
}

/// A JSON value the client may send either quoted or bare.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    pub fn to_text(&self) -> String {
        match self {
            Scalar::Text(s) => s.clone(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

impl MessageRequest {
    /// Translate the request into the store's filter bundle.
    ///
    /// No filters at all yields an empty bundle with the default size, which
    /// matches nothing. An unparsable size falls back to the default; a
    /// filter with an unknown operator is dropped.
    pub fn to_filters(&self) -> Filters {
        if self.filters.is_empty() {
            return Filters::default();
        }

        let mut result = Filters {
            size: parse_size(self.size.as_ref()),
            ..Default::default()
        };

        for filter in &self.filters {
            let value = filter.value.as_ref().map(Scalar::to_text).unwrap_or_default();

            if filter.parameter.eq_ignore_ascii_case(TOPIC_PARAMETER) {
                result.topic = value;
                continue;
            }

            let op = match filter.operator.parse::<Operator>() {
                Ok(op) => op,
                Err(e) => {
                    tracing::warn!(parameter = %filter.parameter, error = %e, "skip filter");
                    continue;
                }
            };
            result.filters.push(Filter::new(filter.parameter.as_str(), &value, op));
        }

        result
    }
}

fn parse_size(size: Option<&Scalar>) -> usize {
    let parsed = match size {
        Some(Scalar::Int(n)) => usize::try_from(*n).ok(),
        Some(Scalar::Text(s)) => s.trim().parse::<usize>().ok(),
        _ => None,
    };
    match parsed {
        Some(size) if size > 0 => size,
        _ => {
            tracing::warn!(size = ?size, "parse size error, using default");
            Filters::DEFAULT_SIZE
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Outbound
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct MessageFrame<'a> {
    message: WsMessage<'a>,
}

/// Message as the client renders it: numbers as decimal strings, `at` as
/// RFC 3339.
#[derive(Debug, Serialize)]
struct WsMessage<'a> {
    topic: &'a str,
    headers: &'a HashMap<String, String>,
    offset: String,
    partition: String,
    timestamp: String,
    at: String,
    size: String,
    message: &'a Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct TopicFrame<'a> {
    topic: TopicName<'a>,
}

#[derive(Debug, Serialize)]
struct TopicName<'a> {
    topic: &'a str,
}

pub fn message_frame(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(&MessageFrame {
        message: WsMessage {
            topic: &message.topic,
            headers: &message.headers,
            offset: message.offset.to_string(),
            partition: message.partition.to_string(),
            timestamp: message.timestamp.to_string(),
            at: ReservedField::At.extract(message).as_text().into_owned(),
            size: message.size.to_string(),
            message: &message.message,
        },
    })
}

pub fn topic_frame(topic: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&TopicFrame {
        topic: TopicName { topic },
    })
}

pub fn error_frame(error: impl std::fmt::Display) -> String {
    serde_json::json!({ "error": error.to_string() }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_ui_store::FieldValue;

    fn request(json: &str) -> ClientRequest {
        serde_json::from_str(json).unwrap()
    }

    fn messages(json: &str) -> Filters {
        match request(json) {
            ClientRequest::Messages(req) => req.to_filters(),
            other => panic!("expected a messages request, got {other:?}"),
        }
    }

    #[test]
    fn topics_request_is_recognized() {
        assert!(matches!(request(r#"{"request":"topics"}"#), ClientRequest::Topics));
    }

    #[test]
    fn unknown_request_is_rejected() {
        assert!(serde_json::from_str::<ClientRequest>(r#"{"request":"nope"}"#).is_err());
    }

    #[test]
    fn no_filters_means_default_bundle() {
        let filters = messages(r#"{"request":"messages","size":"5"}"#);
        assert!(filters.is_empty());
        assert_eq!(filters.size, 20);
    }

    #[test]
    fn topic_parameter_selects_topic() {
        let filters = messages(
            r#"{"request":"messages","size":"5","filters":[
                {"parameter":"offset","operator":">=","value":"100"},
                {"parameter":"topic","operator":"eq","value":"orders"}
            ]}"#,
        );
        assert_eq!(filters.topic, "orders");
        assert_eq!(filters.size, 5);
        assert_eq!(filters.filters.len(), 1);
        assert_eq!(filters.filters[0].field_name(), "offset");
        assert_eq!(filters.filters[0].operator(), Operator::Ge);
        assert_eq!(filters.filters[0].field_value(), &FieldValue::Int(100));
    }

    #[test]
    fn numeric_size_and_value_are_accepted() {
        let filters = messages(
            r#"{"request":"messages","size":7,"filters":[
                {"parameter":"partition","operator":"eq","value":3}
            ]}"#,
        );
        assert_eq!(filters.size, 7);
        assert_eq!(filters.filters[0].field_value(), &FieldValue::Int(3));
    }

    #[test]
    fn bad_size_falls_back_to_default() {
        let filters = messages(
            r#"{"request":"messages","size":"lots","filters":[
                {"parameter":"topic","operator":"eq","value":"orders"}
            ]}"#,
        );
        assert_eq!(filters.size, 20);
        assert_eq!(filters.topic, "orders");
    }

    #[test]
    fn unknown_operator_drops_the_filter() {
        let filters = messages(
            r#"{"request":"messages","filters":[
                {"parameter":"tenant","operator":"~~","value":"acme"},
                {"parameter":"tenant","operator":"contains","value":"ac"}
            ]}"#,
        );
        assert_eq!(filters.filters.len(), 1);
        assert_eq!(filters.filters[0].operator(), Operator::Contains);
    }

    #[test]
    fn message_frame_stringifies_numbers() {
        let message = Message {
            topic: "orders".into(),
            offset: 42,
            partition: 3,
            timestamp: 1_700_000_000,
            at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
            size: 12,
            ..Default::default()
        };
        let frame: Value = serde_json::from_str(&message_frame(&message).unwrap()).unwrap();
        assert_eq!(frame["message"]["topic"], "orders");
        assert_eq!(frame["message"]["offset"], "42");
        assert_eq!(frame["message"]["partition"], "3");
        assert_eq!(frame["message"]["timestamp"], "1700000000");
        assert_eq!(frame["message"]["at"], "2023-11-14T22:13:20Z");
        assert_eq!(frame["message"]["size"], "12");
    }

    #[test]
    fn topic_frame_nests_the_name() {
        assert_eq!(topic_frame("orders").unwrap(), r#"{"topic":{"topic":"orders"}}"#);
    }
}
