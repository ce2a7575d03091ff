//! Event normalization: raw JSON records to typed [`Event`]s.

use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};

/// A normalized source record. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Integer-parsed `user_id`; the grouping key of every window.
    pub group_key: i64,
    pub user_id: String,
    pub event_type: String,
    /// Event time in nanoseconds since the Unix epoch (UTC).
    pub event_time: i64,
    pub value: f64,
    pub payload: String,
    /// `user_id + "_" + timestamp`, the candidate for a window's sample tag.
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("record is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be a {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("user_id {0:?} is not an integer")]
    InvalidGroupKey(String),
    #[error("timestamp {0:?} cannot be parsed")]
    InvalidTimestamp(String),
    #[error("value {0:?} is not a finite number")]
    InvalidValue(String),
}

impl ParseError {
    /// Short stable label, used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NotAnObject => "not_an_object",
            Self::MissingField(_) => "missing_field",
            Self::WrongType { .. } => "wrong_type",
            Self::InvalidGroupKey(_) => "invalid_group_key",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::InvalidValue(_) => "invalid_value",
        }
    }
}

/// Parses raw records into [`Event`]s.
///
/// Timestamps use `timestamp_format` (a chrono pattern, naive times taken as
/// UTC) when set; otherwise RFC 3339, falling back to a naive ISO-8601
/// date-time without offset.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    timestamp_format: Option<String>,
}

const NAIVE_ISO: &str = "%Y-%m-%dT%H:%M:%S%.f";

impl Normalizer {
    pub fn new(timestamp_format: Option<String>) -> Self {
        Self { timestamp_format }
    }

    pub fn normalize(&self, raw: &[u8]) -> Result<Event, ParseError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        let Value::Object(obj) = value else {
            return Err(ParseError::NotAnObject);
        };

        let user_id = string_field(&obj, "user_id")?;
        let event_type = string_field(&obj, "event_type")?;
        let timestamp = string_field(&obj, "timestamp")?;
        let raw_value = string_field(&obj, "value")?;
        let payload = match obj.get("payload") {
            None => return Err(ParseError::MissingField("payload")),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        let group_key = user_id
            .parse::<i64>()
            .map_err(|_| ParseError::InvalidGroupKey(user_id.to_string()))?;
        let event_time = self.parse_timestamp(timestamp)?;
        let value = raw_value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseError::InvalidValue(raw_value.to_string()))?;

        Ok(Event {
            group_key,
            user_id: user_id.to_string(),
            event_type: event_type.to_string(),
            event_time,
            value,
            payload,
            tag: format!("{user_id}_{timestamp}"),
        })
    }

    fn parse_timestamp(&self, raw: &str) -> Result<i64, ParseError> {
        let invalid = || ParseError::InvalidTimestamp(raw.to_string());
        let nanos = match &self.timestamp_format {
            Some(fmt) => NaiveDateTime::parse_from_str(raw, fmt)
                .ok()
                .and_then(|dt| dt.and_utc().timestamp_nanos_opt()),
            None => match DateTime::parse_from_rfc3339(raw) {
                Ok(dt) => dt.timestamp_nanos_opt(),
                Err(_) => NaiveDateTime::parse_from_str(raw, NAIVE_ISO)
                    .ok()
                    .and_then(|dt| dt.and_utc().timestamp_nanos_opt()),
            },
        };
        nanos.ok_or_else(invalid)
    }
}

fn string_field<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ParseError> {
    match obj.get(field) {
        None => Err(ParseError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ParseError::WrongType {
            field,
            expected: "string",
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
