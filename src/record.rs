//! Parsing and validation of event payloads.
//!
//! A payload must be a UTF-8 JSON object carrying all four event fields with
//! the right JSON types. Anything else becomes a [`Rejection`]; no field is
//! ever defaulted or coerced from a string.

use serde_json::{Map, Value};
use std::fmt;

use crate::source::RawMessage;

/// A validated event.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    pub id: String,
    pub name: String,
    pub age: i32,
    pub price: f64,
}

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InvalidUtf8,
    MalformedJson(String),
    NotAnObject,
    MissingField(&'static str),
    NullField(&'static str),
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    OutOfRange(&'static str),
}

impl RejectReason {
    /// Short label used as a metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::InvalidUtf8 => "invalid_utf8",
            RejectReason::MalformedJson(_) => "malformed_json",
            RejectReason::NotAnObject => "not_an_object",
            RejectReason::MissingField(_) => "missing_field",
            RejectReason::NullField(_) => "null_field",
            RejectReason::TypeMismatch { .. } => "type_mismatch",
            RejectReason::OutOfRange(_) => "out_of_range",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InvalidUtf8 => write!(f, "payload is not valid UTF-8"),
            RejectReason::MalformedJson(e) => write!(f, "malformed JSON: {e}"),
            RejectReason::NotAnObject => write!(f, "payload is not a JSON object"),
            RejectReason::MissingField(field) => write!(f, "missing field '{field}'"),
            RejectReason::NullField(field) => write!(f, "field '{field}' is null"),
            RejectReason::TypeMismatch {
                field,
                expected,
                found,
            } => write!(f, "field '{field}' must be {expected}, got {found}"),
            RejectReason::OutOfRange(field) => {
                write!(f, "field '{field}' is outside the 32-bit integer range")
            }
        }
    }
}

/// A message that failed validation, with enough context to diagnose it.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub message_id: String,
    /// Payload rendered lossily for display.
    pub payload: String,
    pub reason: RejectReason,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message {} rejected ({}): {}",
            self.message_id, self.reason, self.payload
        )
    }
}

/// Parse a delivered message into a [`TypedRecord`].
pub fn parse_message(message: &RawMessage) -> Result<TypedRecord, Rejection> {
    parse_payload(&message.payload).map_err(|reason| Rejection {
        message_id: message.message_id.clone(),
        payload: String::from_utf8_lossy(&message.payload).into_owned(),
        reason,
    })
}

/// Validate raw payload bytes.
pub fn parse_payload(payload: &[u8]) -> Result<TypedRecord, RejectReason> {
    let text = std::str::from_utf8(payload).map_err(|_| RejectReason::InvalidUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| RejectReason::MalformedJson(e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(RejectReason::NotAnObject);
    };

    Ok(TypedRecord {
        id: string_field(&object, "id")?,
        name: string_field(&object, "name")?,
        age: integer_field(&object, "age")?,
        price: number_field(&object, "price")?,
    })
}

fn field<'a>(object: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, RejectReason> {
    match object.get(name) {
        None => Err(RejectReason::MissingField(name)),
        Some(Value::Null) => Err(RejectReason::NullField(name)),
        Some(value) => Ok(value),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn mismatch(name: &'static str, expected: &'static str, value: &Value) -> RejectReason {
    RejectReason::TypeMismatch {
        field: name,
        expected,
        found: json_type(value),
    }
}

fn string_field(object: &Map<String, Value>, name: &'static str) -> Result<String, RejectReason> {
    match field(object, name)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(mismatch(name, "a string", other)),
    }
}

/// Integers, or numbers with no fractional part such as `30.0`.
fn integer_field(object: &Map<String, Value>, name: &'static str) -> Result<i32, RejectReason> {
    let value = field(object, name)?;
    let Value::Number(number) = value else {
        return Err(mismatch(name, "an integer", value));
    };

    if let Some(i) = number.as_i64() {
        return i32::try_from(i).map_err(|_| RejectReason::OutOfRange(name));
    }
    if number.is_u64() {
        return Err(RejectReason::OutOfRange(name));
    }
    match number.as_f64() {
        Some(f) if f.fract() == 0.0 => {
            if f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
                Ok(f as i32)
            } else {
                Err(RejectReason::OutOfRange(name))
            }
        }
        _ => Err(mismatch(name, "an integer", value)),
    }
}

fn number_field(object: &Map<String, Value>, name: &'static str) -> Result<f64, RejectReason> {
    let value = field(object, name)?;
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| mismatch(name, "a number", value)),
        other => Err(mismatch(name, "a number", other)),
    }
}
