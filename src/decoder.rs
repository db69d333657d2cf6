//! Decoders turn raw Kafka payloads into validated [Record]s
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::Record;

/// Why a message was refused. Rejections are terminal for that message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },
    #[error("schema violation in field '{field}': {reason}")]
    SchemaViolation { field: String, reason: String },
}

impl Rejection {
    fn malformed(reason: impl Into<String>) -> Self {
        Rejection::MalformedPayload {
            reason: reason.into(),
        }
    }

    fn violation(field: &str, reason: impl Into<String>) -> Self {
        Rejection::SchemaViolation {
            field: field.to_owned(),
            reason: reason.into(),
        }
    }

    /// Offending field, if the rejection is tied to one
    pub fn field(&self) -> Option<&str> {
        match self {
            Rejection::MalformedPayload { .. } => None,
            Rejection::SchemaViolation { field, .. } => Some(field),
        }
    }
}

/// Decoder converts binary message from Kafka into a table row.
/// Must never panic on any input: every failure is a [Rejection].
pub trait Decoder {
    fn get_name(&self) -> String;
    fn decode(&self, message: &[u8]) -> Result<Record, Rejection>;
}

/// Decodes UTF-8 JSON objects against the fixed user profile schema
#[derive(Debug, Clone)]
pub struct JsonDecoder {
    coerce_numeric_strings: bool,
}

impl JsonDecoder {
    /// With `coerce_numeric_strings`, `"12345"` is accepted for numeric fields
    pub fn new(coerce_numeric_strings: bool) -> Self {
        JsonDecoder {
            coerce_numeric_strings,
        }
    }
}

impl Default for JsonDecoder {
    fn default() -> Self {
        JsonDecoder::new(true)
    }
}

impl Decoder for JsonDecoder {
    fn get_name(&self) -> String {
        String::from("json")
    }

    fn decode(&self, message: &[u8]) -> Result<Record, Rejection> {
        let text = std::str::from_utf8(message)
            .map_err(|e| Rejection::malformed(format!("invalid utf-8: {e}")))?;
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Rejection::malformed(format!("invalid json: {e}")))?;
        let obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(Rejection::malformed(format!(
                    "expected a JSON object, found {}",
                    kind(&other)
                )))
            }
        };
        let fields = Fields {
            obj: &obj,
            coerce: self.coerce_numeric_strings,
        };
        Ok(Record {
            full_name: fields.string("full_name")?,
            gender: fields.string("gender")?,
            location: fields.string("location")?,
            city: fields.string("city")?,
            country: fields.string("country")?,
            postcode: fields.int32("postcode")?,
            latitude: fields.float32("latitude")?,
            longitude: fields.float32("longitude")?,
            email: fields.string("email")?,
        })
    }
}

/// Validates a payload with the default JSON decoder
pub fn validate(raw: &[u8]) -> Result<Record, Rejection> {
    JsonDecoder::default().decode(raw)
}

struct Fields<'a> {
    obj: &'a Map<String, Value>,
    coerce: bool,
}

impl Fields<'_> {
    fn get(&self, field: &str) -> Result<&Value, Rejection> {
        match self.obj.get(field) {
            None => Err(Rejection::violation(field, "missing required field")),
            Some(Value::Null) => Err(Rejection::violation(field, "required field is null")),
            Some(v) => Ok(v),
        }
    }

    fn string(&self, field: &str) -> Result<String, Rejection> {
        match self.get(field)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(Rejection::violation(
                field,
                format!("expected string, found {}", kind(other)),
            )),
        }
    }

    fn int32(&self, field: &str) -> Result<i32, Rejection> {
        match self.get(field)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return i32::try_from(i)
                        .map_err(|_| Rejection::violation(field, format!("{i} out of int32 range")));
                }
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f >= i32::MIN as f64 && f <= i32::MAX as f64 => {
                        Ok(f as i32)
                    }
                    _ => Err(Rejection::violation(
                        field,
                        format!("{n} is not coercible to int32"),
                    )),
                }
            }
            Value::String(s) if self.coerce => s.trim().parse::<i32>().map_err(|_| {
                Rejection::violation(field, format!("{s:?} is not coercible to int32"))
            }),
            other => Err(Rejection::violation(
                field,
                format!("expected int32, found {}", kind(other)),
            )),
        }
    }

    fn float32(&self, field: &str) -> Result<f32, Rejection> {
        let parsed = match self.get(field)? {
            Value::Number(n) => n.as_f64().map(|f| f as f32),
            Value::String(s) if self.coerce => s.trim().parse::<f32>().ok(),
            other => {
                return Err(Rejection::violation(
                    field,
                    format!("expected float32, found {}", kind(other)),
                ))
            }
        };
        match parsed {
            Some(f) if f.is_finite() => Ok(f),
            _ => Err(Rejection::violation(field, "not coercible to float32")),
        }
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
