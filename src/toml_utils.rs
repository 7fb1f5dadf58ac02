//! Helper functions for [`toml_span`].
//!
//! We parse TOML with `toml_span` so that error messages can point at the
//! offending line, then convert the result to JSON and let `serde` map it onto
//! our own types.

use std::borrow::Cow;

use serde::de::DeserializeOwned;
use toml_span::{DeserError, value::ValueInner};

use crate::prelude::*;

/// Parse a TOML string into a value of the specified type.
///
/// `description` is used in error messages, and is normally a file name.
pub fn from_toml_str<T>(description: &str, toml_str: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let value = toml_to_json(toml_str).map_err(|err| {
        let messages = err
            .errors
            .iter()
            .map(|e| describe_error(toml_str, e))
            .collect::<Vec<_>>()
            .join("; ");
        anyhow!("invalid TOML in {description}: {messages}")
    })?;
    serde_json::from_value::<T>(value)
        .with_context(|| format!("unexpected contents in {description}"))
}

/// Parse TOML into a JSON [`Value`].
pub fn toml_to_json(toml_str: &str) -> Result<Value, DeserError> {
    let mut value = toml_span::de::parse(toml_str)?;
    <JsonValue as toml_span::Deserialize>::deserialize(&mut value).map(JsonValue::into_json)
}

/// Format a TOML error with a 1-based line number.
fn describe_error(toml_str: &str, err: &toml_span::Error) -> String {
    let offset = err.span.start.min(toml_str.len());
    let line = toml_str[..offset].matches('\n').count() + 1;
    format!("line {line}: {err}")
}

/// Create a custom [`DeserError`] with a span.
pub fn custom_deser_error(
    span: toml_span::Span,
    msg: impl Into<Cow<'static, str>>,
) -> DeserError {
    let err_kind = toml_span::ErrorKind::Custom(msg.into());
    let err = toml_span::Error::from((err_kind, span));
    DeserError::from(err)
}

/// JSON [`Value`] wrapper for deserializing raw JSON from TOML.
#[derive(Debug)]
pub struct JsonValue(Value);

impl JsonValue {
    /// Convert to a [`Value`].
    pub fn into_json(self) -> Value {
        self.0
    }
}

impl<'de> toml_span::Deserialize<'de> for JsonValue {
    fn deserialize(value: &mut toml_span::Value<'de>) -> Result<Self, DeserError> {
        let inner = value.take();
        match inner {
            ValueInner::String(cow) => Ok(JsonValue(Value::String(cow.into_owned()))),
            ValueInner::Integer(i) => {
                Ok(JsonValue(Value::Number(serde_json::Number::from(i))))
            }
            ValueInner::Float(f) => Ok(JsonValue(Value::Number(
                serde_json::Number::from_f64(f).ok_or_else(|| {
                    custom_deser_error(value.span, "Invalid float value")
                })?,
            ))),
            ValueInner::Boolean(b) => Ok(JsonValue(Value::Bool(b))),
            ValueInner::Array(values) => {
                let values = values
                    .into_iter()
                    .map(|mut v| JsonValue::deserialize(&mut v).map(|v| v.into_json()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(JsonValue(Value::Array(values)))
            }
            ValueInner::Table(btree_map) => {
                let properties = btree_map
                    .into_iter()
                    .map(|(k, mut v)| -> Result<(String, Value), DeserError> {
                        let key = k.name.into_owned();
                        let value = JsonValue::deserialize(&mut v)?.into_json();
                        Ok((key, value))
                    })
                    .collect::<Result<serde_json::Map<_, _>, _>>()?;
                Ok(JsonValue(Value::Object(properties)))
            }
        }
    }
}
