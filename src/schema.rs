//! JSON Schemas for structured LLM responses.

use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;

use crate::prelude::*;

/// A JSON Schema generated from a Rust type, plus a validator for it.
#[derive(Debug)]
pub struct ResponseSchema {
    /// The schema, as sent to the LLM.
    schema: Value,

    /// Our JSON Schema validator.
    validator: jsonschema::Validator,
}

impl ResponseSchema {
    /// Build a schema for `T`.
    pub fn for_type<T: JsonSchema>() -> Result<Self> {
        let schema = serde_json::to_value(schema_for!(T))
            .context("failed to convert schema to JSON")?;
        debug!(%schema, "Schema");
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("invalid response schema: {err}"))?;
        Ok(Self { schema, validator })
    }

    /// The schema itself.
    pub fn json(&self) -> &Value {
        &self.schema
    }

    /// Check `response` against our schema and convert it to `T`.
    pub fn parse<T: DeserializeOwned>(&self, response: Value) -> Result<T> {
        self.validator
            .validate(&response)
            .map_err(|err| err.to_owned())
            .with_context(|| format!("Failed to validate {}:", response))?;
        serde_json::from_value(response).context("Failed to parse validated response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A test response.
    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Transcription {
        /// The text.
        text: String,
        #[serde(default)]
        location: Option<String>,
    }

    #[test]
    fn validates_and_parses_responses() {
        let schema = ResponseSchema::for_type::<Transcription>().unwrap();
        assert_eq!(schema.json()["title"], "Transcription");

        let parsed: Transcription = schema.parse(json!({ "text": "Bombay" })).unwrap();
        assert_eq!(parsed.text, "Bombay");
        assert!(parsed.location.is_none());

        assert!(schema.parse::<Transcription>(json!({ "txt": "Bombay" })).is_err());
        assert!(schema.parse::<Transcription>(json!({ "text": 7 })).is_err());
    }
}
