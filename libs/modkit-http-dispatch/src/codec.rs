//! JSON codec used by transports, with per-client feature toggles.
//!
//! A declarative client may enable or disable individual features; the
//! registry folds them into a [`JsonCodec`] when the client's transport is
//! created, so every operation of that client shares the same codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request::RequestBody;

/// Toggles affecting how request bodies are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SerializationFeature {
    /// Pretty-print request bodies (default: off).
    IndentOutput,
    /// Keep `null` entries of mapping bodies (default: on).
    WriteNullMapValues,
}

/// Toggles affecting how response bodies are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeserializationFeature {
    /// Treat a single-element array as its element (default: off).
    UnwrapSingleValueArrays,
    /// Reject an empty body instead of producing no value (default: off).
    FailOnEmptyBody,
}

/// Feature overrides declared by a client.
///
/// Enabled features are applied before disabled ones, so disabling wins when
/// a feature appears in both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonFeatures {
    pub enabled_serialization: Vec<SerializationFeature>,
    pub enabled_deserialization: Vec<DeserializationFeature>,
    pub disabled_serialization: Vec<SerializationFeature>,
    pub disabled_deserialization: Vec<DeserializationFeature>,
}

impl JsonFeatures {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.enabled_serialization.is_empty()
            && self.enabled_deserialization.is_empty()
            && self.disabled_serialization.is_empty()
            && self.disabled_deserialization.is_empty()
    }

    #[must_use]
    pub fn enable_serialization(mut self, feature: SerializationFeature) -> Self {
        self.enabled_serialization.push(feature);
        self
    }

    #[must_use]
    pub fn disable_serialization(mut self, feature: SerializationFeature) -> Self {
        self.disabled_serialization.push(feature);
        self
    }

    #[must_use]
    pub fn enable_deserialization(mut self, feature: DeserializationFeature) -> Self {
        self.enabled_deserialization.push(feature);
        self
    }

    #[must_use]
    pub fn disable_deserialization(mut self, feature: DeserializationFeature) -> Self {
        self.disabled_deserialization.push(feature);
        self
    }
}

/// Encoder/decoder for JSON bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct JsonCodec {
    indent_output: bool,
    write_null_map_values: bool,
    unwrap_single_value_arrays: bool,
    fail_on_empty_body: bool,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            indent_output: false,
            write_null_map_values: true,
            unwrap_single_value_arrays: false,
            fail_on_empty_body: false,
        }
    }
}

impl JsonCodec {
    /// Returns a copy of this codec with `features` applied.
    #[must_use]
    pub fn with_features(&self, features: &JsonFeatures) -> Self {
        let mut codec = self.clone();
        for feature in &features.enabled_serialization {
            codec.set_serialization(*feature, true);
        }
        for feature in &features.enabled_deserialization {
            codec.set_deserialization(*feature, true);
        }
        for feature in &features.disabled_serialization {
            codec.set_serialization(*feature, false);
        }
        for feature in &features.disabled_deserialization {
            codec.set_deserialization(*feature, false);
        }
        codec
    }

    fn set_serialization(&mut self, feature: SerializationFeature, on: bool) {
        match feature {
            SerializationFeature::IndentOutput => self.indent_output = on,
            SerializationFeature::WriteNullMapValues => self.write_null_map_values = on,
        }
    }

    fn set_deserialization(&mut self, feature: DeserializationFeature, on: bool) {
        match feature {
            DeserializationFeature::UnwrapSingleValueArrays => {
                self.unwrap_single_value_arrays = on;
            }
            DeserializationFeature::FailOnEmptyBody => self.fail_on_empty_body = on,
        }
    }

    /// Encodes a request body.
    ///
    /// # Errors
    /// Returns the serializer error if the body cannot be written.
    pub fn encode(&self, body: &RequestBody) -> Result<Bytes, serde_json::Error> {
        let value = match body {
            RequestBody::Fields(fields) if !self.write_null_map_values => Value::Object(
                fields
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            RequestBody::Fields(fields) => Value::Object(fields.clone()),
            RequestBody::Object(value) => value.clone(),
        };

        let bytes = if self.indent_output {
            serde_json::to_vec_pretty(&value)?
        } else {
            serde_json::to_vec(&value)?
        };
        Ok(Bytes::from(bytes))
    }

    /// Decodes a response body; `Ok(None)` means the body was empty.
    ///
    /// # Errors
    /// Returns the parser error for malformed JSON, or for an empty body when
    /// [`DeserializationFeature::FailOnEmptyBody`] is enabled.
    pub fn decode(&self, body: &[u8]) -> Result<Option<Value>, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) && !self.fail_on_empty_body {
            return Ok(None);
        }

        let value: Value = serde_json::from_slice(body)?;
        if self.unwrap_single_value_arrays
            && let Value::Array(items) = &value
            && items.len() == 1
        {
            return Ok(items.first().cloned());
        }
        Ok(Some(value))
    }
}
