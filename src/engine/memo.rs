//! Schedule memo envelope codec.
//!
//! The engine stores memo fields as protobuf payloads; its JSON rendering is
//! an envelope of the form
//! `{"fields": {"<name>": {"metadata": {"encoding": "..."}, "data": "<base64 JSON>"}}}`.
//! Encoding and decoding must round-trip because the scheduler writes the
//! memo on create and the schedule repository reads it back on every sync.

use crate::error::EngineError;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const JSON_PLAIN_ENCODING: &str = "json/plain";

/// Build the memo envelope from named JSON payloads.
pub fn encode_envelope(fields: &BTreeMap<String, Value>) -> Result<Value, EngineError> {
    let mut encoded = serde_json::Map::new();
    for (name, value) in fields {
        let raw = serde_json::to_vec(value)
            .map_err(|err| EngineError::MalformedMemo(err.to_string()))?;
        encoded.insert(
            name.clone(),
            json!({
                "metadata": { "encoding": BASE64_STANDARD.encode(JSON_PLAIN_ENCODING) },
                "data": BASE64_STANDARD.encode(raw),
            }),
        );
    }
    Ok(json!({ "fields": Value::Object(encoded) }))
}

/// Decode one named field out of the envelope. A missing field yields
/// `None`; a present-but-malformed field is an error.
pub fn decode_field<T: DeserializeOwned>(
    envelope: &Value,
    name: &str,
) -> Result<Option<T>, EngineError> {
    let Some(data) = envelope
        .get("fields")
        .and_then(|fields| fields.get(name))
        .and_then(|field| field.get("data"))
        .and_then(|data| data.as_str())
    else {
        return Ok(None);
    };

    let raw = BASE64_STANDARD
        .decode(data)
        .map_err(|err| EngineError::MalformedMemo(format!("field `{name}`: {err}")))?;
    let decoded = serde_json::from_slice(&raw)
        .map_err(|err| EngineError::MalformedMemo(format!("field `{name}`: {err}")))?;
    Ok(Some(decoded))
}
