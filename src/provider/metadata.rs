//! Provider metadata normalization.
//!
//! The `metadata` field of a provider transaction shows up as an object, as a
//! JSON document encoded inside a string, as an empty string, as `null`, or as
//! a bare scalar depending on which integration created the charge. Everything
//! is collapsed into `Option<Metadata>` here so the rest of the crate deals
//! with one shape.

use serde_json::{Map, Value};
use thiserror::Error;

/// Normalized metadata mapping.
pub type Metadata = Map<String, Value>;

/// Key under which non-object metadata is preserved.
pub const FALLBACK_KEY: &str = "value";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Normalizes raw metadata text as received on the wire.
///
/// Fails only when `raw` is not JSON at all.
pub fn normalize(raw: &str) -> Result<Option<Metadata>, MetadataError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    Ok(normalize_value(value))
}

/// Normalizes an already-decoded metadata value.
pub fn normalize_value(value: Value) -> Option<Metadata> {
    match value {
        Value::Null => None,
        Value::Object(map) => non_empty(map),
        Value::String(text) => normalize_string(text),
        scalar => Some(wrap(scalar)),
    }
}

fn normalize_string(text: String) -> Option<Metadata> {
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(inner)) => non_empty(inner),
        _ => Some(wrap(Value::String(text))),
    }
}

fn non_empty(map: Metadata) -> Option<Metadata> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn wrap(value: Value) -> Metadata {
    let mut map = Map::new();
    map.insert(FALLBACK_KEY.to_string(), value);
    map
}
