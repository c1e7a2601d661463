//! Canonical JSON encoding.
//!
//! Object keys are sorted and no insignificant whitespace is emitted, so the
//! same value always encodes to the same bytes. Used for event lines, hash
//! inputs, outbound request bodies and outbox lines.

use serde::Serialize;
use serde_json::{Map, Value};

/// Encode a JSON value canonically.
///
/// `serde_json`'s default `Map` is ordered by key and its compact writer adds
/// no whitespace, so plain serialization is already canonical. This relies on
/// the `preserve_order` feature staying off.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Encode a JSON object canonically
pub fn canonical_object(map: &Map<String, Value>) -> String {
    Value::Object(map.clone()).to_string()
}

/// Serialize any value and encode it canonically.
///
/// Goes through `Value` so struct fields are sorted like map keys.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(canonical_json(&serde_json::to_value(value)?))
}
