//! Cleanup of successful completion payloads.
//!
//! The transport layer only knows success or failure; deciding whether a
//! successful payload is usable JSON lives here, so retry policy and
//! response decoding can be tested apart from each other.

use serde_json::{Map, Value};
use tracing::debug;

/// Result of cleaning a payload that was expected to be JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanedPayload {
    /// Parsed, cleaned, and re-serialized JSON.
    Valid(String),
    /// Not valid JSON, but close enough to pass through as-is.
    Unstructured(String),
    /// Unusable; the caller should retry or skip.
    Invalid,
}

/// Clean a completion payload expected to contain a JSON object.
///
/// Models sometimes prefix output with an `Output:` marker, pad objects with
/// empty values, or emit very long free-text pairs; all of those are
/// stripped. A payload that does not parse but contains a `{` is passed
/// through unchanged for the caller to salvage.
pub fn clean_payload(payload: &str) -> CleanedPayload {
    let payload = payload
        .strip_prefix("Output:")
        .map_or(payload, str::trim_start);

    let parsed: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => {
            debug!("Payload not valid JSON");
            if payload.contains('{') {
                return CleanedPayload::Unstructured(payload.to_string());
            }
            return CleanedPayload::Invalid;
        }
    };

    let Value::Object(entries) = parsed else {
        // Valid JSON but not an object; return it unchanged.
        return CleanedPayload::Valid(payload.to_string());
    };

    let mut cleaned = Map::new();
    for (key, value) in entries {
        if is_empty_value(&value) {
            continue;
        }
        let value = match value {
            Value::Object(inner) => {
                // Nested maps sometimes arrive stuffed with empty entries.
                let trimmed: Map<String, Value> = inner
                    .into_iter()
                    .filter(|(_, v)| !is_empty_value(v))
                    .collect();
                if trimmed.is_empty() {
                    continue;
                }
                Value::Object(trimmed)
            }
            Value::String(ref s) => {
                // Very long key/value text pairs are more trouble than they
                // are informative.
                if key.len() + s.len() > 200 {
                    continue;
                }
                value
            }
            Value::Array(_) => value,
            other => {
                debug!(key = %key, "Dropping value of unexpected type");
                let _ = other;
                continue;
            }
        };
        cleaned.insert(key, value);
    }

    match serde_json::to_string_pretty(&Value::Object(cleaned)) {
        Ok(text) => CleanedPayload::Valid(text),
        Err(_) => CleanedPayload::Unstructured(payload.to_string()),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
