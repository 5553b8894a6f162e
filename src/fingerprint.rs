//! Stable identities
//!
//! Session ids derived from structured keys and routine fingerprints must not
//! depend on key order or formatting, so both go through the helpers here.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;
use crate::types::{SessionId, SessionKey};

/// Derive the session id for a caller-supplied key.
///
/// Text keys are used verbatim and must be non-empty. Structured keys must be
/// a JSON object or array and are serialized with sorted object keys.
pub fn derive_session_id(key: &SessionKey) -> Result<SessionId, ConfigurationError> {
    match key {
        SessionKey::Text(text) if text.is_empty() => Err(ConfigurationError::InvalidId {
            found: "an empty string".to_string(),
        }),
        SessionKey::Text(text) => Ok(SessionId::new(text.clone())),
        SessionKey::Structured(value @ (JsonValue::Object(_) | JsonValue::Array(_))) => {
            Ok(SessionId::new(stable_stringify(value)))
        }
        SessionKey::Structured(JsonValue::String(text)) => {
            derive_session_id(&SessionKey::Text(text.clone()))
        }
        SessionKey::Structured(other) => Err(ConfigurationError::InvalidId {
            found: describe_json_type(other).to_string(),
        }),
    }
}

/// Serialize with object keys sorted at every level.
pub fn stable_stringify(value: &JsonValue) -> String {
    canonicalize_json(value).to_string()
}

/// Normalize JSON for deterministic output
///
/// - Object keys are sorted alphabetically (recursive)
/// - Arrays preserve order
pub fn canonicalize_json(v: &JsonValue) -> JsonValue {
    match v {
        JsonValue::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();

            let mut sorted = serde_json::Map::new();
            for k in keys {
                if let Some(child) = map.get(k) {
                    sorted.insert(k.clone(), canonicalize_json(child));
                }
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(arr) => JsonValue::Array(arr.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

/// Compute SHA256 of arbitrary bytes
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Convert hash bytes to hex string for display/storage
pub fn hash_to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn describe_json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
