//! Translation between custom resources and Admin API payloads
//!
//! A [`Translator`] is bound to one API version of one kind. It turns the
//! populated version block into a request body and copies the fields of an
//! API response back into the observed status block of that version.

use crate::dispatch::ApiVersion;
use crate::error::{OperatorError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Version-specific converter for kind `K`
pub trait Translator<K>: Send + Sync {
    fn version(&self) -> ApiVersion;

    /// Request body for the populated version block
    fn to_api(&self, obj: &K) -> Result<Value>;

    /// Copy an API response into the observed status of this version
    fn from_api(&self, obj: &mut K, response: &Value) -> Result<()>;
}

/// Deserialize an API response, treating a mismatch as a translator defect
pub fn decode<T: DeserializeOwned>(value: &Value, what: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| OperatorError::Internal(format!("malformed {} response: {}", what, e)))
}

/// Serialize a spec block into a request body without null fields
pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    let mut json = serde_json::to_value(value)?;
    strip_nulls(&mut json);
    Ok(json)
}

/// Remove null object fields recursively
pub fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// JSON text with object keys in sorted order
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Hash of an applied request and the fingerprints of its dependencies.
///
/// Stored in `status.stateTracker`; settled handlers only write to Atlas when
/// the hash changes.
pub fn state_tracker(body: &Value, dependencies: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(body).as_bytes());
    for dependency in dependencies {
        hasher.update(b"\0");
        hasher.update(dependency.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_nulls() {
        let mut value = json!({"a": null, "b": {"c": null, "d": 1}, "e": [{"f": null}]});
        strip_nulls(&mut value);
        assert_eq!(value, json!({"b": {"d": 1}, "e": [{}]}));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": [1, {"d": true, "c": "x"}], "a": null});
        assert_eq!(canonical_json(&value), r#"{"a":null,"b":[1,{"c":"x","d":true}]}"#);
    }

    #[test]
    fn test_state_tracker_changes_with_dependencies() {
        let body = json!({"name": "g", "orgId": "o"});
        let base = state_tracker(&body, &[]);
        assert_eq!(base, state_tracker(&json!({"orgId": "o", "name": "g"}), &[]));
        assert_eq!(base.len(), 64);

        let with_secret = state_tracker(&body, &["ns/slack:abc".to_string()]);
        assert_ne!(base, with_secret);
        assert_ne!(
            with_secret,
            state_tracker(&body, &["ns/slack:def".to_string()])
        );
    }

    #[test]
    fn test_decode_reports_internal_error() {
        #[derive(serde::Deserialize)]
        struct Group {
            #[allow(dead_code)]
            id: String,
        }
        let err = decode::<Group>(&json!({"id": 5}), "group").err().unwrap();
        assert!(matches!(err, OperatorError::Internal(_)));
        assert!(err.to_string().contains("malformed group response"));
    }
}
