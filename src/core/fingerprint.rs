//! Canonical request fingerprints used for in-flight deduplication.
use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::request::{ContentEntry, RequestDescriptor};

/// Hex-encoded SHA-256 of a canonicalized logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct CanonicalRequest<'a> {
    dependency: String,
    target: &'a str,
    capability: &'a str,
    content: Vec<Value>,
    parameters: Value,
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Fingerprint a logical request.
///
/// The dependency id is lowercased, content order is kept, and object keys
/// (parameters and nested bodies) are sorted before hashing.
pub fn create_fingerprint(
    dependency_id: &str,
    target: &str,
    capability: &str,
    content: &[ContentEntry],
    parameters: &BTreeMap<String, Value>,
) -> RequestFingerprint {
    let canonical = CanonicalRequest {
        dependency: dependency_id.to_lowercase(),
        target,
        capability,
        content: content
            .iter()
            .map(|entry| {
                let mut object = Map::new();
                object.insert("body".to_string(), canonicalize(&entry.body));
                object.insert("role".to_string(), Value::String(entry.role.clone()));
                Value::Object(object)
            })
            .collect(),
        parameters: Value::Object(
            parameters
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect(),
        ),
    };

    // Serializing plain JSON values into a Vec cannot fail
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    RequestFingerprint(hex::encode(Sha256::digest(&encoded)))
}

/// Fingerprint a request already resolved to `dependency_id`.
pub fn fingerprint_request(dependency_id: &str, request: &RequestDescriptor) -> RequestFingerprint {
    create_fingerprint(
        dependency_id,
        &request.target,
        &request.capability,
        &request.content,
        &request.parameters,
    )
}
