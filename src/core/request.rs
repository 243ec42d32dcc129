//! Logical request and response shapes flowing through the dispatcher.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One ordered piece of request content (e.g. a chat message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub role: String,
    pub body: Value,
}

impl ContentEntry {
    pub fn new(role: impl Into<String>, body: impl Into<Value>) -> Self {
        Self {
            role: role.into(),
            body: body.into(),
        }
    }

    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(role, Value::String(text.into()))
    }
}

/// Provider-independent description of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Explicit dependency; when absent the dispatcher routes by `target`
    #[serde(default)]
    pub dependency_id: Option<String>,
    /// Model or other target name
    pub target: String,
    /// Capability tag, e.g. `chat` or `embeddings`
    pub capability: String,
    #[serde(default)]
    pub content: Vec<ContentEntry>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl RequestDescriptor {
    pub fn new(target: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            dependency_id: None,
            target: target.into(),
            capability: capability.into(),
            content: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, dependency_id: impl Into<String>) -> Self {
        self.dependency_id = Some(dependency_id.into());
        self
    }

    pub fn with_content(mut self, entry: ContentEntry) -> Self {
        self.content.push(entry);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Result of a dependency operation, shared verbatim with coalesced callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub dependency_id: String,
    pub target: String,
    pub body: Value,
    /// Payload size reported by the adapter, fed into pool transfer counters
    #[serde(default)]
    pub bytes: u64,
}

impl ProviderResponse {
    pub fn new(dependency_id: impl Into<String>, target: impl Into<String>, body: Value) -> Self {
        Self {
            dependency_id: dependency_id.into(),
            target: target.into(),
            body,
            bytes: 0,
        }
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }
}
