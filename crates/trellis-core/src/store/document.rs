//! Stored document representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use trellis_proto::Value;

use crate::error::StoreError;

/// A versioned document held by the store.
///
/// The version starts at 1 on create and increments on every committed
/// update. Conditional updates compare against it, so commit order as seen by
/// the store defines mutation ordering. The atomicity boundary is one
/// document: a rejected mutation leaves every field untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id, unique within its collection.
    pub id: String,
    /// Committed version, starting at 1.
    pub version: u64,
    /// Field values keyed by field name.
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    /// Create an unversioned document; the store assigns version 1 on create.
    pub fn new(id: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            fields,
        }
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Deserialize from stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_roundtrip() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Value::String("widget".into()));
        fields.insert("count".to_string(), Value::Int(3));

        let doc = Document {
            id: "doc-1".into(),
            version: 2,
            fields,
        };

        let bytes = doc.to_bytes().unwrap();
        let back = Document::from_bytes(&bytes).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn test_field_access() {
        let mut doc = Document::new("doc-1", BTreeMap::new());
        assert!(doc.get("name").is_none());
        doc.set("name", Value::String("widget".into()));
        assert_eq!(doc.get("name").and_then(|v| v.as_str()), Some("widget"));
    }
}
