//! Field definitions for data models.

use rkyv::{Archive, Deserialize, Serialize};
use trellis_proto::Value;

use super::types::{FieldKind, StringConstraints};

/// A field definition within a data model.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name, unique within the model.
    pub name: String,
    /// Declared kind.
    pub kind: FieldKind,
    /// Whether a non-null value must be present.
    pub required: bool,
    /// Default applied when the payload omits the field.
    pub default: Option<Value>,
    /// Sensitivity label policies can match on (e.g. "pii").
    pub sensitivity: Option<String>,
    /// Constraints for string-kinded fields.
    pub constraints: Option<StringConstraints>,
}

impl FieldDef {
    /// Create a required field.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            sensitivity: None,
            constraints: None,
        }
    }

    /// Create an optional field.
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            sensitivity: None,
            constraints: None,
        }
    }

    /// Create a required single-cardinality reference field.
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
                cardinality: super::types::Cardinality::One,
            },
        )
    }

    /// Set the default value.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Set the sensitivity label.
    pub fn with_sensitivity(mut self, label: impl Into<String>) -> Self {
        self.sensitivity = Some(label.into());
        self
    }

    /// Set string constraints.
    pub fn with_constraints(mut self, constraints: StringConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// Check if this field has a default value.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}
