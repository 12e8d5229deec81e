//! Data model definitions.

use rkyv::{Archive, Deserialize, Serialize};

use super::field::FieldDef;
use super::types::FieldKind;
use crate::error::Error;

/// A data model definition: an ordered set of named fields plus a schema
/// version that increments by exactly one on every structural change.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ModelDef {
    /// Owning project.
    pub project_id: String,
    /// Model name, unique within the project. Reference fields and
    /// relationships target models by this name.
    pub name: String,
    /// Field definitions, in declaration order.
    pub fields: Vec<FieldDef>,
    /// Schema version, 1 on definition.
    pub version: u64,
}

impl ModelDef {
    /// Create a model definition with version 0; the registry assigns
    /// version 1 when the model is defined.
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
            fields: Vec::new(),
            version: 0,
        }
    }

    /// Add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add multiple fields.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Get a field by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All reference fields.
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.kind.is_reference())
    }

    /// Fields carrying the given sensitivity label.
    pub fn fields_with_sensitivity<'a>(
        &'a self,
        label: &'a str,
    ) -> impl Iterator<Item = &'a FieldDef> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.sensitivity.as_deref() == Some(label))
    }

    /// Serialize to bytes for catalog storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from catalog storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// One structural edit applied by `evolve_model`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// Add a new field.
    Add(FieldDef),
    /// Remove an existing field.
    Remove {
        /// Field to remove.
        field: String,
    },
    /// Change an existing field's kind.
    Retype {
        /// Field to retype.
        field: String,
        /// New kind.
        kind: FieldKind,
    },
    /// Replace an existing field's string constraints.
    Constrain {
        /// Field to re-constrain.
        field: String,
        /// New constraints, `None` to drop them.
        constraints: Option<super::types::StringConstraints>,
    },
}
