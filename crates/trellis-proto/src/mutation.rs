//! Mutation IR describing write operations.

use crate::value::Value;

/// The kind of write a mutation performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum MutationKind {
    /// Insert a new document.
    Create,
    /// Replace fields of an existing document.
    Update,
    /// Remove an existing document.
    Delete,
    /// Patch-merge a subset of fields on an existing document.
    Transform,
}

impl MutationKind {
    /// Whether this kind targets an existing document.
    pub fn targets_existing(&self) -> bool {
        !matches!(self, MutationKind::Create)
    }
}

/// A field name and value pair.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldValue {
    /// Field name.
    pub field: String,
    /// Field value.
    pub value: Value,
}

impl FieldValue {
    /// Create a new field-value pair.
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// A mutation against a single document of a data model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Mutation {
    /// Insert a new document.
    Create {
        /// Data model the document belongs to.
        model: String,
        /// Field values for the new document.
        data: Vec<FieldValue>,
    },
    /// Replace fields of an existing document.
    Update {
        /// Data model the document belongs to.
        model: String,
        /// Id of the document to update.
        id: String,
        /// Field values to apply.
        data: Vec<FieldValue>,
    },
    /// Delete an existing document.
    Delete {
        /// Data model the document belongs to.
        model: String,
        /// Id of the document to delete.
        id: String,
    },
    /// Patch-merge a subset of fields on an existing document.
    Transform {
        /// Data model the document belongs to.
        model: String,
        /// Id of the document to patch.
        id: String,
        /// Field values to merge.
        data: Vec<FieldValue>,
    },
}

impl Mutation {
    /// Create an insert mutation.
    pub fn create(model: impl Into<String>, data: Vec<FieldValue>) -> Self {
        Mutation::Create {
            model: model.into(),
            data,
        }
    }

    /// Create an update mutation.
    pub fn update(model: impl Into<String>, id: impl Into<String>, data: Vec<FieldValue>) -> Self {
        Mutation::Update {
            model: model.into(),
            id: id.into(),
            data,
        }
    }

    /// Create a delete mutation.
    pub fn delete(model: impl Into<String>, id: impl Into<String>) -> Self {
        Mutation::Delete {
            model: model.into(),
            id: id.into(),
        }
    }

    /// Create a transform (patch-merge) mutation.
    pub fn transform(
        model: impl Into<String>,
        id: impl Into<String>,
        data: Vec<FieldValue>,
    ) -> Self {
        Mutation::Transform {
            model: model.into(),
            id: id.into(),
            data,
        }
    }

    /// Get the data model this mutation operates on.
    pub fn model(&self) -> &str {
        match self {
            Mutation::Create { model, .. }
            | Mutation::Update { model, .. }
            | Mutation::Delete { model, .. }
            | Mutation::Transform { model, .. } => model,
        }
    }

    /// Get the target document id, if the mutation names one.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Mutation::Create { .. } => None,
            Mutation::Update { id, .. }
            | Mutation::Delete { id, .. }
            | Mutation::Transform { id, .. } => Some(id),
        }
    }

    /// Get the field payload, empty for deletes.
    pub fn data(&self) -> &[FieldValue] {
        match self {
            Mutation::Create { data, .. }
            | Mutation::Update { data, .. }
            | Mutation::Transform { data, .. } => data,
            Mutation::Delete { .. } => &[],
        }
    }

    /// Get the mutation kind.
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create { .. } => MutationKind::Create,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
            Mutation::Transform { .. } => MutationKind::Transform,
        }
    }
}
