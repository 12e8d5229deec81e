//! Relationship definitions between data models.

use serde::{Deserialize, Serialize};

/// What happens to dependents when a referenced document is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityMode {
    /// Deleting the target also deletes every dependent.
    Cascade,
    /// Deletion is blocked while dependents exist.
    Restrict,
    /// Dependents are left alone.
    Ignore,
}

/// A named, directed edge between two data models in one project.
///
/// The source model's reference field points at the target model; deletion
/// integrity flows from target to source according to the mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDef {
    /// Relationship name, unique within the project.
    pub name: String,
    /// Owning project.
    pub project_id: String,
    /// Model holding the reference field.
    pub source_model: String,
    /// Reference field on the source model.
    pub source_field: String,
    /// Model the reference points at.
    pub target_model: String,
    /// Deletion integrity mode.
    pub mode: IntegrityMode,
}

impl RelationDef {
    /// Create a relationship with the default `Restrict` mode.
    pub fn new(
        name: impl Into<String>,
        project_id: impl Into<String>,
        source_model: impl Into<String>,
        source_field: impl Into<String>,
        target_model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            project_id: project_id.into(),
            source_model: source_model.into(),
            source_field: source_field.into(),
            target_model: target_model.into(),
            mode: IntegrityMode::Restrict,
        }
    }

    /// Set the integrity mode.
    pub fn with_mode(mut self, mode: IntegrityMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether deletions propagate across this edge.
    pub fn cascades(&self) -> bool {
        self.mode == IntegrityMode::Cascade
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_builder() {
        let rel = RelationDef::new("order_lines", "proj-1", "LineItem", "order_id", "Order");

        assert_eq!(rel.mode, IntegrityMode::Restrict);
        assert_eq!(rel.source_model, "LineItem");
        assert_eq!(rel.target_model, "Order");
        assert!(!rel.cascades());

        let rel = rel.with_mode(IntegrityMode::Cascade);
        assert!(rel.cascades());
    }

    #[test]
    fn test_json_roundtrip() {
        let rel = RelationDef::new("order_lines", "proj-1", "LineItem", "order_id", "Order")
            .with_mode(IntegrityMode::Ignore);
        let json = serde_json::to_string(&rel).unwrap();
        let back: RelationDef = serde_json::from_str(&json).unwrap();
        assert_eq!(rel, back);
    }
}
