//! Workflow definitions and their persistence.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;
use trellis_proto::MutationKind;

use crate::error::{Error, StoreError};

/// Tree name for workflow definitions.
const WORKFLOW_TREE: &str = "workflow:defs";

/// One workflow step: which model it touches, what it does to it, and which
/// policy set judges it first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    /// Step name, unique within the workflow.
    pub name: String,
    /// Data model the step operates on.
    pub model: String,
    /// Operation the step performs.
    pub operation: MutationKind,
    /// Policy set evaluated before the step executes.
    pub policy_set: String,
}

impl StepDef {
    /// Create a step definition.
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        operation: MutationKind,
        policy_set: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            operation,
            policy_set: policy_set.into(),
        }
    }
}

/// An ordered sequence of steps owned by a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Workflow id, unique within the project.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Optional human description.
    pub description: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<StepDef>,
}

impl WorkflowDef {
    /// Create an empty workflow.
    pub fn new(id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a step.
    pub fn with_step(mut self, step: StepDef) -> Self {
        self.steps.push(step);
        self
    }
}

/// Persists workflow definitions in sled, keyed per project.
pub struct WorkflowStore {
    tree: Tree,
}

impl WorkflowStore {
    /// Open the workflow store.
    pub fn open(db: &Db) -> Result<Self, Error> {
        let tree = db.open_tree(WORKFLOW_TREE).map_err(StoreError::from)?;
        Ok(Self { tree })
    }

    /// Save a workflow definition, replacing any prior version.
    pub fn put_def(&self, def: &WorkflowDef) -> Result<(), Error> {
        let key = Self::def_key(&def.project_id, &def.id);
        let bytes = serde_json::to_vec(def).map_err(|e| Error::Serialization(e.to_string()))?;
        self.tree.insert(key, bytes).map_err(StoreError::from)?;
        debug!(project = %def.project_id, workflow = %def.id, steps = def.steps.len(), "workflow saved");
        Ok(())
    }

    /// Get a workflow definition by id.
    pub fn get_def(&self, project: &str, id: &str) -> Result<Option<WorkflowDef>, Error> {
        let key = Self::def_key(project, id);
        match self.tree.get(key).map_err(StoreError::from)? {
            Some(bytes) => {
                let def = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Deserialization(e.to_string()))?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    /// List every workflow in a project.
    pub fn list_for_project(&self, project: &str) -> Result<Vec<WorkflowDef>, Error> {
        let mut prefix = project.as_bytes().to_vec();
        prefix.push(0);

        let mut defs = Vec::new();
        for result in self.tree.scan_prefix(prefix) {
            let (_, bytes) = result.map_err(StoreError::from)?;
            let def = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            defs.push(def);
        }
        Ok(defs)
    }

    fn def_key(project: &str, id: &str) -> Vec<u8> {
        let mut key = project.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(id.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_def() -> WorkflowDef {
        WorkflowDef::new("order-intake", "proj-1")
            .with_description("create an order and its first line item")
            .with_step(StepDef::new("create-order", "Order", MutationKind::Create, "default"))
            .with_step(StepDef::new(
                "create-line",
                "LineItem",
                MutationKind::Create,
                "default",
            ))
    }

    #[test]
    fn test_store_roundtrip() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = WorkflowStore::open(&db).unwrap();

        let def = sample_def();
        store.put_def(&def).unwrap();

        assert_eq!(store.get_def("proj-1", "order-intake").unwrap(), Some(def));
        assert!(store.get_def("proj-1", "missing").unwrap().is_none());
        assert!(store.get_def("proj-2", "order-intake").unwrap().is_none());
        assert_eq!(store.list_for_project("proj-1").unwrap().len(), 1);
    }
}
