//! Workflow run persistence.

use sled::{Db, Tree};

use super::run::WorkflowRun;
use crate::error::{Error, StoreError};

/// Tree name for workflow runs.
const RUN_TREE: &str = "workflow:runs";

/// Persists workflow runs in sled, keyed by run id. Runs are ephemeral and
/// retained for audit until an external retention policy purges them.
pub struct RunStore {
    tree: Tree,
}

impl RunStore {
    /// Open the run store.
    pub fn open(db: &Db) -> Result<Self, Error> {
        let tree = db.open_tree(RUN_TREE).map_err(StoreError::from)?;
        Ok(Self { tree })
    }

    /// Save the current state of a run.
    pub fn put(&self, run: &WorkflowRun) -> Result<(), Error> {
        let bytes = serde_json::to_vec(run).map_err(|e| Error::Serialization(e.to_string()))?;
        self.tree
            .insert(run.id.as_bytes(), bytes)
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Get a run by id.
    pub fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>, Error> {
        match self.tree.get(run_id.as_bytes()).map_err(StoreError::from)? {
            Some(bytes) => {
                let run = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Deserialization(e.to_string()))?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// Remove a run (retention purge).
    pub fn remove(&self, run_id: &str) -> Result<bool, Error> {
        let removed = self
            .tree
            .remove(run_id.as_bytes())
            .map_err(StoreError::from)?;
        Ok(removed.is_some())
    }
}
