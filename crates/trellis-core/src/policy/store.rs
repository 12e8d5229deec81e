//! Policy set persistence.

use sled::{Db, Tree};
use tracing::debug;

use super::rule::PolicySet;
use crate::error::{Error, StoreError};

/// Tree name for policy sets.
const POLICY_TREE: &str = "policy:sets";

/// Persists policy sets in sled, keyed per project.
pub struct PolicyStore {
    tree: Tree,
}

impl PolicyStore {
    /// Open the policy store.
    pub fn open(db: &Db) -> Result<Self, Error> {
        let tree = db.open_tree(POLICY_TREE).map_err(StoreError::from)?;
        Ok(Self { tree })
    }

    /// Save a policy set, replacing any existing set with the same id.
    pub fn put_set(&self, set: &PolicySet) -> Result<(), Error> {
        let key = Self::set_key(&set.project_id, &set.id);
        let bytes = serde_json::to_vec(set).map_err(|e| Error::Serialization(e.to_string()))?;
        self.tree.insert(key, bytes).map_err(StoreError::from)?;
        debug!(project = %set.project_id, set = %set.id, rules = set.rules.len(), "policy set saved");
        Ok(())
    }

    /// Get a policy set by id.
    pub fn get_set(&self, project: &str, id: &str) -> Result<Option<PolicySet>, Error> {
        let key = Self::set_key(project, id);
        match self.tree.get(key).map_err(StoreError::from)? {
            Some(bytes) => {
                let set = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Deserialization(e.to_string()))?;
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    /// Remove a policy set. Returns whether it existed.
    pub fn remove_set(&self, project: &str, id: &str) -> Result<bool, Error> {
        let key = Self::set_key(project, id);
        let removed = self.tree.remove(key).map_err(StoreError::from)?;
        Ok(removed.is_some())
    }

    /// List every policy set in a project.
    pub fn list_for_project(&self, project: &str) -> Result<Vec<PolicySet>, Error> {
        let mut prefix = project.as_bytes().to_vec();
        prefix.push(0);

        let mut sets = Vec::new();
        for result in self.tree.scan_prefix(prefix) {
            let (_, bytes) = result.map_err(StoreError::from)?;
            let set = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            sets.push(set);
        }
        Ok(sets)
    }

    fn set_key(project: &str, id: &str) -> Vec<u8> {
        let mut key = project.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(id.as_bytes());
        key
    }
}
