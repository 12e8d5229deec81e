//! Sled-backed document store.

use sled::{Db, Tree};
use tracing::debug;
use trellis_proto::FieldValue;

use super::{Deadline, Document, DocumentStore};
use crate::error::StoreError;

/// Prefix for per-collection trees.
const COLLECTION_TREE_PREFIX: &str = "doc:";

/// Document store backed by sled, one tree per collection.
///
/// Conditional updates and deletes use sled's compare-and-swap, so the
/// winning writer is decided by the store, not the engine.
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Wrap an open sled database.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Access the underlying database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    fn tree(&self, collection: &str) -> Result<Tree, StoreError> {
        let name = format!("{}{}", COLLECTION_TREE_PREFIX, collection);
        Ok(self.db.open_tree(name)?)
    }

    fn load(
        tree: &Tree,
        collection: &str,
        id: &str,
    ) -> Result<(Document, sled::IVec), StoreError> {
        match tree.get(id.as_bytes())? {
            Some(bytes) => {
                let doc = Document::from_bytes(&bytes)?;
                Ok((doc, bytes))
            }
            None => Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }
}

impl DocumentStore for SledStore {
    fn get(&self, collection: &str, id: &str, deadline: Deadline) -> Result<Document, StoreError> {
        deadline.check()?;
        let tree = self.tree(collection)?;
        let (doc, _) = Self::load(&tree, collection, id)?;
        Ok(doc)
    }

    fn create(
        &self,
        collection: &str,
        mut doc: Document,
        deadline: Deadline,
    ) -> Result<Document, StoreError> {
        deadline.check()?;
        let tree = self.tree(collection)?;

        doc.version = 1;
        let bytes = doc.to_bytes()?;

        let swapped = tree.compare_and_swap(
            doc.id.as_bytes(),
            None as Option<&[u8]>,
            Some(bytes),
        )?;
        if swapped.is_err() {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: doc.id.clone(),
            });
        }

        debug!(collection, id = %doc.id, "document created");
        Ok(doc)
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &[FieldValue],
        expected_version: u64,
        deadline: Deadline,
    ) -> Result<Document, StoreError> {
        deadline.check()?;
        let tree = self.tree(collection)?;
        let (current, current_bytes) = Self::load(&tree, collection, id)?;

        if current.version != expected_version {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        let mut next = current;
        for fv in patch {
            next.fields.insert(fv.field.clone(), fv.value.clone());
        }
        next.version += 1;
        let next_bytes = next.to_bytes()?;

        let swapped = tree.compare_and_swap(
            id.as_bytes(),
            Some(current_bytes),
            Some(next_bytes),
        )?;
        if swapped.is_err() {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        debug!(collection, id, version = next.version, "document updated");
        Ok(next)
    }

    fn delete(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        deadline: Deadline,
    ) -> Result<Document, StoreError> {
        deadline.check()?;
        let tree = self.tree(collection)?;
        let (current, current_bytes) = Self::load(&tree, collection, id)?;

        if current.version != expected_version {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        let swapped =
            tree.compare_and_swap(id.as_bytes(), Some(current_bytes), None as Option<&[u8]>)?;
        if swapped.is_err() {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        debug!(collection, id, "document deleted");
        Ok(current)
    }

    fn list(&self, collection: &str, deadline: Deadline) -> Result<Vec<Document>, StoreError> {
        deadline.check()?;
        let tree = self.tree(collection)?;

        let mut docs = Vec::new();
        for result in tree.iter() {
            let (_, bytes) = result?;
            docs.push(Document::from_bytes(&bytes)?);
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use trellis_proto::Value;

    fn test_store() -> SledStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledStore::new(db)
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn order(id: &str, total: i64) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("total".to_string(), Value::Int(total));
        Document::new(id, fields)
    }

    #[test]
    fn test_create_and_get() {
        let store = test_store();

        let created = store.create("p:Order", order("ord-1", 100), deadline()).unwrap();
        assert_eq!(created.version, 1);

        let fetched = store.get("p:Order", "ord-1", deadline()).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn test_create_duplicate_conflicts() {
        let store = test_store();
        store.create("p:Order", order("ord-1", 100), deadline()).unwrap();

        let result = store.create("p:Order", order("ord-1", 200), deadline());
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = test_store();
        let result = store.get("p:Order", "nope", deadline());
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_conditional_update() {
        let store = test_store();
        store.create("p:Order", order("ord-1", 100), deadline()).unwrap();

        let patch = [FieldValue::new("total", 150i64)];
        let updated = store.update("p:Order", "ord-1", &patch, 1, deadline()).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.get("total"), Some(&Value::Int(150)));

        // Stale expected version loses.
        let result = store.update("p:Order", "ord-1", &patch, 1, deadline());
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        // The losing writer changed nothing.
        let current = store.get("p:Order", "ord-1", deadline()).unwrap();
        assert_eq!(current.version, 2);
    }

    #[test]
    fn test_conditional_delete_returns_pre_image() {
        let store = test_store();
        store.create("p:Order", order("ord-1", 100), deadline()).unwrap();

        let result = store.delete("p:Order", "ord-1", 9, deadline());
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        let pre_image = store.delete("p:Order", "ord-1", 1, deadline()).unwrap();
        assert_eq!(pre_image.get("total"), Some(&Value::Int(100)));

        let result = store.get("p:Order", "ord-1", deadline());
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_list_scans_collection() {
        let store = test_store();
        store.create("p:Order", order("ord-1", 100), deadline()).unwrap();
        store.create("p:Order", order("ord-2", 200), deadline()).unwrap();
        store.create("p:Other", order("x-1", 1), deadline()).unwrap();

        let docs = store.list("p:Order", deadline()).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_expired_deadline_is_unavailable() {
        let store = test_store();
        let expired = Deadline::after(Duration::from_secs(0));
        let result = store.get("p:Order", "ord-1", expired);
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
