//! Per-project relationship graph with cycle and deletion checking.

use std::collections::HashSet;

use sled::{Db, Tree};
use tracing::debug;
use trellis_proto::Value;

use super::relation::{IntegrityMode, RelationDef};
use crate::catalog::SchemaRegistry;
use crate::error::{Error, GraphError, StoreError};
use crate::store::{collection_name, Deadline, DocumentStore};

/// Tree name for relationship definitions.
const RELATION_TREE: &str = "graph:relations";

/// Bound on relationship traversal depth. The all-cascade-cycle invariant
/// keeps cascade chains finite, but the walk still refuses to chase
/// pathological graphs.
const MAX_TRAVERSAL_DEPTH: usize = 64;

/// One delete the store must apply to keep references intact.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDelete {
    /// Model the document belongs to.
    pub model: String,
    /// Document id.
    pub document_id: String,
    /// Version the delete is conditional on.
    pub expected_version: u64,
}

/// An ordered deletion plan: dependents come before the documents they
/// reference, so no dangling reference is observable between two committed
/// states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionPlan {
    /// Deletes in commit order.
    pub deletes: Vec<PlannedDelete>,
}

impl DeletionPlan {
    /// Number of documents the plan removes.
    pub fn len(&self) -> usize {
        self.deletes.len()
    }

    /// Whether the plan removes nothing.
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
    }

    /// Whether the plan removes the given document.
    pub fn contains(&self, model: &str, document_id: &str) -> bool {
        self.deletes
            .iter()
            .any(|d| d.model == model && d.document_id == document_id)
    }
}

/// The relationship graph: nodes are model names, edges are relationships,
/// scoped per project.
pub struct RelationGraph {
    tree: Tree,
}

impl RelationGraph {
    /// Open the relationship index on the given database.
    pub fn open(db: &Db) -> Result<Self, Error> {
        let tree = db.open_tree(RELATION_TREE).map_err(StoreError::from)?;
        Ok(Self { tree })
    }

    /// Add a relationship.
    ///
    /// Both endpoint models must exist in the project, the source field must
    /// be a reference field targeting the edge's target model, and a
    /// `Cascade` edge must not close a cycle in which every edge cascades.
    /// Non-cascade edges may participate in cycles safely; they do not
    /// propagate deletion.
    pub fn add_relationship(
        &self,
        registry: &SchemaRegistry,
        def: RelationDef,
    ) -> Result<(), Error> {
        let source = registry
            .get_model(&def.project_id, &def.source_model)
            .map_err(|_| GraphError::UnknownModel(def.source_model.clone()))?;
        registry
            .get_model(&def.project_id, &def.target_model)
            .map_err(|_| GraphError::UnknownModel(def.target_model.clone()))?;

        let field = source.get_field(&def.source_field).ok_or_else(|| {
            GraphError::BadSourceField {
                field: def.source_field.clone(),
                target: def.target_model.clone(),
            }
        })?;
        if field.kind.reference_target() != Some(def.target_model.as_str()) {
            return Err(GraphError::BadSourceField {
                field: def.source_field.clone(),
                target: def.target_model.clone(),
            }
            .into());
        }

        let key = Self::relation_key(&def.project_id, &def.name);
        if self.tree.contains_key(&key).map_err(StoreError::from)? {
            return Err(GraphError::DuplicateRelationship(def.name).into());
        }

        if def.cascades() {
            let existing = self.relations_for_project(&def.project_id)?;
            if self.closes_cascade_cycle(&existing, &def)? {
                return Err(GraphError::CascadeCycle(def.name).into());
            }
        }

        let bytes = serde_json::to_vec(&def).map_err(|e| Error::Serialization(e.to_string()))?;
        self.tree.insert(key, bytes).map_err(StoreError::from)?;

        debug!(
            project = %def.project_id,
            relationship = %def.name,
            ?def.mode,
            "relationship added"
        );
        Ok(())
    }

    /// Remove a relationship by name.
    pub fn remove_relationship(&self, project: &str, name: &str) -> Result<(), Error> {
        let key = Self::relation_key(project, name);
        let removed = self.tree.remove(key).map_err(StoreError::from)?;
        if removed.is_none() {
            return Err(GraphError::UnknownRelationship(name.to_string()).into());
        }
        Ok(())
    }

    /// Get a relationship by name.
    pub fn get_relationship(&self, project: &str, name: &str) -> Result<RelationDef, Error> {
        let key = Self::relation_key(project, name);
        match self.tree.get(key).map_err(StoreError::from)? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| Error::Deserialization(e.to_string()))
            }
            None => Err(GraphError::UnknownRelationship(name.to_string()).into()),
        }
    }

    /// All relationships declared in a project.
    pub fn relations_for_project(&self, project: &str) -> Result<Vec<RelationDef>, Error> {
        let mut prefix = project.as_bytes().to_vec();
        prefix.push(0);

        let mut relations = Vec::new();
        for result in self.tree.scan_prefix(prefix) {
            let (_, bytes) = result.map_err(StoreError::from)?;
            let def: RelationDef = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            relations.push(def);
        }
        Ok(relations)
    }

    /// Relationships whose target is the given model (incoming edges).
    pub fn relations_to(&self, project: &str, model: &str) -> Result<Vec<RelationDef>, Error> {
        Ok(self
            .relations_for_project(project)?
            .into_iter()
            .filter(|r| r.target_model == model)
            .collect())
    }

    /// Relationships using the given model field as their source.
    pub fn relations_using_field(
        &self,
        project: &str,
        model: &str,
        field: &str,
    ) -> Result<Vec<RelationDef>, Error> {
        Ok(self
            .relations_for_project(project)?
            .into_iter()
            .filter(|r| r.source_model == model && r.source_field == field)
            .collect())
    }

    /// Existence check for a reference value against committed store state.
    pub fn check_reference(
        &self,
        store: &dyn DocumentStore,
        project: &str,
        model: &str,
        target_id: &str,
        deadline: Deadline,
    ) -> Result<bool, Error> {
        match store.get(&collection_name(project, model), target_id, deadline) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Compute the ordered deletion plan for one document.
    ///
    /// Walks incoming `Cascade` edges breadth-first collecting every
    /// dependent that must also go; fails on the first populated `Restrict`
    /// edge; skips `Ignore` edges. The returned plan lists dependents before
    /// the documents they reference.
    pub fn check_delete(
        &self,
        store: &dyn DocumentStore,
        project: &str,
        model: &str,
        document_id: &str,
        deadline: Deadline,
    ) -> Result<DeletionPlan, Error> {
        let root = store.get(&collection_name(project, model), document_id, deadline)?;

        let mut collected = vec![PlannedDelete {
            model: model.to_string(),
            document_id: document_id.to_string(),
            expected_version: root.version,
        }];
        let mut visited: HashSet<(String, String)> = HashSet::new();
        visited.insert((model.to_string(), document_id.to_string()));

        // Queue of (model, document id, depth), breadth-first.
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((model.to_string(), document_id.to_string(), 0usize));

        while let Some((node_model, node_id, depth)) = queue.pop_front() {
            if depth >= MAX_TRAVERSAL_DEPTH {
                return Err(GraphError::DepthExceeded(MAX_TRAVERSAL_DEPTH).into());
            }

            for relation in self.relations_to(project, &node_model)? {
                if relation.mode == IntegrityMode::Ignore {
                    continue;
                }

                let dependents = self.find_dependents(store, project, &relation, &node_id, deadline)?;

                match relation.mode {
                    IntegrityMode::Ignore => unreachable!(),
                    IntegrityMode::Restrict => {
                        if !dependents.is_empty() {
                            return Err(GraphError::Restricted {
                                relationship: relation.name,
                                blocking_model: relation.source_model,
                            }
                            .into());
                        }
                    }
                    IntegrityMode::Cascade => {
                        for (dep_id, dep_version) in dependents {
                            let node = (relation.source_model.clone(), dep_id.clone());
                            if visited.insert(node) {
                                collected.push(PlannedDelete {
                                    model: relation.source_model.clone(),
                                    document_id: dep_id.clone(),
                                    expected_version: dep_version,
                                });
                                queue.push_back((
                                    relation.source_model.clone(),
                                    dep_id,
                                    depth + 1,
                                ));
                            }
                        }
                    }
                }
            }
        }

        // Root was collected first; dependents must commit before ancestors.
        collected.reverse();
        Ok(DeletionPlan { deletes: collected })
    }

    /// Scan a relation's source collection for documents referencing `id`.
    fn find_dependents(
        &self,
        store: &dyn DocumentStore,
        project: &str,
        relation: &RelationDef,
        id: &str,
        deadline: Deadline,
    ) -> Result<Vec<(String, u64)>, Error> {
        let collection = collection_name(project, &relation.source_model);
        let mut dependents = Vec::new();

        for doc in store.list(&collection, deadline)? {
            let references = match doc.get(&relation.source_field) {
                Some(Value::String(s)) => s == id,
                Some(Value::StringArray(ids)) => ids.iter().any(|v| v == id),
                _ => false,
            };
            if references {
                dependents.push((doc.id, doc.version));
            }
        }
        Ok(dependents)
    }

    /// Whether adding `candidate` (a cascade edge) closes a cycle made
    /// entirely of cascade edges. Iterative traversal with an explicit
    /// stack; depth is bounded.
    fn closes_cascade_cycle(
        &self,
        existing: &[RelationDef],
        candidate: &RelationDef,
    ) -> Result<bool, Error> {
        if candidate.source_model == candidate.target_model {
            return Ok(true);
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&str, usize)> = vec![(candidate.target_model.as_str(), 0)];

        while let Some((node, depth)) = stack.pop() {
            if depth >= MAX_TRAVERSAL_DEPTH {
                return Err(GraphError::DepthExceeded(MAX_TRAVERSAL_DEPTH).into());
            }
            if !visited.insert(node) {
                continue;
            }
            for edge in existing.iter().filter(|r| r.cascades()) {
                if edge.source_model == node {
                    if edge.target_model == candidate.source_model {
                        return Ok(true);
                    }
                    stack.push((edge.target_model.as_str(), depth + 1));
                }
            }
        }
        Ok(false)
    }

    fn relation_key(project: &str, name: &str) -> Vec<u8> {
        let mut key = project.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(name.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Cardinality, FieldChange, FieldDef, FieldKind, ModelDef};
    use crate::store::{Document, SledStore};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn setup() -> (SchemaRegistry, RelationGraph, SledStore) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let registry = SchemaRegistry::open(&db).unwrap();
        let graph = RelationGraph::open(&db).unwrap();
        let store = SledStore::new(db);
        (registry, graph, store)
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn reference(target: &str) -> FieldKind {
        FieldKind::Reference {
            target: target.into(),
            cardinality: Cardinality::One,
        }
    }

    /// Order <- LineItem via "order_id", plus a plain Tag model.
    fn order_schema(registry: &SchemaRegistry) {
        registry
            .define_model(
                ModelDef::new("proj-1", "Order")
                    .with_field(FieldDef::new("customer", FieldKind::String)),
            )
            .unwrap();
        registry
            .define_model(
                ModelDef::new("proj-1", "LineItem")
                    .with_field(FieldDef::new("order_id", reference("Order")))
                    .with_field(FieldDef::new("qty", FieldKind::Number)),
            )
            .unwrap();
    }

    fn put(store: &SledStore, collection: &str, id: &str, fields: &[(&str, Value)]) -> u64 {
        let mut map = BTreeMap::new();
        for (k, v) in fields {
            map.insert(k.to_string(), v.clone());
        }
        store
            .create(collection, Document::new(id, map), deadline())
            .unwrap()
            .version
    }

    #[test]
    fn test_add_relationship_validates_endpoints() {
        let (registry, graph, _store) = setup();
        order_schema(&registry);

        // Unknown model.
        let err = graph
            .add_relationship(
                &registry,
                RelationDef::new("bad", "proj-1", "Nope", "order_id", "Order"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::UnknownModel(_))));

        // Source field is not a reference to the target.
        let err = graph
            .add_relationship(
                &registry,
                RelationDef::new("bad", "proj-1", "LineItem", "qty", "Order"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::BadSourceField { .. })));

        // Valid edge.
        graph
            .add_relationship(
                &registry,
                RelationDef::new("order_lines", "proj-1", "LineItem", "order_id", "Order"),
            )
            .unwrap();

        // Duplicate name.
        let err = graph
            .add_relationship(
                &registry,
                RelationDef::new("order_lines", "proj-1", "LineItem", "order_id", "Order"),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Graph(GraphError::DuplicateRelationship(_))
        ));
    }

    #[test]
    fn test_all_cascade_cycle_rejected_restrict_accepted() {
        let (registry, graph, store) = setup();
        registry
            .define_model(
                ModelDef::new("proj-1", "A").with_field(FieldDef::new("name", FieldKind::String)),
            )
            .unwrap();
        registry
            .define_model(
                ModelDef::new("proj-1", "B")
                    .with_field(FieldDef::new("a_ref", reference("A"))),
            )
            .unwrap();
        registry
            .evolve_model(
                "proj-1",
                "A",
                vec![FieldChange::Add(FieldDef::optional("b_ref", reference("B")))],
                &graph,
                &store,
                deadline(),
            )
            .unwrap();

        graph
            .add_relationship(
                &registry,
                RelationDef::new("b_to_a", "proj-1", "B", "a_ref", "A")
                    .with_mode(IntegrityMode::Cascade),
            )
            .unwrap();

        // Closing the loop with another cascade edge is refused.
        let closing = RelationDef::new("a_to_b", "proj-1", "A", "b_ref", "B")
            .with_mode(IntegrityMode::Cascade);
        let err = graph.add_relationship(&registry, closing.clone()).unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::CascadeCycle(_))));

        // The same edge with restrict mode is safe.
        graph
            .add_relationship(&registry, closing.with_mode(IntegrityMode::Restrict))
            .unwrap();
    }

    #[test]
    fn test_self_referencing_cascade_rejected() {
        let (registry, graph, _store) = setup();
        registry
            .define_model(
                ModelDef::new("proj-1", "Category")
                    .with_field(FieldDef::new("name", FieldKind::String))
                    .with_field(FieldDef::optional("parent", reference("Category"))),
            )
            .unwrap();

        let err = graph
            .add_relationship(
                &registry,
                RelationDef::new("tree", "proj-1", "Category", "parent", "Category")
                    .with_mode(IntegrityMode::Cascade),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::CascadeCycle(_))));

        // Restrict self-reference is fine.
        graph
            .add_relationship(
                &registry,
                RelationDef::new("tree", "proj-1", "Category", "parent", "Category"),
            )
            .unwrap();
    }

    #[test]
    fn test_check_reference_reflects_committed_state() {
        let (registry, graph, store) = setup();
        order_schema(&registry);

        assert!(!graph
            .check_reference(&store, "proj-1", "Order", "ord-1", deadline())
            .unwrap());

        put(&store, "proj-1:Order", "ord-1", &[("customer", Value::String("alice".into()))]);

        assert!(graph
            .check_reference(&store, "proj-1", "Order", "ord-1", deadline())
            .unwrap());
    }

    #[test]
    fn test_cascade_delete_plan_orders_dependents_first() {
        let (registry, graph, store) = setup();
        order_schema(&registry);
        graph
            .add_relationship(
                &registry,
                RelationDef::new("order_lines", "proj-1", "LineItem", "order_id", "Order")
                    .with_mode(IntegrityMode::Cascade),
            )
            .unwrap();

        put(&store, "proj-1:Order", "ord-1", &[("customer", Value::String("alice".into()))]);
        put(
            &store,
            "proj-1:LineItem",
            "li-1",
            &[("order_id", Value::String("ord-1".into())), ("qty", Value::Int(2))],
        );
        put(
            &store,
            "proj-1:LineItem",
            "li-2",
            &[("order_id", Value::String("ord-1".into())), ("qty", Value::Int(5))],
        );
        // Unrelated line item survives.
        put(
            &store,
            "proj-1:Order",
            "ord-2",
            &[("customer", Value::String("bob".into()))],
        );
        put(
            &store,
            "proj-1:LineItem",
            "li-3",
            &[("order_id", Value::String("ord-2".into())), ("qty", Value::Int(1))],
        );

        let plan = graph
            .check_delete(&store, "proj-1", "Order", "ord-1", deadline())
            .unwrap();

        assert_eq!(plan.len(), 3);
        assert!(plan.contains("LineItem", "li-1"));
        assert!(plan.contains("LineItem", "li-2"));
        assert!(!plan.contains("LineItem", "li-3"));

        // The root delete commits last.
        assert_eq!(plan.deletes.last().unwrap().document_id, "ord-1");
        assert_eq!(plan.deletes.last().unwrap().model, "Order");
    }

    #[test]
    fn test_restrict_dependent_blocks_deletion() {
        let (registry, graph, store) = setup();
        order_schema(&registry);
        graph
            .add_relationship(
                &registry,
                RelationDef::new("order_lines", "proj-1", "LineItem", "order_id", "Order"),
            )
            .unwrap();

        put(&store, "proj-1:Order", "ord-1", &[("customer", Value::String("alice".into()))]);
        put(
            &store,
            "proj-1:LineItem",
            "li-1",
            &[("order_id", Value::String("ord-1".into())), ("qty", Value::Int(2))],
        );

        // The plan never includes the blocked document; the check fails first.
        let err = graph
            .check_delete(&store, "proj-1", "Order", "ord-1", deadline())
            .unwrap_err();
        match err {
            Error::Graph(GraphError::Restricted {
                relationship,
                blocking_model,
            }) => {
                assert_eq!(relationship, "order_lines");
                assert_eq!(blocking_model, "LineItem");
            }
            other => panic!("expected Restricted, got {other:?}"),
        }

        // Without dependents the delete goes through.
        store
            .delete("proj-1:LineItem", "li-1", 1, deadline())
            .unwrap();
        let plan = graph
            .check_delete(&store, "proj-1", "Order", "ord-1", deadline())
            .unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_ignore_edges_are_skipped() {
        let (registry, graph, store) = setup();
        order_schema(&registry);
        graph
            .add_relationship(
                &registry,
                RelationDef::new("order_lines", "proj-1", "LineItem", "order_id", "Order")
                    .with_mode(IntegrityMode::Ignore),
            )
            .unwrap();

        put(&store, "proj-1:Order", "ord-1", &[("customer", Value::String("alice".into()))]);
        put(
            &store,
            "proj-1:LineItem",
            "li-1",
            &[("order_id", Value::String("ord-1".into())), ("qty", Value::Int(2))],
        );

        let plan = graph
            .check_delete(&store, "proj-1", "Order", "ord-1", deadline())
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert!(!plan.contains("LineItem", "li-1"));
    }

    #[test]
    fn test_transitive_cascade_collects_grandchildren() {
        let (registry, graph, store) = setup();
        order_schema(&registry);
        registry
            .define_model(
                ModelDef::new("proj-1", "Adjustment")
                    .with_field(FieldDef::new("line_item_id", reference("LineItem")))
                    .with_field(FieldDef::new("amount", FieldKind::Number)),
            )
            .unwrap();
        graph
            .add_relationship(
                &registry,
                RelationDef::new("order_lines", "proj-1", "LineItem", "order_id", "Order")
                    .with_mode(IntegrityMode::Cascade),
            )
            .unwrap();
        graph
            .add_relationship(
                &registry,
                RelationDef::new("line_adjustments", "proj-1", "Adjustment", "line_item_id", "LineItem")
                    .with_mode(IntegrityMode::Cascade),
            )
            .unwrap();

        put(&store, "proj-1:Order", "ord-1", &[("customer", Value::String("alice".into()))]);
        put(
            &store,
            "proj-1:LineItem",
            "li-1",
            &[("order_id", Value::String("ord-1".into())), ("qty", Value::Int(2))],
        );
        put(
            &store,
            "proj-1:Adjustment",
            "adj-1",
            &[("line_item_id", Value::String("li-1".into())), ("amount", Value::Int(-5))],
        );

        let plan = graph
            .check_delete(&store, "proj-1", "Order", "ord-1", deadline())
            .unwrap();

        assert_eq!(plan.len(), 3);
        // Grandchild first, root last.
        assert_eq!(plan.deletes.first().unwrap().document_id, "adj-1");
        assert_eq!(plan.deletes.last().unwrap().document_id, "ord-1");
    }

    #[test]
    fn test_many_cardinality_references_count_as_dependents() {
        let (registry, graph, store) = setup();
        registry
            .define_model(
                ModelDef::new("proj-1", "Tag").with_field(FieldDef::new("label", FieldKind::String)),
            )
            .unwrap();
        registry
            .define_model(
                ModelDef::new("proj-1", "Article").with_field(FieldDef::new(
                    "tags",
                    FieldKind::Reference {
                        target: "Tag".into(),
                        cardinality: Cardinality::Many,
                    },
                )),
            )
            .unwrap();
        graph
            .add_relationship(
                &registry,
                RelationDef::new("article_tags", "proj-1", "Article", "tags", "Tag"),
            )
            .unwrap();

        put(&store, "proj-1:Tag", "tag-1", &[("label", Value::String("rust".into()))]);
        put(
            &store,
            "proj-1:Article",
            "art-1",
            &[("tags", Value::StringArray(vec!["tag-1".into(), "tag-2".into()]))],
        );

        let err = graph
            .check_delete(&store, "proj-1", "Tag", "tag-1", deadline())
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::Restricted { .. })));
    }
}
