//! Schema registry: defines, evolves, and serves data-model definitions.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use sled::{Db, Tree};
use tracing::{debug, info};

use super::field::FieldDef;
use super::model::{FieldChange, ModelDef};
use super::types::FieldKind;
use super::validator::{check_value, compile_pattern};
use crate::error::{Error, SchemaError, StoreError};
use crate::graph::RelationGraph;
use crate::store::{collection_name, Deadline, DocumentStore};

/// Tree name for current model definitions.
const MODEL_TREE: &str = "catalog:models";

/// Tree name for historical model snapshots.
const VERSION_TREE: &str = "catalog:model_versions";

/// The schema registry for model definitions.
///
/// Every structural change writes both the current definition and a
/// versioned snapshot, so any historical schema version stays retrievable.
/// Current definitions are cached behind a read-write lock.
pub struct SchemaRegistry {
    models_tree: Tree,
    versions_tree: Tree,
    cache: RwLock<HashMap<(String, String), ModelDef>>,
}

impl SchemaRegistry {
    /// Open or create the registry on the given database.
    pub fn open(db: &Db) -> Result<Self, Error> {
        let models_tree = db.open_tree(MODEL_TREE).map_err(StoreError::from)?;
        let versions_tree = db.open_tree(VERSION_TREE).map_err(StoreError::from)?;
        Ok(Self {
            models_tree,
            versions_tree,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Define a new model. The stored definition gets schema version 1.
    ///
    /// Fails if the name is taken, any field name repeats, any reference
    /// field targets a model missing from the project, or any default value
    /// fails type-checking against its declared kind.
    pub fn define_model(&self, mut model: ModelDef) -> Result<ModelDef, Error> {
        let key = Self::model_key(&model.project_id, &model.name);
        if self.models_tree.contains_key(&key).map_err(StoreError::from)? {
            return Err(SchemaError::DuplicateModel(model.name).into());
        }

        let mut seen = HashSet::new();
        for field in &model.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    model: model.name.clone(),
                    field: field.name.clone(),
                }
                .into());
            }
            self.validate_field_def(&model, field)?;
        }

        model.version = 1;
        self.persist(&model)?;

        info!(project = %model.project_id, model = %model.name, "model defined");
        Ok(model)
    }

    /// Apply structural field changes to an existing model.
    ///
    /// The schema version increments by exactly 1 per call, however many
    /// changes the call carries. Removing a field that a relationship uses
    /// fails with `FieldInUse`; a kind or constraint change that would strand
    /// stored instances fails with `IncompatibleMigration` unless it is
    /// backward-compatible (identical kind, enum gaining variants, or
    /// constraints loosening).
    pub fn evolve_model(
        &self,
        project: &str,
        name: &str,
        changes: Vec<FieldChange>,
        graph: &RelationGraph,
        store: &dyn DocumentStore,
        deadline: Deadline,
    ) -> Result<ModelDef, Error> {
        let current = self.get_model(project, name)?;
        let mut next = current.clone();

        for change in changes {
            match change {
                FieldChange::Add(field) => {
                    if next.get_field(&field.name).is_some() {
                        return Err(SchemaError::DuplicateField {
                            model: name.to_string(),
                            field: field.name,
                        }
                        .into());
                    }
                    self.validate_field_def(&next, &field)?;
                    next.fields.push(field);
                }
                FieldChange::Remove { field } => {
                    let position = next
                        .fields
                        .iter()
                        .position(|f| f.name == field)
                        .ok_or_else(|| SchemaError::UnknownField(field.clone()))?;
                    if let Some(relation) = graph
                        .relations_using_field(project, name, &field)?
                        .into_iter()
                        .next()
                    {
                        return Err(SchemaError::FieldInUse {
                            field,
                            relationship: relation.name,
                        }
                        .into());
                    }
                    next.fields.remove(position);
                }
                FieldChange::Retype { field, kind } => {
                    let current_field = next
                        .get_field(&field)
                        .cloned()
                        .ok_or_else(|| SchemaError::UnknownField(field.clone()))?;

                    let mut retyped = current_field.clone();
                    retyped.kind = kind.clone();
                    if let FieldKind::Reference { .. } = kind {
                        self.validate_field_def(&next, &retyped)?;
                    }
                    if let Some(default) = &retyped.default {
                        if !default.is_null() && !kind.accepts(default) {
                            return Err(SchemaError::DefaultMismatch(field).into());
                        }
                    }

                    if !Self::kinds_compatible(&current_field.kind, &kind) {
                        self.ensure_instances_conform(
                            project, name, &retyped, store, deadline,
                        )?;
                    }

                    let slot = next.fields.iter_mut().find(|f| f.name == field);
                    if let Some(slot) = slot {
                        slot.kind = kind;
                    }
                }
                FieldChange::Constrain { field, constraints } => {
                    let current_field = next
                        .get_field(&field)
                        .cloned()
                        .ok_or_else(|| SchemaError::UnknownField(field.clone()))?;

                    let mut constrained = current_field.clone();
                    constrained.constraints = constraints.clone();
                    self.validate_field_def(&next, &constrained)?;

                    let old = current_field.constraints.clone().unwrap_or_default();
                    let new = constraints.clone().unwrap_or_default();
                    if !old.widens_to(&new) {
                        self.ensure_instances_conform(
                            project, name, &constrained, store, deadline,
                        )?;
                    }

                    let slot = next.fields.iter_mut().find(|f| f.name == field);
                    if let Some(slot) = slot {
                        slot.constraints = constraints;
                    }
                }
            }
        }

        next.version = current.version + 1;
        self.persist(&next)?;

        info!(
            project,
            model = name,
            version = next.version,
            "model evolved"
        );
        Ok(next)
    }

    /// Get the current definition of a model.
    pub fn get_model(&self, project: &str, name: &str) -> Result<ModelDef, Error> {
        {
            let cache = self.cache.read();
            if let Some(model) = cache.get(&(project.to_string(), name.to_string())) {
                return Ok(model.clone());
            }
        }

        let key = Self::model_key(project, name);
        match self.models_tree.get(key).map_err(StoreError::from)? {
            Some(bytes) => {
                let model = ModelDef::from_bytes(&bytes)?;
                self.cache
                    .write()
                    .insert((project.to_string(), name.to_string()), model.clone());
                Ok(model)
            }
            None => Err(SchemaError::UnknownModel(name.to_string()).into()),
        }
    }

    /// Whether a model is defined in the project.
    pub fn model_exists(&self, project: &str, name: &str) -> Result<bool, Error> {
        let key = Self::model_key(project, name);
        Ok(self.models_tree.contains_key(key).map_err(StoreError::from)?)
    }

    /// List every model name in a project.
    pub fn list_models(&self, project: &str) -> Result<Vec<String>, Error> {
        let mut prefix = project.as_bytes().to_vec();
        prefix.push(0);

        let mut names = Vec::new();
        for result in self.models_tree.scan_prefix(prefix) {
            let (_, bytes) = result.map_err(StoreError::from)?;
            let model = ModelDef::from_bytes(&bytes)?;
            names.push(model.name);
        }
        Ok(names)
    }

    /// Fetch a historical model snapshot.
    pub fn model_at_version(
        &self,
        project: &str,
        name: &str,
        version: u64,
    ) -> Result<Option<ModelDef>, Error> {
        let key = Self::version_key(project, name, version);
        match self.versions_tree.get(key).map_err(StoreError::from)? {
            Some(bytes) => Ok(Some(ModelDef::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Validate one field definition against its model.
    fn validate_field_def(&self, model: &ModelDef, field: &FieldDef) -> Result<(), Error> {
        if let Some(constraints) = &field.constraints {
            if !matches!(field.kind, FieldKind::String) {
                return Err(SchemaError::ConstraintViolation {
                    field: field.name.clone(),
                    reason: "length/pattern constraints require a string field".into(),
                }
                .into());
            }
            if let Some(pattern) = &constraints.pattern {
                compile_pattern(pattern).map_err(|e| SchemaError::BadPattern {
                    field: field.name.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        if let Some(target) = field.kind.reference_target() {
            // Self-references are legal; anything else must already exist in
            // the same project, which also rules out cross-project targets.
            if target != model.name && !self.model_exists(&model.project_id, target)? {
                return Err(SchemaError::UnknownTargetModel {
                    field: field.name.clone(),
                    target: target.to_string(),
                }
                .into());
            }
        }

        if let Some(default) = &field.default {
            if default.is_null() {
                if field.required {
                    return Err(SchemaError::DefaultMismatch(field.name.clone()).into());
                }
            } else {
                if !field.kind.accepts(default) {
                    return Err(SchemaError::DefaultMismatch(field.name.clone()).into());
                }
                check_value(field, default)?;
            }
        }

        Ok(())
    }

    /// Scan stored instances and reject the migration if any held value
    /// fails the new definition.
    fn ensure_instances_conform(
        &self,
        project: &str,
        model: &str,
        field: &FieldDef,
        store: &dyn DocumentStore,
        deadline: Deadline,
    ) -> Result<(), Error> {
        let collection = collection_name(project, model);
        for doc in store.list(&collection, deadline)? {
            let value = match doc.get(&field.name) {
                None => continue,
                Some(v) if v.is_null() => continue,
                Some(v) => v,
            };
            if !field.kind.accepts(value) {
                return Err(SchemaError::IncompatibleMigration {
                    field: field.name.clone(),
                    reason: format!(
                        "document '{}' holds {}, new kind is {}",
                        doc.id,
                        value.kind_name(),
                        field.kind.name()
                    ),
                }
                .into());
            }
            if let Err(e) = check_value(field, value) {
                return Err(SchemaError::IncompatibleMigration {
                    field: field.name.clone(),
                    reason: format!("document '{}': {}", doc.id, e),
                }
                .into());
            }
        }
        debug!(project, model, field = %field.name, "instance scan passed");
        Ok(())
    }

    /// Whether stored instances are guaranteed to conform without a scan.
    fn kinds_compatible(old: &FieldKind, new: &FieldKind) -> bool {
        if old == new {
            return true;
        }
        match (old, new) {
            (FieldKind::Enum { variants: old_v }, FieldKind::Enum { variants: new_v }) => {
                old_v.iter().all(|v| new_v.contains(v))
            }
            _ => false,
        }
    }

    fn persist(&self, model: &ModelDef) -> Result<(), Error> {
        let bytes = model.to_bytes()?;
        let key = Self::model_key(&model.project_id, &model.name);
        self.models_tree
            .insert(key, bytes.clone())
            .map_err(StoreError::from)?;
        self.versions_tree
            .insert(
                Self::version_key(&model.project_id, &model.name, model.version),
                bytes,
            )
            .map_err(StoreError::from)?;
        self.cache.write().insert(
            (model.project_id.clone(), model.name.clone()),
            model.clone(),
        );
        Ok(())
    }

    fn model_key(project: &str, name: &str) -> Vec<u8> {
        let mut key = project.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(name.as_bytes());
        key
    }

    fn version_key(project: &str, name: &str, version: u64) -> Vec<u8> {
        let mut key = Self::model_key(project, name);
        key.push(0);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}
