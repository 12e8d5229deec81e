//! Instance validation against model definitions.
//!
//! The validator enforces the closed-schema rule: unknown fields are
//! rejected, never dropped, so partial-data corruption cannot hide behind a
//! lenient parser. Reference values are resolved against committed store
//! state through the relationship graph; a dangling reference is permanent
//! (there is no background sweeper), so it is refused here.

use std::collections::BTreeMap;

use regex::Regex;
use trellis_proto::{FieldValue, Value};

use super::field::FieldDef;
use super::model::ModelDef;
use super::registry::SchemaRegistry;
use super::types::FieldKind;
use crate::error::{Error, SchemaError};
use crate::graph::RelationGraph;
use crate::store::{Deadline, DocumentStore};

/// Compile a constraint pattern as a full-string match.
pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Check enum membership and string constraints for a non-null value that
/// already matches the field's declared kind.
pub(crate) fn check_value(field: &FieldDef, value: &Value) -> Result<(), SchemaError> {
    if let FieldKind::Enum { variants } = &field.kind {
        if let Some(label) = value.as_str() {
            if !variants.iter().any(|v| v == label) {
                return Err(SchemaError::ConstraintViolation {
                    field: field.name.clone(),
                    reason: format!("'{}' is not a declared variant", label),
                });
            }
        }
    }

    if let Some(constraints) = &field.constraints {
        if let Some(s) = value.as_str() {
            let len = s.chars().count() as u32;
            if let Some(min) = constraints.min_len {
                if len < min {
                    return Err(SchemaError::ConstraintViolation {
                        field: field.name.clone(),
                        reason: format!("length {} below minimum {}", len, min),
                    });
                }
            }
            if let Some(max) = constraints.max_len {
                if len > max {
                    return Err(SchemaError::ConstraintViolation {
                        field: field.name.clone(),
                        reason: format!("length {} above maximum {}", len, max),
                    });
                }
            }
            if let Some(pattern) = &constraints.pattern {
                let re = compile_pattern(pattern).map_err(|e| SchemaError::BadPattern {
                    field: field.name.clone(),
                    reason: e.to_string(),
                })?;
                if !re.is_match(s) {
                    return Err(SchemaError::ConstraintViolation {
                        field: field.name.clone(),
                        reason: format!("'{}' does not match pattern '{}'", s, pattern),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Validates instance payloads against a model definition.
///
/// Borrows the registry for definitions, the graph for reference existence
/// checks, and the store those checks read from.
pub struct InstanceValidator<'a> {
    registry: &'a SchemaRegistry,
    graph: &'a RelationGraph,
    store: &'a dyn DocumentStore,
}

impl<'a> InstanceValidator<'a> {
    /// Create a new validator.
    pub fn new(
        registry: &'a SchemaRegistry,
        graph: &'a RelationGraph,
        store: &'a dyn DocumentStore,
    ) -> Self {
        Self {
            registry,
            graph,
            store,
        }
    }

    /// Validate a payload against the named model's current definition.
    ///
    /// Returns the complete field map: every declared field present, with
    /// defaults applied to omitted fields and `Null` for omitted optionals.
    pub fn validate(
        &self,
        project: &str,
        model: &str,
        payload: &[FieldValue],
        deadline: Deadline,
    ) -> Result<BTreeMap<String, Value>, Error> {
        let model = self.registry.get_model(project, model)?;
        self.validate_against(&model, payload, deadline)
    }

    /// Validate a payload against an already-loaded definition.
    pub fn validate_against(
        &self,
        model: &ModelDef,
        payload: &[FieldValue],
        deadline: Deadline,
    ) -> Result<BTreeMap<String, Value>, Error> {
        let mut supplied: BTreeMap<String, Value> = BTreeMap::new();
        for fv in payload {
            if model.get_field(&fv.field).is_none() {
                return Err(SchemaError::UnknownField(fv.field.clone()).into());
            }
            if supplied.insert(fv.field.clone(), fv.value.clone()).is_some() {
                return Err(SchemaError::DuplicateField {
                    model: model.name.clone(),
                    field: fv.field.clone(),
                }
                .into());
            }
        }

        let mut out = BTreeMap::new();
        for field in &model.fields {
            // An explicit null does not pick up the default; only an omitted
            // field does.
            let value = match supplied.remove(&field.name) {
                Some(value) => value,
                None => field.default.clone().unwrap_or(Value::Null),
            };

            if value.is_null() {
                if field.required {
                    return Err(SchemaError::MissingRequiredField(field.name.clone()).into());
                }
                out.insert(field.name.clone(), Value::Null);
                continue;
            }

            if !field.kind.accepts(&value) {
                return Err(SchemaError::TypeMismatch {
                    field: field.name.clone(),
                    expected: field.kind.name().to_string(),
                    actual: value.kind_name().to_string(),
                }
                .into());
            }
            check_value(field, &value)?;

            if let FieldKind::Reference { target, .. } = &field.kind {
                self.check_reference_values(model, field, target, &value, deadline)?;
            }

            out.insert(field.name.clone(), value);
        }

        Ok(out)
    }

    fn check_reference_values(
        &self,
        model: &ModelDef,
        field: &FieldDef,
        target: &str,
        value: &Value,
        deadline: Deadline,
    ) -> Result<(), Error> {
        let mut ids: Vec<&str> = Vec::new();
        match value {
            Value::String(s) => ids.push(s),
            Value::StringArray(a) => ids.extend(a.iter().map(|s| s.as_str())),
            _ => {}
        }

        for id in ids {
            let exists = self.graph.check_reference(
                self.store,
                &model.project_id,
                target,
                id,
                deadline,
            )?;
            if !exists {
                return Err(SchemaError::DanglingReference {
                    field: field.name.clone(),
                    target_id: id.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::types::{Cardinality, StringConstraints};
    use crate::store::{collection_name, Document, SledStore};
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

    fn order_model() -> ModelDef {
        ModelDef::new("proj-1", "Order")
            .with_field(FieldDef::new("customer", FieldKind::String))
            .with_field(FieldDef::new("total", FieldKind::Number))
            .with_field(
                FieldDef::new(
                    "status",
                    FieldKind::Enum {
                        variants: vec!["open".into(), "shipped".into()],
                    },
                )
                .with_default("open"),
            )
            .with_field(FieldDef::optional("notes", FieldKind::String))
    }

    #[test]
    fn test_conforming_payload_succeeds() {
        let (registry, graph, store) = setup();
        registry.define_model(order_model()).unwrap();
        let validator = InstanceValidator::new(&registry, &graph, &store);

        let payload = [
            FieldValue::new("customer", "alice"),
            FieldValue::new("total", 120i64),
        ];
        let fields = validator.validate("proj-1", "Order", &payload, deadline()).unwrap();

        // Complete field map: default applied, optional nulled.
        assert_eq!(fields.get("status"), Some(&Value::String("open".into())));
        assert_eq!(fields.get("notes"), Some(&Value::Null));
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn test_missing_required_field_fails() {
        let (registry, graph, store) = setup();
        registry.define_model(order_model()).unwrap();
        let validator = InstanceValidator::new(&registry, &graph, &store);

        let payload = [FieldValue::new("customer", "alice")];
        let err = validator
            .validate("proj-1", "Order", &payload, deadline())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(SchemaError::MissingRequiredField(f)) if f == "total"
        ));
    }

    #[test]
    fn test_unknown_field_rejected_not_dropped() {
        let (registry, graph, store) = setup();
        registry.define_model(order_model()).unwrap();
        let validator = InstanceValidator::new(&registry, &graph, &store);

        let payload = [
            FieldValue::new("customer", "alice"),
            FieldValue::new("total", 120i64),
            FieldValue::new("surprise", true),
        ];
        let err = validator
            .validate("proj-1", "Order", &payload, deadline())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(SchemaError::UnknownField(f)) if f == "surprise"
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let (registry, graph, store) = setup();
        registry.define_model(order_model()).unwrap();
        let validator = InstanceValidator::new(&registry, &graph, &store);

        let payload = [
            FieldValue::new("customer", "alice"),
            FieldValue::new("total", "not a number"),
        ];
        let err = validator
            .validate("proj-1", "Order", &payload, deadline())
            .unwrap_err();
        assert!(matches!(err, Error::Schema(SchemaError::TypeMismatch { .. })));
    }

    #[test]
    fn test_enum_variant_enforced() {
        let (registry, graph, store) = setup();
        registry.define_model(order_model()).unwrap();
        let validator = InstanceValidator::new(&registry, &graph, &store);

        let payload = [
            FieldValue::new("customer", "alice"),
            FieldValue::new("total", 1i64),
            FieldValue::new("status", "lost"),
        ];
        let err = validator
            .validate("proj-1", "Order", &payload, deadline())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(SchemaError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn test_string_constraints_enforced() {
        let (registry, graph, store) = setup();
        let model = ModelDef::new("proj-1", "Sku").with_field(
            FieldDef::new("code", FieldKind::String).with_constraints(StringConstraints {
                min_len: Some(3),
                max_len: Some(8),
                pattern: Some("[A-Z0-9]+".into()),
            }),
        );
        registry.define_model(model).unwrap();
        let validator = InstanceValidator::new(&registry, &graph, &store);

        let ok = [FieldValue::new("code", "AB12")];
        assert!(validator.validate("proj-1", "Sku", &ok, deadline()).is_ok());

        let too_short = [FieldValue::new("code", "A")];
        assert!(validator.validate("proj-1", "Sku", &too_short, deadline()).is_err());

        let bad_chars = [FieldValue::new("code", "ab12")];
        assert!(validator.validate("proj-1", "Sku", &bad_chars, deadline()).is_err());
    }

    #[test]
    fn test_reference_must_resolve() {
        let (registry, graph, store) = setup();
        registry.define_model(order_model()).unwrap();
        let line_item = ModelDef::new("proj-1", "LineItem")
            .with_field(FieldDef::new(
                "order_id",
                FieldKind::Reference {
                    target: "Order".into(),
                    cardinality: Cardinality::One,
                },
            ))
            .with_field(FieldDef::new("qty", FieldKind::Number));
        registry.define_model(line_item).unwrap();

        let validator = InstanceValidator::new(&registry, &graph, &store);

        // Dangling reference refused.
        let payload = [
            FieldValue::new("order_id", "ord-1"),
            FieldValue::new("qty", 2i64),
        ];
        let err = validator
            .validate("proj-1", "LineItem", &payload, deadline())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(SchemaError::DanglingReference { .. })
        ));

        // Committed target resolves.
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("customer".to_string(), Value::String("alice".into()));
        store
            .create(
                &collection_name("proj-1", "Order"),
                Document::new("ord-1", fields),
                deadline(),
            )
            .unwrap();
        assert!(validator.validate("proj-1", "LineItem", &payload, deadline()).is_ok());
    }

    #[test]
    fn test_explicit_null_does_not_pick_up_default() {
        let (registry, graph, store) = setup();
        registry.define_model(order_model()).unwrap();
        let validator = InstanceValidator::new(&registry, &graph, &store);

        let payload = [
            FieldValue::new("customer", "alice"),
            FieldValue::new("total", 1i64),
            FieldValue::new("status", Value::Null),
        ];
        // "status" is required with a default; an explicit null is a missing
        // required value, not an invitation to re-apply the default.
        let err = validator
            .validate("proj-1", "Order", &payload, deadline())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(SchemaError::MissingRequiredField(f)) if f == "status"
        ));
    }
}
