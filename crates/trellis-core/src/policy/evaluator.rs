//! First-match policy evaluation.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use trellis_proto::{MutationKind, Value};

use super::rule::{Effect, PolicySet, Predicate};
use crate::catalog::ModelDef;

/// The outcome of evaluating a policy set against a proposed mutation.
///
/// Every variant carries the index of the rule that produced it; the
/// fail-closed default deny carries none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// The mutation may proceed unchanged.
    Allow {
        /// Matched rule index.
        rule: usize,
    },
    /// The mutation may proceed after nulling the listed fields.
    Redact {
        /// Matched rule index.
        rule: usize,
        /// Field paths to null before validation.
        fields: Vec<String>,
    },
    /// The mutation is refused.
    Deny {
        /// Matched rule index, `None` when no rule matched.
        rule: Option<usize>,
    },
    /// Processing halts pending out-of-band approval. Not a failure; callers
    /// persist a distinct pending state and never retry automatically.
    RequireApproval {
        /// Matched rule index.
        rule: usize,
    },
}

impl Decision {
    /// Whether the mutation may proceed (possibly after redaction).
    pub fn is_permitted(&self) -> bool {
        matches!(self, Decision::Allow { .. } | Decision::Redact { .. })
    }
}

/// The mutation being judged: target model definition, operation kind, and
/// the field values the operation would commit.
pub struct MutationContext<'a> {
    /// Definition of the model the mutation touches.
    pub model: &'a ModelDef,
    /// Operation kind.
    pub kind: MutationKind,
    /// Field values under evaluation.
    pub fields: &'a BTreeMap<String, Value>,
}

/// Evaluates policy sets against mutation contexts.
pub struct PolicyEvaluator;

impl PolicyEvaluator {
    /// Evaluate rules in declaration order; the first matching predicate
    /// produces the decision. No match is a deny (fail-closed).
    pub fn evaluate(set: &PolicySet, ctx: &MutationContext<'_>) -> Decision {
        for (index, rule) in set.rules.iter().enumerate() {
            if Self::matches(&rule.predicate, ctx) {
                return match &rule.effect {
                    Effect::Allow => Decision::Allow { rule: index },
                    Effect::Deny => Decision::Deny { rule: Some(index) },
                    Effect::RedactFields { fields } => Decision::Redact {
                        rule: index,
                        fields: fields.clone(),
                    },
                    Effect::RequireApproval => Decision::RequireApproval { rule: index },
                };
            }
        }
        Decision::Deny { rule: None }
    }

    fn matches(predicate: &Predicate, ctx: &MutationContext<'_>) -> bool {
        match predicate {
            Predicate::Always => true,
            Predicate::Eq { field, value } => {
                Self::field_value(ctx, field).map_or(false, |v| Self::values_equal(v, value))
            }
            Predicate::Ne { field, value } => {
                Self::field_value(ctx, field).map_or(false, |v| !Self::values_equal(v, value))
            }
            Predicate::Lt { field, value } => Self::compare_field(ctx, field, value, Ordering::is_lt),
            Predicate::Le { field, value } => Self::compare_field(ctx, field, value, Ordering::is_le),
            Predicate::Gt { field, value } => Self::compare_field(ctx, field, value, Ordering::is_gt),
            Predicate::Ge { field, value } => Self::compare_field(ctx, field, value, Ordering::is_ge),
            Predicate::In { field, values } => Self::field_value(ctx, field)
                .map_or(false, |v| values.iter().any(|w| Self::values_equal(v, w))),
            Predicate::Contains { field, value } => {
                Self::field_value(ctx, field).map_or(false, |v| Self::contains(v, value))
            }
            Predicate::Exists { field } => {
                Self::field_value(ctx, field).map_or(false, |v| !v.is_null())
            }
            Predicate::SensitivityIs { label } => ctx
                .model
                .fields_with_sensitivity(label)
                .any(|f| ctx.fields.get(&f.name).map_or(false, |v| !v.is_null())),
        }
    }

    fn field_value<'b>(ctx: &'b MutationContext<'_>, field: &str) -> Option<&'b Value> {
        ctx.fields.get(field)
    }

    fn compare_field(
        ctx: &MutationContext<'_>,
        field: &str,
        value: &Value,
        accept: fn(Ordering) -> bool,
    ) -> bool {
        Self::field_value(ctx, field)
            .and_then(|v| Self::compare_values(v, value))
            .map_or(false, accept)
    }

    /// Equality with numeric widening, matching comparison semantics.
    fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(_), _) | (_, Value::Float(_)) | (Value::Int(_), _) | (_, Value::Int(_))
                if a.is_number() && b.is_number() =>
            {
                a.as_f64() == b.as_f64()
            }
            _ => a == b,
        }
    }

    /// Ordering for comparable value pairs; `None` for mismatched shapes.
    fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
            _ if a.is_number() && b.is_number() => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
            _ => None,
        }
    }

    fn contains(haystack: &Value, needle: &Value) -> bool {
        match (haystack, needle) {
            (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
            (Value::StringArray(a), Value::String(n)) => a.iter().any(|v| v == n),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDef, FieldKind};
    use crate::policy::rule::Rule;

    fn order_model() -> ModelDef {
        ModelDef::new("proj-1", "Order")
            .with_field(FieldDef::new("amount", FieldKind::Number))
            .with_field(
                FieldDef::optional("ssn", FieldKind::String).with_sensitivity("pii"),
            )
    }

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn ctx<'a>(model: &'a ModelDef, fields: &'a BTreeMap<String, Value>) -> MutationContext<'a> {
        MutationContext {
            model,
            kind: MutationKind::Create,
            fields,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let model = order_model();
        let set = PolicySet::new("guard", "proj-1")
            .with_rule(Rule::new(
                Predicate::Gt {
                    field: "amount".into(),
                    value: Value::Int(1000),
                },
                Effect::Deny,
            ))
            .with_rule(Rule::new(Predicate::Always, Effect::Allow));

        // amount=500 falls through the deny rule to the allow rule.
        let small = fields(&[("amount", Value::Int(500))]);
        let decision = PolicyEvaluator::evaluate(&set, &ctx(&model, &small));
        assert_eq!(decision, Decision::Allow { rule: 1 });

        // amount=2000 hits the deny rule first.
        let large = fields(&[("amount", Value::Int(2000))]);
        let decision = PolicyEvaluator::evaluate(&set, &ctx(&model, &large));
        assert_eq!(decision, Decision::Deny { rule: Some(0) });
    }

    #[test]
    fn test_no_match_is_fail_closed_deny() {
        let model = order_model();
        let set = PolicySet::new("guard", "proj-1").with_rule(Rule::new(
            Predicate::Eq {
                field: "amount".into(),
                value: Value::Int(1),
            },
            Effect::Allow,
        ));

        let payload = fields(&[("amount", Value::Int(2))]);
        let decision = PolicyEvaluator::evaluate(&set, &ctx(&model, &payload));
        assert_eq!(decision, Decision::Deny { rule: None });

        // An empty set denies everything.
        let empty = PolicySet::new("empty", "proj-1");
        let decision = PolicyEvaluator::evaluate(&empty, &ctx(&model, &payload));
        assert_eq!(decision, Decision::Deny { rule: None });
        assert!(!decision.is_permitted());
    }

    #[test]
    fn test_numeric_widening_in_comparisons() {
        let model = order_model();
        let set = PolicySet::new("guard", "proj-1").with_rule(Rule::new(
            Predicate::Ge {
                field: "amount".into(),
                value: Value::Float(99.5),
            },
            Effect::Allow,
        ));

        let payload = fields(&[("amount", Value::Int(100))]);
        assert!(PolicyEvaluator::evaluate(&set, &ctx(&model, &payload)).is_permitted());
    }

    #[test]
    fn test_redaction_decision_carries_fields() {
        let model = order_model();
        let set = PolicySet::new("guard", "proj-1").with_rule(Rule::new(
            Predicate::SensitivityIs { label: "pii".into() },
            Effect::RedactFields {
                fields: vec!["ssn".into()],
            },
        ));

        let payload = fields(&[
            ("amount", Value::Int(10)),
            ("ssn", Value::String("123-45-6789".into())),
        ]);
        let decision = PolicyEvaluator::evaluate(&set, &ctx(&model, &payload));
        assert_eq!(
            decision,
            Decision::Redact {
                rule: 0,
                fields: vec!["ssn".into()]
            }
        );

        // Without a sensitive value the rule does not match, so deny.
        let clean = fields(&[("amount", Value::Int(10))]);
        let decision = PolicyEvaluator::evaluate(&set, &ctx(&model, &clean));
        assert_eq!(decision, Decision::Deny { rule: None });
    }

    #[test]
    fn test_require_approval_halts() {
        let model = order_model();
        let set = PolicySet::new("guard", "proj-1")
            .with_rule(Rule::new(
                Predicate::Gt {
                    field: "amount".into(),
                    value: Value::Int(10_000),
                },
                Effect::RequireApproval,
            ))
            .with_rule(Rule::new(Predicate::Always, Effect::Allow));

        let payload = fields(&[("amount", Value::Int(50_000))]);
        let decision = PolicyEvaluator::evaluate(&set, &ctx(&model, &payload));
        assert_eq!(decision, Decision::RequireApproval { rule: 0 });
        assert!(!decision.is_permitted());
    }

    #[test]
    fn test_in_contains_exists() {
        let model = ModelDef::new("proj-1", "Doc")
            .with_field(FieldDef::new("status", FieldKind::String))
            .with_field(FieldDef::optional(
                "tags",
                FieldKind::Reference {
                    target: "Doc".into(),
                    cardinality: crate::catalog::Cardinality::Many,
                },
            ));

        let payload = fields(&[
            ("status", Value::String("open".into())),
            ("tags", Value::StringArray(vec!["t-1".into()])),
        ]);
        let mc = ctx(&model, &payload);

        assert!(PolicyEvaluator::matches(
            &Predicate::In {
                field: "status".into(),
                values: vec![Value::String("open".into()), Value::String("held".into())],
            },
            &mc
        ));
        assert!(PolicyEvaluator::matches(
            &Predicate::Contains {
                field: "tags".into(),
                value: Value::String("t-1".into()),
            },
            &mc
        ));
        assert!(PolicyEvaluator::matches(
            &Predicate::Exists {
                field: "status".into()
            },
            &mc
        ));
        assert!(!PolicyEvaluator::matches(
            &Predicate::Exists {
                field: "missing".into()
            },
            &mc
        ));
    }
}
