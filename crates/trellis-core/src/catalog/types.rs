//! Field kind definitions for the catalog.

use rkyv::{Archive, Deserialize, Serialize};
use trellis_proto::Value;

/// Cardinality of a reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Cardinality {
    /// Single target id.
    One,
    /// Array of target ids.
    Many,
}

/// The declared kind of a field, one tag per supported value shape.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum FieldKind {
    /// UTF-8 string.
    String,
    /// Numeric value (integer or float).
    Number,
    /// Boolean value.
    Boolean,
    /// Date as a timestamp (microseconds since Unix epoch).
    Date,
    /// One of a closed set of string labels.
    Enum {
        /// Allowed labels.
        variants: Vec<String>,
    },
    /// Link to a document of another model in the same project.
    Reference {
        /// Target model name.
        target: String,
        /// One id or an id array.
        cardinality: Cardinality,
    },
}

impl FieldKind {
    /// Human-readable kind name for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Enum { .. } => "enum",
            FieldKind::Reference { .. } => "reference",
        }
    }

    /// Whether this is a reference kind.
    pub fn is_reference(&self) -> bool {
        matches!(self, FieldKind::Reference { .. })
    }

    /// Target model name for reference kinds.
    pub fn reference_target(&self) -> Option<&str> {
        match self {
            FieldKind::Reference { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Check that a non-null value has the shape this kind declares.
    ///
    /// Enum membership and string constraints are separate checks; this only
    /// answers whether the value's shape matches the tag.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => matches!(value, Value::String(_)),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => matches!(value, Value::Bool(_)),
            FieldKind::Date => matches!(value, Value::Timestamp(_)),
            FieldKind::Enum { .. } => matches!(value, Value::String(_)),
            FieldKind::Reference { cardinality, .. } => match cardinality {
                Cardinality::One => matches!(value, Value::String(_)),
                Cardinality::Many => matches!(value, Value::StringArray(_)),
            },
        }
    }
}

/// Optional constraints on string-kinded fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Archive, Serialize, Deserialize)]
pub struct StringConstraints {
    /// Minimum length in characters.
    pub min_len: Option<u32>,
    /// Maximum length in characters.
    pub max_len: Option<u32>,
    /// Full-match regular expression.
    pub pattern: Option<String>,
}

impl StringConstraints {
    /// Length-only constraints.
    pub fn length(min_len: Option<u32>, max_len: Option<u32>) -> Self {
        Self {
            min_len,
            max_len,
            pattern: None,
        }
    }

    /// Pattern-only constraint.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            min_len: None,
            max_len: None,
            pattern: Some(pattern.into()),
        }
    }

    /// Whether `other` accepts every string this constraint set accepts.
    ///
    /// Used by schema evolution: loosening constraints never strands stored
    /// instances, so it needs no instance scan.
    pub fn widens_to(&self, other: &StringConstraints) -> bool {
        let min_ok = match (self.min_len, other.min_len) {
            (_, None) => true,
            (Some(old), Some(new)) => new <= old,
            (None, Some(new)) => new == 0,
        };
        let max_ok = match (self.max_len, other.max_len) {
            (_, None) => true,
            (Some(old), Some(new)) => new >= old,
            (None, Some(_)) => false,
        };
        let pattern_ok = other.pattern.is_none() || other.pattern == self.pattern;
        min_ok && max_ok && pattern_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_accepts() {
        assert!(FieldKind::String.accepts(&Value::String("x".into())));
        assert!(!FieldKind::String.accepts(&Value::Int(1)));

        assert!(FieldKind::Number.accepts(&Value::Int(1)));
        assert!(FieldKind::Number.accepts(&Value::Float(1.5)));

        assert!(FieldKind::Date.accepts(&Value::Timestamp(0)));

        let kind = FieldKind::Enum {
            variants: vec!["a".into(), "b".into()],
        };
        assert!(kind.accepts(&Value::String("z".into())));

        let one = FieldKind::Reference {
            target: "Order".into(),
            cardinality: Cardinality::One,
        };
        assert!(one.accepts(&Value::String("ord-1".into())));
        assert!(!one.accepts(&Value::StringArray(vec!["ord-1".into()])));

        let many = FieldKind::Reference {
            target: "Order".into(),
            cardinality: Cardinality::Many,
        };
        assert!(many.accepts(&Value::StringArray(vec!["ord-1".into()])));
    }

    #[test]
    fn test_constraint_widening() {
        let old = StringConstraints::length(Some(2), Some(10));

        assert!(old.widens_to(&StringConstraints::length(Some(1), Some(20))));
        assert!(old.widens_to(&StringConstraints::length(None, None)));
        assert!(!old.widens_to(&StringConstraints::length(Some(5), Some(10))));
        assert!(!old.widens_to(&StringConstraints::length(Some(2), Some(5))));

        let patterned = StringConstraints::pattern("[a-z]+");
        assert!(patterned.widens_to(&StringConstraints::default()));
        assert!(!StringConstraints::default().widens_to(&patterned));
    }
}
