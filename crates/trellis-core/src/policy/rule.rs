//! Policy rule and rule-set definitions.

use serde::{Deserialize, Serialize};
use trellis_proto::Value;

/// A predicate over the proposed mutation's field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Field equals the value.
    Eq {
        /// Field path.
        field: String,
        /// Comparison value.
        value: Value,
    },
    /// Field does not equal the value.
    Ne {
        /// Field path.
        field: String,
        /// Comparison value.
        value: Value,
    },
    /// Field is less than the value.
    Lt {
        /// Field path.
        field: String,
        /// Comparison value.
        value: Value,
    },
    /// Field is less than or equal to the value.
    Le {
        /// Field path.
        field: String,
        /// Comparison value.
        value: Value,
    },
    /// Field is greater than the value.
    Gt {
        /// Field path.
        field: String,
        /// Comparison value.
        value: Value,
    },
    /// Field is greater than or equal to the value.
    Ge {
        /// Field path.
        field: String,
        /// Comparison value.
        value: Value,
    },
    /// Field is one of the values.
    In {
        /// Field path.
        field: String,
        /// Allowed values.
        values: Vec<Value>,
    },
    /// String field contains the substring, or array field contains the
    /// element.
    Contains {
        /// Field path.
        field: String,
        /// Needle.
        value: Value,
    },
    /// Field is present with a non-null value.
    Exists {
        /// Field path.
        field: String,
    },
    /// Any payload field declared with this sensitivity label carries a
    /// non-null value.
    SensitivityIs {
        /// Sensitivity label.
        label: String,
    },
    /// Always matches.
    Always,
}

/// The effect a matched rule produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    /// Permit the mutation.
    Allow,
    /// Refuse the mutation.
    Deny,
    /// Permit the mutation after nulling the listed field paths.
    RedactFields {
        /// Fields to null before validation.
        fields: Vec<String>,
    },
    /// Halt for out-of-band approval.
    RequireApproval,
}

/// One ordered rule: the first rule whose predicate matches wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Optional human description.
    pub description: Option<String>,
    /// Match condition.
    pub predicate: Predicate,
    /// Effect when matched.
    pub effect: Effect,
}

impl Rule {
    /// Create a rule.
    pub fn new(predicate: Predicate, effect: Effect) -> Self {
        Self {
            description: None,
            predicate,
            effect,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Optional scoping: a set may be pinned to one workflow and/or step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppliesTo {
    /// Workflow id the set is pinned to, if any.
    pub workflow: Option<String>,
    /// Step name the set is pinned to, if any.
    pub step: Option<String>,
}

/// An ordered policy rule set. Declaration order is evaluation order; there
/// is no priority ranking. A mutation matching no rule is denied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Set id, unique within the project.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Optional workflow/step scoping.
    pub applies_to: Option<AppliesTo>,
    /// Rules in evaluation order.
    pub rules: Vec<Rule>,
}

impl PolicySet {
    /// Create an empty set.
    pub fn new(id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            applies_to: None,
            rules: Vec::new(),
        }
    }

    /// Append a rule.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Scope the set to a workflow (and optionally a step).
    pub fn with_applies_to(mut self, workflow: Option<String>, step: Option<String>) -> Self {
        self.applies_to = Some(AppliesTo { workflow, step });
        self
    }

    /// Whether this set may be evaluated for the given workflow step.
    pub fn applies(&self, workflow: &str, step: &str) -> bool {
        match &self.applies_to {
            None => true,
            Some(scope) => {
                scope.workflow.as_deref().map_or(true, |w| w == workflow)
                    && scope.step.as_deref().map_or(true, |s| s == step)
            }
        }
    }
}
