//! Engine error taxonomy.
//!
//! Split by subsystem so callers can tell caller-fixable definition problems
//! (`SchemaError`), blocked referential-integrity operations (`GraphError`),
//! tenancy violations (`TenancyError`), and store conditions (`StoreError`)
//! apart. Store conflicts and unavailability drive the workflow engine's
//! compensation and retry paths; everything else is surfaced unchanged.

use thiserror::Error;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum Error {
    /// Schema definition or validation problem. Caller-fixable, never retried.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Referential-integrity violation. Blocks the operation.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Tenant or project boundary violation.
    #[error(transparent)]
    Tenancy(#[from] TenancyError),

    /// Policy configuration problem.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Document store condition.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Workflow run lifecycle violation.
    #[error(transparent)]
    Run(#[from] RunError),

    /// Shared type error.
    #[error("protocol error: {0}")]
    Proto(#[from] trellis_proto::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Whether this error should trigger run compensation when it occurs
    /// mid-step: validation, integrity, and conflict failures all roll the
    /// run back; policy and tenancy refusals are reported as-is.
    pub fn triggers_compensation(&self) -> bool {
        matches!(
            self,
            Error::Schema(_)
                | Error::Graph(_)
                | Error::Store(StoreError::Conflict { .. })
                | Error::Store(StoreError::NotFound { .. })
        )
    }
}

/// Schema definition and instance validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// A model with this name already exists in the project.
    #[error("model '{0}' already defined in project")]
    DuplicateModel(String),

    /// The model does not exist.
    #[error("unknown data model: {0}")]
    UnknownModel(String),

    /// Two fields in one model share a name.
    #[error("duplicate field '{field}' in model '{model}'")]
    DuplicateField {
        /// Model being defined.
        model: String,
        /// Offending field name.
        field: String,
    },

    /// A reference field targets a model that does not exist in the project.
    #[error("field '{field}' references unknown model '{target}'")]
    UnknownTargetModel {
        /// Referencing field.
        field: String,
        /// Missing target model.
        target: String,
    },

    /// A declared default value does not type-check against the field kind.
    #[error("default value for field '{0}' does not match its declared kind")]
    DefaultMismatch(String),

    /// A string-constraint pattern failed to compile.
    #[error("invalid pattern on field '{field}': {reason}")]
    BadPattern {
        /// Constrained field.
        field: String,
        /// Compiler message.
        reason: String,
    },

    /// A required field is absent from the payload.
    #[error("missing required field '{0}'")]
    MissingRequiredField(String),

    /// A payload value does not match the declared field kind.
    #[error("field '{field}' expects {expected}, got {actual}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Declared kind.
        expected: String,
        /// Shape of the supplied value.
        actual: String,
    },

    /// The payload carries a field the model does not declare. The schema is
    /// closed; unknown fields are rejected rather than dropped.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// A value violates a field constraint (length, pattern, enum variant).
    #[error("field '{field}' violates constraint: {reason}")]
    ConstraintViolation {
        /// Field name.
        field: String,
        /// Which constraint failed.
        reason: String,
    },

    /// A reference value points at a document that does not exist.
    #[error("reference field '{field}' points at missing document '{target_id}'")]
    DanglingReference {
        /// Reference field.
        field: String,
        /// Missing target document id.
        target_id: String,
    },

    /// The field is the source of a declared relationship and cannot be
    /// removed while the relationship exists.
    #[error("field '{field}' is in use by relationship '{relationship}'")]
    FieldInUse {
        /// Field being removed.
        field: String,
        /// Relationship that uses it.
        relationship: String,
    },

    /// A type change would strand stored instances with incompatible values.
    #[error("incompatible migration for field '{field}': {reason}")]
    IncompatibleMigration {
        /// Field being retyped.
        field: String,
        /// Why the migration is rejected.
        reason: String,
    },

    /// Policy redacted a field the schema requires. This is a configuration
    /// error in the policy/model pairing, not a runtime fault.
    #[error("required field '{0}' was redacted by policy")]
    RequiredFieldRedacted(String),
}

/// Relationship graph errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The new edge would close a cycle in which every edge cascades.
    #[error("relationship '{0}' would close an all-cascade cycle")]
    CascadeCycle(String),

    /// A relationship with this name already exists in the project.
    #[error("relationship '{0}' already defined in project")]
    DuplicateRelationship(String),

    /// The relationship names a model that does not exist.
    #[error("relationship endpoint names unknown model '{0}'")]
    UnknownModel(String),

    /// The relationship does not exist.
    #[error("unknown relationship: {0}")]
    UnknownRelationship(String),

    /// The source field is missing or is not a reference to the target model.
    #[error("field '{field}' is not a reference field targeting '{target}'")]
    BadSourceField {
        /// Named source field.
        field: String,
        /// Expected target model.
        target: String,
    },

    /// Deletion is blocked while restrict-mode dependents exist.
    #[error("deletion blocked by relationship '{relationship}': dependents exist in '{blocking_model}'")]
    Restricted {
        /// Restrict-mode relationship.
        relationship: String,
        /// Model holding the blocking dependents.
        blocking_model: String,
    },

    /// Traversal exceeded the bounded depth limit.
    #[error("relationship traversal exceeded depth limit {0}")]
    DepthExceeded(usize),
}

/// Tenant and project boundary errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenancyError {
    /// The tenant does not exist.
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    /// A tenant with this id already exists.
    #[error("tenant '{0}' already exists")]
    DuplicateTenant(String),

    /// The tenant is suspended and refuses configuration and run requests.
    #[error("tenant '{0}' is suspended")]
    TenantSuspended(String),

    /// The project does not exist within the tenant.
    #[error("unknown project: {0}")]
    UnknownProject(String),

    /// A project with this name already exists within the tenant.
    #[error("project name '{name}' already used in tenant '{tenant}'")]
    DuplicateProjectName {
        /// Owning tenant.
        tenant: String,
        /// Conflicting project name.
        name: String,
    },

    /// Directory persistence failure.
    #[error("tenancy storage error: {0}")]
    Storage(String),
}

/// Policy configuration errors. Evaluation itself never fails; an unmatched
/// mutation is denied, not errored.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The named policy set does not exist.
    #[error("unknown policy set: {0}")]
    UnknownSet(String),

    /// The policy set is scoped to a different workflow or step.
    #[error("policy set '{set}' does not apply to workflow '{workflow}'")]
    NotApplicable {
        /// Policy set id.
        set: String,
        /// Workflow that tried to use it.
        workflow: String,
    },
}

/// Document store conditions, distinguishable per the store contract.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("document not found: {collection}/{id}")]
    NotFound {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },

    /// A concurrent mutation won the conditional update.
    #[error("version conflict on {collection}/{id}")]
    Conflict {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },

    /// The store did not answer within the caller's deadline, or is down.
    /// Treated like a conflict by the workflow engine: compensate, then
    /// retry the whole run with bounded backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Backend(#[from] sled::Error),

    /// A stored document failed to encode or decode.
    #[error("document codec error: {0}")]
    Codec(String),
}

/// Workflow run lifecycle errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    /// The run does not exist.
    #[error("unknown workflow run: {0}")]
    UnknownRun(String),

    /// The workflow definition does not exist.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The requested state change is not a legal transition.
    #[error("illegal run transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Resume was called on a run that is not awaiting approval.
    #[error("run '{0}' is not awaiting approval")]
    NotAwaitingApproval(String),

    /// The run input does not line up with the workflow's steps.
    #[error("run input invalid: {0}")]
    BadInput(String),
}
