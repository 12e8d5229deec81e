//! Trellis Core - Schema, relationship, policy, and workflow consistency engine.
//!
//! This crate provides the multi-tenant consistency engine for Trellis:
//! validating tenant-defined data-model schemas, enforcing referential
//! integrity across declared relationships, evaluating ordered policy rules
//! against every mutation, and executing multi-step workflows with
//! pre-image-based compensation.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod catalog;
pub mod context;
pub mod error;
pub mod graph;
pub mod policy;
pub mod store;
pub mod tenancy;
pub mod workflow;

pub use catalog::{
    Cardinality, FieldChange, FieldDef, FieldKind, InstanceValidator, ModelDef, SchemaRegistry,
    StringConstraints,
};
pub use context::RequestContext;
pub use error::{
    Error, GraphError, PolicyError, RunError, SchemaError, StoreError, TenancyError,
};
pub use graph::{DeletionPlan, IntegrityMode, PlannedDelete, RelationDef, RelationGraph};
pub use policy::{
    AppliesTo, Decision, Effect, MutationContext, PolicyEvaluator, PolicySet, PolicyStore,
    Predicate, Rule,
};
pub use store::{collection_name, Deadline, Document, DocumentStore, SledStore};
pub use tenancy::{Project, ProjectStatus, Tenant, TenantDirectory, TenantStatus};
pub use workflow::{
    AuditEntry, AuditEvent, EngineConfig, RetryPolicy, RunFailure, RunInput, RunState, RunStore,
    StepDef, StepInput, StepStatus, WorkflowDef, WorkflowEngine, WorkflowRun, WorkflowStore,
};

/// Re-export shared types.
pub use trellis_proto as proto;
