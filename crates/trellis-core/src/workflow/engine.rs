//! Workflow execution engine.
//!
//! Drives runs through the state machine: per step, evaluate policy,
//! validate the payload, check relationship constraints for deletes, then
//! apply the mutation as a conditional update. Any schema, graph, or
//! conflict failure rolls previously succeeded steps back in reverse order
//! from their recorded pre-images. Steps execute strictly sequentially
//! within one run; ordering across runs touching the same document is
//! serialized by the store's conditional updates, not by this engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sled::Db;
use tracing::{debug, info, warn};
use trellis_proto::{FieldValue, Mutation, MutationKind, Value};

use super::def::{WorkflowDef, WorkflowStore};
use super::run::{
    AuditEvent, PreImageEntry, RunFailure, RunInput, RunState, StepPreImage, StepStatus,
    WorkflowRun,
};
use super::runs::RunStore;
use crate::catalog::{InstanceValidator, ModelDef, SchemaRegistry};
use crate::context::RequestContext;
use crate::error::{Error, PolicyError, RunError, SchemaError, StoreError};
use crate::graph::RelationGraph;
use crate::policy::{Decision, MutationContext, PolicyEvaluator, PolicyStore};
use crate::store::{collection_name, Deadline, Document, DocumentStore};
use crate::tenancy::TenantDirectory;

/// Bounded backoff for run-level retries after store unavailability.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before attempt N is `base_delay * 2^(N-1)`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline applied to each store call.
    pub store_timeout: Duration,
    /// Run-level retry policy for transient store unavailability.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// How a pass over the remaining steps ended.
enum StepFlow {
    /// Every step committed.
    Completed,
    /// Halted by a require-approval decision.
    AwaitingApproval,
    /// A policy denied the step.
    Denied { step: usize },
    /// A cancellation flag was observed between steps.
    Cancelled,
}

/// What one applied step committed.
struct AppliedStep {
    document_id: String,
    version: u64,
}

/// The workflow engine and its collaborators.
pub struct WorkflowEngine {
    registry: SchemaRegistry,
    graph: RelationGraph,
    policies: PolicyStore,
    workflows: WorkflowStore,
    runs: RunStore,
    tenancy: TenantDirectory,
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    cancel_flags: DashMap<String, Arc<AtomicBool>>,
}

impl WorkflowEngine {
    /// Open the engine's configuration stores on `db` and mutate instances
    /// through `store`.
    pub fn open(
        db: &Db,
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
    ) -> Result<Self, Error> {
        Ok(Self {
            registry: SchemaRegistry::open(db)?,
            graph: RelationGraph::open(db)?,
            policies: PolicyStore::open(db)?,
            workflows: WorkflowStore::open(db)?,
            runs: RunStore::open(db)?,
            tenancy: TenantDirectory::open(db)?,
            store,
            config,
            cancel_flags: DashMap::new(),
        })
    }

    /// The schema registry.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// The relationship graph.
    pub fn graph(&self) -> &RelationGraph {
        &self.graph
    }

    /// The policy store.
    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    /// The workflow definition store.
    pub fn workflows(&self) -> &WorkflowStore {
        &self.workflows
    }

    /// The tenant/project directory.
    pub fn tenancy(&self) -> &TenantDirectory {
        &self.tenancy
    }

    /// The document store.
    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.store_timeout)
    }

    /// Register a workflow after checking that every step names an existing
    /// model and an applicable policy set.
    pub fn register_workflow(&self, ctx: &RequestContext, def: WorkflowDef) -> Result<(), Error> {
        self.tenancy.ensure_active(ctx)?;
        self.tenancy.get_project(ctx, &def.project_id)?;

        for step in &def.steps {
            self.registry.get_model(&def.project_id, &step.model)?;
            let set = self
                .policies
                .get_set(&def.project_id, &step.policy_set)?
                .ok_or_else(|| PolicyError::UnknownSet(step.policy_set.clone()))?;
            if !set.applies(&def.id, &step.name) {
                return Err(PolicyError::NotApplicable {
                    set: step.policy_set.clone(),
                    workflow: def.id.clone(),
                }
                .into());
            }
        }

        self.workflows.put_def(&def)
    }

    /// Start a run and drive it until it reaches a stopping point:
    /// `Succeeded`, `Failed`, `Compensated`, or `AwaitingApproval`.
    pub fn start(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        workflow_id: &str,
        input: RunInput,
    ) -> Result<WorkflowRun, Error> {
        self.tenancy.ensure_active(ctx)?;
        self.tenancy.get_project(ctx, project_id)?;

        let def = self
            .workflows
            .get_def(project_id, workflow_id)?
            .ok_or_else(|| RunError::UnknownWorkflow(workflow_id.to_string()))?;
        if input.steps.len() != def.steps.len() {
            return Err(RunError::BadInput(format!(
                "workflow has {} steps, input supplies {}",
                def.steps.len(),
                input.steps.len()
            ))
            .into());
        }

        let mut run = WorkflowRun::new(ctx, &def, input);
        run.record(ctx, None, AuditEvent::RunStarted);
        info!(run = %run.id, workflow = workflow_id, "run started");

        let run_id = run.id.clone();
        self.cancel_flags
            .insert(run_id.clone(), Arc::new(AtomicBool::new(false)));
        run.transition(RunState::Running)?;
        self.runs.put(&run)?;

        let result = self.drive(ctx, run, &def);
        self.cancel_flags.remove(&run_id);
        result
    }

    /// Resume an `AwaitingApproval` run; the approval stands in for the
    /// halted step's policy evaluation.
    pub fn resume(&self, ctx: &RequestContext, run_id: &str) -> Result<WorkflowRun, Error> {
        self.tenancy.ensure_active(ctx)?;
        let mut run = self.load_run(ctx, run_id)?;
        if run.state != RunState::AwaitingApproval {
            return Err(RunError::NotAwaitingApproval(run_id.to_string()).into());
        }
        let def = self
            .workflows
            .get_def(&run.project_id, &run.workflow_id)?
            .ok_or_else(|| RunError::UnknownWorkflow(run.workflow_id.clone()))?;

        run.approved_step = Some(run.current_step);
        run.record(ctx, Some(run.current_step), AuditEvent::Resumed);
        run.transition(RunState::Running)?;
        self.runs.put(&run)?;

        let run_id = run.id.clone();
        self.cancel_flags
            .insert(run_id.clone(), Arc::new(AtomicBool::new(false)));
        let result = self.drive(ctx, run, &def);
        self.cancel_flags.remove(&run_id);
        result
    }

    /// Cancel a run. An actively executing run is flagged and compensates
    /// between steps; a parked run compensates immediately. Single steps are
    /// never interrupted mid-flight.
    pub fn cancel(&self, ctx: &RequestContext, run_id: &str) -> Result<Option<WorkflowRun>, Error> {
        if let Some(flag) = self.cancel_flags.get(run_id) {
            flag.store(true, Ordering::SeqCst);
            return Ok(None);
        }

        let mut run = self.load_run(ctx, run_id)?;
        if run.state.is_terminal() {
            return Err(RunError::InvalidTransition {
                from: run.state.name().to_string(),
                to: RunState::Compensating.name().to_string(),
            }
            .into());
        }

        run.record(ctx, None, AuditEvent::Cancelled);
        if self.compensate(ctx, &mut run)? {
            run.transition(RunState::Compensated)?;
        }
        self.runs.put(&run)?;
        Ok(Some(run))
    }

    /// Fetch a run, scoped to the context's tenant.
    pub fn get_run(&self, ctx: &RequestContext, run_id: &str) -> Result<WorkflowRun, Error> {
        self.load_run(ctx, run_id)
    }

    /// Apply a single non-workflow mutation: validate, check relationship
    /// constraints, commit. Returns the committed document for writes.
    pub fn apply_mutation(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        mutation: Mutation,
    ) -> Result<Option<Document>, Error> {
        self.tenancy.ensure_active(ctx)?;
        self.tenancy.get_project(ctx, project_id)?;

        let deadline = self.deadline();
        let model = self.registry.get_model(project_id, mutation.model())?;
        let collection = collection_name(project_id, &model.name);
        let validator = InstanceValidator::new(&self.registry, &self.graph, self.store.as_ref());

        match mutation {
            Mutation::Create { data, .. } => {
                let fields = validator.validate_against(&model, &data, deadline)?;
                let id = uuid::Uuid::new_v4().to_string();
                let doc = self
                    .store
                    .create(&collection, Document::new(id, fields), deadline)?;
                Ok(Some(doc))
            }
            Mutation::Update { id, data, .. } => {
                let current = self.store.get(&collection, &id, deadline)?;
                let fields = validator.validate_against(&model, &data, deadline)?;
                let patch = fields_to_payload(&fields);
                let doc = self
                    .store
                    .update(&collection, &id, &patch, current.version, deadline)?;
                Ok(Some(doc))
            }
            Mutation::Transform { id, data, .. } => {
                let current = self.store.get(&collection, &id, deadline)?;
                let merged = merge_payload(&current.fields, &data);
                let fields = validator.validate_against(&model, &merged, deadline)?;
                let patch = fields_to_payload(&fields);
                let doc = self
                    .store
                    .update(&collection, &id, &patch, current.version, deadline)?;
                Ok(Some(doc))
            }
            Mutation::Delete { id, .. } => {
                let plan = self.graph.check_delete(
                    self.store.as_ref(),
                    project_id,
                    &model.name,
                    &id,
                    deadline,
                )?;
                for planned in &plan.deletes {
                    let coll = collection_name(project_id, &planned.model);
                    self.store.delete(
                        &coll,
                        &planned.document_id,
                        planned.expected_version,
                        deadline,
                    )?;
                }
                Ok(None)
            }
        }
    }

    fn load_run(&self, ctx: &RequestContext, run_id: &str) -> Result<WorkflowRun, Error> {
        let run = self
            .runs
            .get(run_id)?
            .ok_or_else(|| RunError::UnknownRun(run_id.to_string()))?;
        if run.tenant_id != ctx.tenant_id {
            return Err(RunError::UnknownRun(run_id.to_string()).into());
        }
        Ok(run)
    }

    fn is_cancelled(&self, run_id: &str) -> bool {
        self.cancel_flags
            .get(run_id)
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }

    /// Drive a running run to a stopping point, handling compensation and
    /// run-level retries.
    fn drive(
        &self,
        ctx: &RequestContext,
        mut run: WorkflowRun,
        def: &WorkflowDef,
    ) -> Result<WorkflowRun, Error> {
        loop {
            match self.run_steps(ctx, &mut run, def) {
                Ok(StepFlow::Completed) => {
                    run.transition(RunState::Succeeded)?;
                    self.runs.put(&run)?;
                    info!(run = %run.id, "run succeeded");
                    return Ok(run);
                }
                Ok(StepFlow::AwaitingApproval) => {
                    self.runs.put(&run)?;
                    info!(run = %run.id, step = run.current_step, "run awaiting approval");
                    return Ok(run);
                }
                Ok(StepFlow::Cancelled) => {
                    run.record(ctx, None, AuditEvent::Cancelled);
                    if self.compensate(ctx, &mut run)? {
                        run.transition(RunState::Compensated)?;
                    }
                    self.runs.put(&run)?;
                    return Ok(run);
                }
                Ok(StepFlow::Denied { step }) => {
                    if self.compensate(ctx, &mut run)? {
                        run.failure = Some(RunFailure::PolicyDenied { step });
                        run.transition(RunState::Failed)?;
                    }
                    self.runs.put(&run)?;
                    return Ok(run);
                }
                Err(Error::Store(StoreError::Unavailable(reason))) => {
                    warn!(run = %run.id, %reason, "store unavailable, compensating");
                    run.record(
                        ctx,
                        Some(run.current_step),
                        AuditEvent::StepFailed {
                            reason: format!("store unavailable: {}", reason),
                        },
                    );
                    if !self.compensate(ctx, &mut run)? {
                        self.runs.put(&run)?;
                        return Ok(run);
                    }
                    if run.attempt + 1 >= self.config.retry.max_attempts {
                        run.failure = Some(RunFailure::RetriesExhausted {
                            attempts: run.attempt + 1,
                        });
                        run.transition(RunState::Compensated)?;
                        self.runs.put(&run)?;
                        return Ok(run);
                    }

                    let delay = self.config.retry.base_delay * 2u32.pow(run.attempt);
                    run.attempt += 1;
                    run.record(
                        ctx,
                        None,
                        AuditEvent::RetryScheduled {
                            attempt: run.attempt,
                            delay_ms: delay.as_millis() as u64,
                        },
                    );
                    run.reset_steps();
                    run.transition(RunState::Running)?;
                    self.runs.put(&run)?;
                    std::thread::sleep(delay);
                }
                Err(err) if err.triggers_compensation() => {
                    debug!(run = %run.id, step = run.current_step, %err, "step failed, compensating");
                    run.steps[run.current_step].status = StepStatus::Failed;
                    run.record(
                        ctx,
                        Some(run.current_step),
                        AuditEvent::StepFailed {
                            reason: err.to_string(),
                        },
                    );
                    if self.compensate(ctx, &mut run)? {
                        run.transition(RunState::Compensated)?;
                    }
                    self.runs.put(&run)?;
                    return Ok(run);
                }
                Err(err) => {
                    // Configuration and tenancy errors surface unchanged;
                    // nothing was applied for this step.
                    self.runs.put(&run)?;
                    return Err(err);
                }
            }
        }
    }

    /// Execute steps from the run's current index.
    fn run_steps(
        &self,
        ctx: &RequestContext,
        run: &mut WorkflowRun,
        def: &WorkflowDef,
    ) -> Result<StepFlow, Error> {
        while run.current_step < def.steps.len() {
            if self.is_cancelled(&run.id) {
                return Ok(StepFlow::Cancelled);
            }

            let i = run.current_step;
            let step = def.steps[i].clone();
            let input = run.input.steps[i].clone();
            run.steps[i].status = StepStatus::Running;

            let deadline = self.deadline();
            let collection = collection_name(&def.project_id, &step.model);
            let model = self.registry.get_model(&def.project_id, &step.model)?;

            // Resolve bindings against earlier steps' results.
            let mut data = input.data.clone();
            for binding in &input.bindings {
                let source = run
                    .steps
                    .get(binding.from_step)
                    .and_then(|s| s.result_document.clone())
                    .ok_or_else(|| {
                        RunError::BadInput(format!(
                            "binding for '{}' names step {} which produced no document",
                            binding.field, binding.from_step
                        ))
                    })?;
                data.push(FieldValue::new(binding.field.clone(), source));
            }
            let target_id = match input.target_from_step {
                Some(from) => Some(
                    run.steps
                        .get(from)
                        .and_then(|s| s.result_document.clone())
                        .ok_or_else(|| {
                            RunError::BadInput(format!(
                                "step '{}' targets step {} which produced no document",
                                step.name, from
                            ))
                        })?,
                ),
                None => input.document_id.clone(),
            };

            // Field values the policy judges: the payload for creates and
            // updates, the merged or current document for transforms and
            // deletes.
            let context_fields: BTreeMap<String, Value> = match step.operation {
                MutationKind::Create | MutationKind::Update => payload_to_fields(&data),
                MutationKind::Transform | MutationKind::Delete => {
                    let id = target_id.as_deref().ok_or_else(|| {
                        RunError::BadInput(format!("step '{}' needs a target document", step.name))
                    })?;
                    let current = self.store.get(&collection, id, deadline)?;
                    let mut merged = current.fields;
                    for fv in &data {
                        merged.insert(fv.field.clone(), fv.value.clone());
                    }
                    merged
                }
            };

            // Evaluate policy unless an operator already approved this step.
            let mut redactions = Vec::new();
            if run.approved_step != Some(i) {
                let set = self
                    .policies
                    .get_set(&def.project_id, &step.policy_set)?
                    .ok_or_else(|| PolicyError::UnknownSet(step.policy_set.clone()))?;
                if !set.applies(&def.id, &step.name) {
                    return Err(PolicyError::NotApplicable {
                        set: step.policy_set.clone(),
                        workflow: def.id.clone(),
                    }
                    .into());
                }

                let decision = PolicyEvaluator::evaluate(
                    &set,
                    &MutationContext {
                        model: &model,
                        kind: step.operation,
                        fields: &context_fields,
                    },
                );
                run.record(
                    ctx,
                    Some(i),
                    AuditEvent::PolicyDecision {
                        policy_set: step.policy_set.clone(),
                        decision: decision.clone(),
                    },
                );

                match decision {
                    Decision::Deny { .. } => {
                        run.steps[i].status = StepStatus::Failed;
                        return Ok(StepFlow::Denied { step: i });
                    }
                    Decision::RequireApproval { .. } => {
                        run.steps[i].status = StepStatus::Pending;
                        run.transition(RunState::AwaitingApproval)?;
                        return Ok(StepFlow::AwaitingApproval);
                    }
                    Decision::Redact { fields, .. } => redactions = fields,
                    Decision::Allow { .. } => {}
                }
            }

            // Null out redacted fields before validation. Redacting a
            // required field is a policy/model configuration error.
            for path in &redactions {
                if let Some(field) = model.get_field(path) {
                    if field.required {
                        return Err(SchemaError::RequiredFieldRedacted(path.clone()).into());
                    }
                }
                match data.iter_mut().find(|fv| fv.field == *path) {
                    Some(fv) => fv.value = Value::Null,
                    None => data.push(FieldValue::new(path.clone(), Value::Null)),
                }
            }

            let applied =
                self.apply_step(ctx, run, def, i, &step, &model, &collection, target_id, data)?;
            run.steps[i].result_document = Some(applied.document_id.clone());
            run.record(
                ctx,
                Some(i),
                AuditEvent::MutationApplied {
                    model: step.model.clone(),
                    document_id: applied.document_id,
                    version: applied.version,
                },
            );

            run.steps[i].status = StepStatus::Succeeded;
            run.approved_step = None;
            run.current_step = i + 1;
            self.runs.put(run)?;
        }

        Ok(StepFlow::Completed)
    }

    /// Validate and commit one step's mutation, capturing its pre-image
    /// first.
    #[allow(clippy::too_many_arguments)]
    fn apply_step(
        &self,
        ctx: &RequestContext,
        run: &mut WorkflowRun,
        def: &WorkflowDef,
        index: usize,
        step: &super::def::StepDef,
        model: &ModelDef,
        collection: &str,
        target_id: Option<String>,
        data: Vec<FieldValue>,
    ) -> Result<AppliedStep, Error> {
        let deadline = self.deadline();
        let validator = InstanceValidator::new(&self.registry, &self.graph, self.store.as_ref());

        match step.operation {
            MutationKind::Create => {
                let fields = validator.validate_against(model, &data, deadline)?;
                let id = target_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

                self.capture_pre_image(
                    ctx,
                    run,
                    index,
                    MutationKind::Create,
                    vec![PreImageEntry {
                        model: step.model.clone(),
                        document_id: id.clone(),
                        fields: None,
                        restore_expected_version: 1,
                    }],
                )?;

                let doc = self
                    .store
                    .create(collection, Document::new(id, fields), deadline)?;
                Ok(AppliedStep {
                    document_id: doc.id,
                    version: doc.version,
                })
            }
            MutationKind::Update | MutationKind::Transform => {
                let id = target_id.ok_or_else(|| {
                    RunError::BadInput(format!("step '{}' needs a target document", step.name))
                })?;
                let current = self.store.get(collection, &id, deadline)?;

                let full_payload = if step.operation == MutationKind::Update {
                    data
                } else {
                    merge_payload(&current.fields, &data)
                };
                let fields = validator.validate_against(model, &full_payload, deadline)?;

                self.capture_pre_image(
                    ctx,
                    run,
                    index,
                    step.operation,
                    vec![PreImageEntry {
                        model: step.model.clone(),
                        document_id: id.clone(),
                        fields: Some(current.fields.clone()),
                        restore_expected_version: current.version + 1,
                    }],
                )?;

                let patch = fields_to_payload(&fields);
                let doc = self
                    .store
                    .update(collection, &id, &patch, current.version, deadline)?;
                Ok(AppliedStep {
                    document_id: doc.id,
                    version: doc.version,
                })
            }
            MutationKind::Delete => {
                let id = target_id.ok_or_else(|| {
                    RunError::BadInput(format!("step '{}' needs a target document", step.name))
                })?;
                let plan = self.graph.check_delete(
                    self.store.as_ref(),
                    &def.project_id,
                    &step.model,
                    &id,
                    deadline,
                )?;

                // Re-read each planned document and re-validate its version
                // immediately before committing; a mismatch aborts as a
                // conflict rather than deleting newer state.
                let mut entries = Vec::with_capacity(plan.len());
                for planned in &plan.deletes {
                    let coll = collection_name(&def.project_id, &planned.model);
                    let doc = self.store.get(&coll, &planned.document_id, deadline)?;
                    if doc.version != planned.expected_version {
                        return Err(StoreError::Conflict {
                            collection: coll,
                            id: planned.document_id.clone(),
                        }
                        .into());
                    }
                    entries.push(PreImageEntry {
                        model: planned.model.clone(),
                        document_id: planned.document_id.clone(),
                        fields: Some(doc.fields),
                        restore_expected_version: planned.expected_version,
                    });
                }
                self.capture_pre_image(ctx, run, index, MutationKind::Delete, entries)?;

                let mut last_version = 0;
                for planned in &plan.deletes {
                    let coll = collection_name(&def.project_id, &planned.model);
                    let doc = self.store.delete(
                        &coll,
                        &planned.document_id,
                        planned.expected_version,
                        deadline,
                    )?;
                    last_version = doc.version;
                }
                Ok(AppliedStep {
                    document_id: id,
                    version: last_version,
                })
            }
        }
    }

    /// Record and persist a step's pre-image before its mutation commits.
    fn capture_pre_image(
        &self,
        ctx: &RequestContext,
        run: &mut WorkflowRun,
        index: usize,
        kind: MutationKind,
        entries: Vec<PreImageEntry>,
    ) -> Result<(), Error> {
        let pre = StepPreImage::capture(kind, entries);
        run.record(
            ctx,
            Some(index),
            AuditEvent::PreImageCaptured {
                model: pre
                    .entries
                    .first()
                    .map(|e| e.model.clone())
                    .unwrap_or_default(),
                documents: pre.entries.len(),
                checksum: pre.checksum.clone(),
            },
        );
        run.steps[index].pre_image = Some(pre);
        self.runs.put(run)
    }

    /// Roll back applied mutations in reverse step order from recorded
    /// pre-images. Returns `true` when rollback completed; on any rollback
    /// failure the run is marked `Failed` with `CompensationFailed` and
    /// `false` is returned. Never retried automatically.
    fn compensate(&self, ctx: &RequestContext, run: &mut WorkflowRun) -> Result<bool, Error> {
        if run.state != RunState::Compensating {
            run.transition(RunState::Compensating)?;
            self.runs.put(run)?;
        }

        for index in (0..run.steps.len()).rev() {
            let record = run.steps[index].clone();
            let pre = match &record.pre_image {
                Some(pre) => pre.clone(),
                None => continue,
            };
            // Only roll back work that actually committed: creates and
            // updates report a result document; deletes may have applied a
            // prefix of their plan before failing.
            let applied = record.result_document.is_some();
            if !applied && pre.kind != MutationKind::Delete {
                continue;
            }

            if !pre.verify() {
                return self.fail_compensation(ctx, run, index, "pre-image checksum mismatch");
            }

            let deadline = self.deadline();
            match pre.kind {
                MutationKind::Create => {
                    let entry = &pre.entries[0];
                    let coll = collection_name(&run.project_id, &entry.model);
                    if let Err(e) = self.store.delete(
                        &coll,
                        &entry.document_id,
                        entry.restore_expected_version,
                        deadline,
                    ) {
                        return self.fail_compensation(ctx, run, index, &e.to_string());
                    }
                }
                MutationKind::Update | MutationKind::Transform => {
                    let entry = &pre.entries[0];
                    let fields = match &entry.fields {
                        Some(fields) => fields,
                        None => {
                            return self.fail_compensation(ctx, run, index, "pre-image missing")
                        }
                    };
                    let coll = collection_name(&run.project_id, &entry.model);
                    let patch = fields_to_payload(fields);
                    if let Err(e) = self.store.update(
                        &coll,
                        &entry.document_id,
                        &patch,
                        entry.restore_expected_version,
                        deadline,
                    ) {
                        return self.fail_compensation(ctx, run, index, &e.to_string());
                    }
                }
                MutationKind::Delete => {
                    // Restore ancestors before dependents: reverse of the
                    // deletion order. Documents the failed step never
                    // deleted are left as they are.
                    for entry in pre.entries.iter().rev() {
                        let coll = collection_name(&run.project_id, &entry.model);
                        match self.store.get(&coll, &entry.document_id, deadline) {
                            Ok(_) => continue,
                            Err(StoreError::NotFound { .. }) => {
                                let fields = match &entry.fields {
                                    Some(fields) => fields.clone(),
                                    None => {
                                        return self.fail_compensation(
                                            ctx,
                                            run,
                                            index,
                                            "pre-image missing",
                                        )
                                    }
                                };
                                if let Err(e) = self.store.create(
                                    &coll,
                                    Document::new(entry.document_id.clone(), fields),
                                    deadline,
                                ) {
                                    return self.fail_compensation(ctx, run, index, &e.to_string());
                                }
                            }
                            Err(e) => {
                                return self.fail_compensation(ctx, run, index, &e.to_string())
                            }
                        }
                    }
                }
            }

            run.steps[index].status = StepStatus::Compensated;
            run.record(ctx, Some(index), AuditEvent::StepCompensated { step: index });
            self.runs.put(run)?;
        }

        Ok(true)
    }

    fn fail_compensation(
        &self,
        ctx: &RequestContext,
        run: &mut WorkflowRun,
        step: usize,
        reason: &str,
    ) -> Result<bool, Error> {
        warn!(run = %run.id, step, reason, "compensation failed, operator intervention required");
        run.failure = Some(RunFailure::CompensationFailed {
            step,
            reason: reason.to_string(),
        });
        run.record(
            ctx,
            Some(step),
            AuditEvent::StepFailed {
                reason: format!("compensation failed: {}", reason),
            },
        );
        run.transition(RunState::Failed)?;
        self.runs.put(run)?;
        Ok(false)
    }
}

/// Convert a field map into a payload vector.
fn fields_to_payload(fields: &BTreeMap<String, Value>) -> Vec<FieldValue> {
    fields
        .iter()
        .map(|(field, value)| FieldValue::new(field.clone(), value.clone()))
        .collect()
}

/// Convert a payload vector into a field map.
fn payload_to_fields(payload: &[FieldValue]) -> BTreeMap<String, Value> {
    payload
        .iter()
        .map(|fv| (fv.field.clone(), fv.value.clone()))
        .collect()
}

/// Merge a patch onto existing fields, yielding a full payload.
fn merge_payload(current: &BTreeMap<String, Value>, patch: &[FieldValue]) -> Vec<FieldValue> {
    let mut merged = current.clone();
    for fv in patch {
        merged.insert(fv.field.clone(), fv.value.clone());
    }
    fields_to_payload(&merged)
}
