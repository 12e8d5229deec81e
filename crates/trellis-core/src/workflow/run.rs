//! Workflow run state, audit trail, and pre-images.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trellis_proto::{FieldValue, MutationKind, Value};

use super::def::WorkflowDef;
use crate::context::RequestContext;
use crate::error::RunError;
use crate::policy::Decision;

/// Run lifecycle state.
///
/// `Pending -> Running -> { Succeeded, Failed, AwaitingApproval,
/// Compensating -> Compensated }`. The step index only moves forward or
/// enters a terminal state; it regresses only through compensation, which is
/// also the path a run-level retry takes before re-entering `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Created, not yet executing.
    Pending,
    /// Executing steps sequentially.
    Running,
    /// Halted by a require-approval decision; resumed out-of-band.
    AwaitingApproval,
    /// Rolling back previously succeeded steps in reverse order.
    Compensating,
    /// Rollback finished; terminal.
    Compensated,
    /// Every step committed; terminal.
    Succeeded,
    /// Terminal failure; see the run's failure reason.
    Failed,
}

impl RunState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Compensated
        )
    }

    /// Legal state transitions.
    pub fn can_transition(&self, to: RunState) -> bool {
        matches!(
            (self, to),
            (RunState::Pending, RunState::Running)
                | (RunState::Pending, RunState::Compensating)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::AwaitingApproval)
                | (RunState::Running, RunState::Compensating)
                | (RunState::AwaitingApproval, RunState::Running)
                | (RunState::AwaitingApproval, RunState::Compensating)
                | (RunState::Compensating, RunState::Compensated)
                | (RunState::Compensating, RunState::Failed)
                | (RunState::Compensating, RunState::Running)
        )
    }

    /// State name for errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Pending => "Pending",
            RunState::Running => "Running",
            RunState::AwaitingApproval => "AwaitingApproval",
            RunState::Compensating => "Compensating",
            RunState::Compensated => "Compensated",
            RunState::Succeeded => "Succeeded",
            RunState::Failed => "Failed",
        }
    }
}

/// Why a run ended in `Failed`, or why a compensated run gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunFailure {
    /// A policy denied a step.
    PolicyDenied {
        /// Denied step index.
        step: usize,
    },
    /// Rollback could not complete; operator intervention required, never
    /// retried automatically.
    CompensationFailed {
        /// Step whose rollback failed.
        step: usize,
        /// What went wrong.
        reason: String,
    },
    /// The store stayed unavailable through every run-level retry.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Per-step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not reached yet.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Mutation committed.
    Succeeded,
    /// Step failed (policy deny or mid-apply error).
    Failed,
    /// Rolled back by compensation.
    Compensated,
}

/// The last-committed state of one document before a step mutated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreImageEntry {
    /// Model the document belongs to.
    pub model: String,
    /// Document id.
    pub document_id: String,
    /// Field values before the mutation; `None` when the document did not
    /// exist (create steps).
    pub fields: Option<BTreeMap<String, Value>>,
    /// Version the rollback write is conditional on.
    pub restore_expected_version: u64,
}

/// Pre-image for one step, captured before its mutation and consumed only by
/// the compensation path. The checksum detects corruption between capture
/// and rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPreImage {
    /// Operation the step performed.
    pub kind: MutationKind,
    /// One entry per document the step touched, in mutation order.
    pub entries: Vec<PreImageEntry>,
    /// Hex-encoded blake3 digest of the entries.
    pub checksum: String,
}

impl StepPreImage {
    /// Capture a pre-image, computing its checksum.
    pub fn capture(kind: MutationKind, entries: Vec<PreImageEntry>) -> Self {
        let checksum = Self::digest(&kind, &entries);
        Self {
            kind,
            entries,
            checksum,
        }
    }

    /// Whether the stored checksum still matches the entries.
    pub fn verify(&self) -> bool {
        Self::digest(&self.kind, &self.entries) == self.checksum
    }

    fn digest(kind: &MutationKind, entries: &[PreImageEntry]) -> String {
        let bytes = serde_json::to_vec(&(kind, entries)).unwrap_or_default();
        hex::encode(blake3::hash(&bytes).as_bytes())
    }
}

/// Execution record for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Execution status.
    pub status: StepStatus,
    /// Pre-image captured before the step's mutation.
    pub pre_image: Option<StepPreImage>,
    /// Document the step created or targeted, once known.
    pub result_document: Option<String>,
}

/// One audited engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    /// Run accepted and started.
    RunStarted,
    /// A policy set was evaluated.
    PolicyDecision {
        /// Evaluated set.
        policy_set: String,
        /// Outcome.
        decision: Decision,
    },
    /// A pre-image was captured ahead of a mutation.
    PreImageCaptured {
        /// Model touched.
        model: String,
        /// Documents covered.
        documents: usize,
        /// Pre-image checksum.
        checksum: String,
    },
    /// A mutation committed.
    MutationApplied {
        /// Model touched.
        model: String,
        /// Committed document.
        document_id: String,
        /// Committed version.
        version: u64,
    },
    /// A step failed mid-apply.
    StepFailed {
        /// Failure description.
        reason: String,
    },
    /// A step's mutation was rolled back.
    StepCompensated {
        /// Compensated step index.
        step: usize,
    },
    /// The run will retry after transient store unavailability.
    RetryScheduled {
        /// Attempt number about to start.
        attempt: u32,
        /// Backoff before it starts.
        delay_ms: u64,
    },
    /// The run was cancelled.
    Cancelled,
    /// An operator approved the halted step.
    Resumed,
}

/// One audit trail entry, stamped with the request context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event happened.
    pub at: DateTime<Utc>,
    /// Step the event belongs to, if any.
    pub step: Option<usize>,
    /// Acting principal.
    pub actor_id: String,
    /// Correlation id from the request context.
    pub correlation_id: String,
    /// What happened.
    pub event: AuditEvent,
}

/// Binds a payload field to the document produced by an earlier step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBinding {
    /// Field to fill in.
    pub field: String,
    /// Earlier step whose result document id is used.
    pub from_step: usize,
}

/// Input for one step of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    /// Explicit target document id (update/delete/transform), or the id to
    /// create with; a fresh id is generated when absent.
    pub document_id: Option<String>,
    /// Use the document produced by an earlier step as the target.
    pub target_from_step: Option<usize>,
    /// Field payload.
    pub data: Vec<FieldValue>,
    /// Fields filled from earlier steps' result documents.
    pub bindings: Vec<StepBinding>,
}

impl StepInput {
    /// Input carrying only a field payload.
    pub fn payload(data: Vec<FieldValue>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Set an explicit target document id.
    pub fn target(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Target the document produced by an earlier step.
    pub fn target_step(mut self, from_step: usize) -> Self {
        self.target_from_step = Some(from_step);
        self
    }

    /// Fill `field` with the id of the document an earlier step produced.
    pub fn bind(mut self, field: impl Into<String>, from_step: usize) -> Self {
        self.bindings.push(StepBinding {
            field: field.into(),
            from_step,
        });
        self
    }
}

/// Input for a whole run, one entry per workflow step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    /// Step inputs, aligned with the workflow's step order.
    pub steps: Vec<StepInput>,
}

impl RunInput {
    /// Build from per-step inputs.
    pub fn new(steps: Vec<StepInput>) -> Self {
        Self { steps }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run id.
    pub id: String,
    /// Executed workflow.
    pub workflow_id: String,
    /// Owning project.
    pub project_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Lifecycle state.
    pub state: RunState,
    /// Failure reason for `Failed` runs, or why a compensated run gave up.
    pub failure: Option<RunFailure>,
    /// Index of the next step to execute.
    pub current_step: usize,
    /// Run-level retry attempt counter.
    pub attempt: u32,
    /// Step approved via `resume`, exempt from one re-evaluation.
    pub approved_step: Option<usize>,
    /// The input the run was started with; kept for resume and retry.
    pub input: RunInput,
    /// Per-step execution records.
    pub steps: Vec<StepRecord>,
    /// Audit trail of every decision and mutation.
    pub audit: Vec<AuditEntry>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Create a pending run for a workflow definition.
    pub fn new(ctx: &RequestContext, def: &WorkflowDef, input: RunInput) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: def.id.clone(),
            project_id: def.project_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            state: RunState::Pending,
            failure: None,
            current_step: 0,
            attempt: 0,
            approved_step: None,
            input,
            steps: vec![StepRecord::default(); def.steps.len()],
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new state, refusing illegal transitions.
    pub fn transition(&mut self, to: RunState) -> Result<(), RunError> {
        if !self.state.can_transition(to) {
            return Err(RunError::InvalidTransition {
                from: self.state.name().to_string(),
                to: to.name().to_string(),
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append an audit entry stamped with the request context.
    pub fn record(&mut self, ctx: &RequestContext, step: Option<usize>, event: AuditEvent) {
        self.audit.push(AuditEntry {
            at: Utc::now(),
            step,
            actor_id: ctx.actor_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            event,
        });
    }

    /// Reset step records for a fresh run-level retry attempt.
    pub fn reset_steps(&mut self) {
        for step in &mut self.steps {
            *step = StepRecord::default();
        }
        self.current_step = 0;
        self.approved_step = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::def::StepDef;

    fn sample_run() -> WorkflowRun {
        let ctx = RequestContext::new("acme", "alice");
        let def = WorkflowDef::new("wf", "proj-1").with_step(StepDef::new(
            "s0",
            "Order",
            MutationKind::Create,
            "default",
        ));
        WorkflowRun::new(&ctx, &def, RunInput::new(vec![StepInput::default()]))
    }

    #[test]
    fn test_legal_transitions() {
        let mut run = sample_run();
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::AwaitingApproval).unwrap();
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Compensating).unwrap();
        run.transition(RunState::Compensated).unwrap();
        assert!(run.state.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_refused() {
        let mut run = sample_run();
        // Cannot succeed without running.
        assert!(run.transition(RunState::Succeeded).is_err());

        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Succeeded).unwrap();
        // Terminal states accept nothing.
        let err = run.transition(RunState::Running).unwrap_err();
        assert!(matches!(err, RunError::InvalidTransition { .. }));
    }

    #[test]
    fn test_retry_reenters_running_through_compensating() {
        let mut run = sample_run();
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Compensating).unwrap();
        run.transition(RunState::Running).unwrap();
        assert_eq!(run.state, RunState::Running);
    }

    #[test]
    fn test_pre_image_checksum_detects_corruption() {
        let mut fields = BTreeMap::new();
        fields.insert("total".to_string(), Value::Int(5));

        let mut pre = StepPreImage::capture(
            MutationKind::Update,
            vec![PreImageEntry {
                model: "Order".into(),
                document_id: "ord-1".into(),
                fields: Some(fields),
                restore_expected_version: 2,
            }],
        );
        assert!(pre.verify());

        pre.entries[0].restore_expected_version = 9;
        assert!(!pre.verify());
    }

    #[test]
    fn test_reset_steps_clears_records() {
        let mut run = sample_run();
        run.steps[0].status = StepStatus::Succeeded;
        run.steps[0].result_document = Some("doc".into());
        run.current_step = 1;

        run.reset_steps();
        assert_eq!(run.steps[0], StepRecord::default());
        assert_eq!(run.current_step, 0);
    }
}
