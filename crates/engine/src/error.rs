//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use agents::{CallError, DispatchError, EvalError};

use crate::models::WorkflowStatus;

/// Errors produced by the engine's public surface: validation, workflow
/// lifecycle, and run scheduling.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors (definition rejected, never stored) ------

    /// Two or more steps share the same id.
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// A step's dependency references an id that is not a top-level step.
    #[error("step '{step_id}' depends on unknown step '{missing}'")]
    DanglingDependency { step_id: String, missing: String },

    /// A nested child step declared dependencies; gating exists only at the
    /// top level.
    #[error("nested step '{step_id}' must not declare dependencies")]
    NestedDependencies { step_id: String },

    /// The dependency graph contains a cycle.
    #[error("workflow graph contains a cycle: {}", steps.join(" -> "))]
    CycleDetected { steps: Vec<String> },

    // ------ Lifecycle errors ------

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    /// Illegal workflow status transition.
    #[error("workflow {workflow_id}: cannot transition {from:?} -> {to:?}")]
    InvalidTransition {
        workflow_id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    /// Manual start requested for a workflow whose status forbids it.
    #[error("workflow {workflow_id} is {status:?} and cannot be started")]
    NotStartable {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    /// No webhook trigger is armed for this path.
    #[error("no armed webhook for path '{0}'")]
    UnknownWebhook(String),

    // ------ Scheduler errors ------

    /// No remaining step is eligible yet not all steps completed. Always
    /// fatal to the run, never retried.
    #[error("workflow is stuck; unreached steps: {}", unreached.join(", "))]
    Stuck { unreached: Vec<String> },
}

/// Errors produced by one step execution attempt.
///
/// The executor uses [`StepError::is_retryable`] to decide whether the
/// step's retry policy applies: timeouts and collaborator call failures are
/// transient, everything else fails the step immediately.
#[derive(Debug, Error)]
pub enum StepError {
    /// Agent dispatch failed.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The attempt exceeded the step's timeout.
    #[error("step timed out after {0}ms")]
    Timeout(u64),

    /// Outbound HTTP call failed.
    #[error("http call failed: {0}")]
    Http(#[source] CallError),

    /// Sandboxed script invocation failed.
    #[error("script failed: {0}")]
    Script(#[source] CallError),

    /// Predicate evaluation failed; a definition problem, not transient.
    #[error(transparent)]
    Expression(#[from] EvalError),

    /// A nested child step failed terminally (after its own retries).
    #[error("child step '{step_id}' failed: {source}")]
    Child {
        step_id: String,
        #[source]
        source: Box<StepError>,
    },

    /// The run's cancellation flag was observed.
    #[error("step cancelled")]
    Cancelled,

    /// A spawned child task could not be joined.
    #[error("task join error: {0}")]
    Join(String),
}

impl StepError {
    /// Whether this attempt's failure is transient enough to retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Dispatch(e) => e.is_retryable(),
            StepError::Timeout(_) | StepError::Http(_) | StepError::Script(_) => true,
            StepError::Expression(_)
            | StepError::Child { .. }
            | StepError::Cancelled
            | StepError::Join(_) => false,
        }
    }
}
