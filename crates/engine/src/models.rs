//! Core domain models for the orchestration engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory. Step and trigger kinds are closed sum types carrying their own
//! config payloads, so adding a kind is a compiler-checked change everywhere
//! it is handled.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow status
// ---------------------------------------------------------------------------

/// Administrative lifecycle state of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Whether the transition `self -> to` is legal.
    ///
    /// Triggers are armed on entry to `Active` and disarmed on leaving it;
    /// a paused workflow can return to `Active`.
    pub fn can_transition(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Failed)
                | (Paused, Active)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential-backoff retry policy for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Multiplier applied per subsequent retry.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Backoff delay before retry number `retry` (0-based):
    /// `initial_delay * multiplier^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let millis =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The closed set of step kinds, each with its own config payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepKind {
    /// Dispatch `action` to an agent selected by `capability`.
    AgentTask {
        capability: String,
        action: String,
        #[serde(default)]
        params: Value,
    },
    /// Run every child concurrently; succeeds only if all children succeed.
    Parallel { children: Vec<WorkflowStep> },
    /// Run children one at a time, in declared order.
    Sequential { children: Vec<WorkflowStep> },
    /// Evaluate `predicate` via the external evaluator and run exactly one
    /// branch. A false predicate with no `if_false` is a no-op success.
    Conditional {
        predicate: String,
        if_true: Box<WorkflowStep>,
        #[serde(default)]
        if_false: Option<Box<WorkflowStep>>,
    },
    /// Run `body` once per item, with the scope extended by the item.
    Loop {
        items: Vec<Value>,
        body: Box<WorkflowStep>,
        #[serde(default)]
        continue_on_item_failure: bool,
    },
    /// One outbound HTTP call.
    Http {
        method: String,
        url: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    /// One sandboxed script invocation, delegated to the external runner.
    Script { source: String },
}

impl StepKind {
    /// Kinds that perform one external await (as opposed to composing
    /// child steps).
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            StepKind::AgentTask { .. } | StepKind::Http { .. } | StepKind::Script { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::AgentTask { .. } => "agent-task",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Sequential { .. } => "sequential",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Loop { .. } => "loop",
            StepKind::Http { .. } => "http",
            StepKind::Script { .. } => "script",
        }
    }
}

/// One node in a workflow's graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique identifier within this workflow (referenced by dependencies).
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Ids of top-level steps that must succeed before this one is eligible.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Max duration of one execution attempt.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl WorkflowStep {
    /// Immediate child steps nested inside this step's config.
    pub fn children(&self) -> Vec<&WorkflowStep> {
        match &self.kind {
            StepKind::Parallel { children } | StepKind::Sequential { children } => {
                children.iter().collect()
            }
            StepKind::Conditional {
                if_true, if_false, ..
            } => {
                let mut out = vec![if_true.as_ref()];
                if let Some(f) = if_false {
                    out.push(f.as_ref());
                }
                out
            }
            StepKind::Loop { body, .. } => vec![body.as_ref()],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// How a workflow run is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Started explicitly through the engine API; no standing resource.
    Manual,
    /// Started on a recurring interval.
    Schedule {
        interval_ms: u64,
        /// When set, a tick that would push the number of non-terminal runs
        /// past this limit is skipped (and logged), never queued.
        #[serde(default)]
        max_concurrent_runs: Option<u32>,
    },
    /// Started whenever the named event fires on the external event surface.
    Event { event: String },
    /// Started by an inbound webhook routed by `path`.
    Webhook { path: String },
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        steps: Vec<WorkflowStep>,
        triggers: Vec<TriggerConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description,
            status: WorkflowStatus::Draft,
            steps,
            triggers,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Run state of one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// One recorded failure within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StepFailure {
    pub fn new(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// One instantiation of a workflow's execution.
///
/// Owned by the run ledger; immutable once `status` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Step outputs keyed by step id; populated only for successful steps.
    #[serde(default)]
    pub results: HashMap<String, Value>,
    /// Failures in the order they were encountered.
    #[serde(default)]
    pub errors: Vec<StepFailure>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            results: HashMap::new(),
            errors: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Listing window. `limit` is clamped to `1..=100` (default 20).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
        }
    }
}

impl PageRequest {
    pub fn clamped_limit(&self) -> usize {
        self.limit.clamp(1, 100)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: usize,
    /// Offset of the next page, if any.
    pub next_offset: Option<usize>,
}

/// Slice an already-ordered collection into a page.
pub fn paginate<T>(all: Vec<T>, page: PageRequest) -> Page<T> {
    let total_count = all.len();
    let limit = page.clamped_limit();
    let items: Vec<T> = all.into_iter().skip(page.offset).take(limit).collect();
    let end = page.offset + items.len();
    let next_offset = (end < total_count && !items.is_empty()).then_some(end);
    Page {
        items,
        total_count,
        next_offset,
    }
}
