//! Per-run execution state.
//!
//! Each run owns exactly one [`ExecutionContext`]; concurrent runs of the
//! same workflow never share state. Spawned step tasks receive a
//! [`StepScope`] — an owned snapshot of the context plus the run's
//! cancellation token — so the scheduler keeps single-writer discipline over
//! the context itself.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state of one workflow run, owned by the scheduler driving it.
#[derive(Debug)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    /// Input parameters the run was started with.
    pub params: Value,
    results: HashMap<String, Value>,
    completed: HashSet<String>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        workflow_id: Uuid,
        params: Value,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            params,
            results: HashMap::new(),
            completed: HashSet::new(),
            cancel,
        }
    }

    /// Record a step's successful output.
    pub fn record_success(&mut self, step_id: &str, output: Value) {
        self.results.insert(step_id.to_string(), output);
        self.completed.insert(step_id.to_string());
    }

    /// Whether `step_id` has completed with a successful result.
    pub fn succeeded(&self, step_id: &str) -> bool {
        self.completed.contains(step_id)
    }

    /// Number of successfully completed steps.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn results(&self) -> &HashMap<String, Value> {
        &self.results
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Owned snapshot handed to a spawned step task.
    pub fn scope(&self) -> StepScope {
        StepScope {
            run_id: self.run_id,
            workflow_id: self.workflow_id,
            params: self.params.clone(),
            results: self.results.clone(),
            item: None,
            cancel: self.cancel.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepScope
// ---------------------------------------------------------------------------

/// Read-mostly view of the run a single step executes against.
///
/// Sequential composites extend their local copy with each child's output;
/// loops extend it with the current item. Mutations never flow back into the
/// run's [`ExecutionContext`] — only the scheduler writes there.
#[derive(Debug, Clone)]
pub struct StepScope {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub params: Value,
    results: HashMap<String, Value>,
    item: Option<Value>,
    cancel: CancellationToken,
}

impl StepScope {
    /// A copy of this scope with the loop item set.
    pub fn with_item(&self, item: Value) -> Self {
        let mut scope = self.clone();
        scope.item = Some(item);
        scope
    }

    /// Record a child step's output locally (sequential composites).
    pub fn record_local(&mut self, step_id: &str, output: Value) {
        self.results.insert(step_id.to_string(), output);
    }

    pub fn result(&self, step_id: &str) -> Option<&Value> {
        self.results.get(step_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The JSON view handed to the expression evaluator and script sandbox:
    /// `{ "params": ..., "results": ..., "item": ... }`.
    pub fn eval_context(&self) -> Value {
        json!({
            "params": self.params,
            "results": self.results,
            "item": self.item.clone().unwrap_or(Value::Null),
        })
    }
}
