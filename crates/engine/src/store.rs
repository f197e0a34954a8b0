//! In-memory persistence: workflow definitions and the run ledger.
//!
//! Both stores are `RwLock<HashMap>` behind `Arc` — many readers, short
//! writer sections, values cloned out so no lock is held across an await.
//! Durability across restarts is explicitly out of scope; the ledger is the
//! system of record only for the life of the process.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    paginate, ExecutionStatus, Page, PageRequest, StepFailure, Workflow, WorkflowExecution,
    WorkflowStatus,
};

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

/// In-memory store of workflow definitions.
#[derive(Debug, Default)]
pub struct WorkflowStore {
    inner: RwLock<HashMap<Uuid, Workflow>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a (validated) workflow definition.
    pub fn insert(&self, workflow: Workflow) {
        debug!(workflow_id = %workflow.id, name = workflow.name.as_str(), "storing workflow");
        self.inner.write().unwrap().insert(workflow.id, workflow);
    }

    /// Fetch a definition by id.
    ///
    /// # Errors
    /// [`EngineError::WorkflowNotFound`] if no such workflow exists.
    pub fn get(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.inner
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(EngineError::WorkflowNotFound(id))
    }

    /// List definitions ordered by creation time (id as tiebreaker).
    pub fn list(&self, page: PageRequest) -> Page<Workflow> {
        let mut all: Vec<Workflow> = self.inner.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        paginate(all, page)
    }

    /// Transition a workflow's status, enforcing the lifecycle rules.
    ///
    /// Returns the updated definition.
    ///
    /// # Errors
    /// - [`EngineError::WorkflowNotFound`] if no such workflow exists.
    /// - [`EngineError::InvalidTransition`] if the move is not legal.
    pub fn set_status(&self, id: Uuid, to: WorkflowStatus) -> Result<Workflow, EngineError> {
        let mut inner = self.inner.write().unwrap();
        let workflow = inner.get_mut(&id).ok_or(EngineError::WorkflowNotFound(id))?;

        if !workflow.status.can_transition(to) {
            return Err(EngineError::InvalidTransition {
                workflow_id: id,
                from: workflow.status,
                to,
            });
        }

        debug!(workflow_id = %id, from = ?workflow.status, to = ?to, "workflow status change");
        workflow.status = to;
        workflow.updated_at = Utc::now();
        Ok(workflow.clone())
    }

    /// Remove a definition.
    ///
    /// # Errors
    /// [`EngineError::WorkflowNotFound`] if no such workflow exists.
    pub fn remove(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.inner
            .write()
            .unwrap()
            .remove(&id)
            .ok_or(EngineError::WorkflowNotFound(id))
    }
}

// ---------------------------------------------------------------------------
// RunLedger
// ---------------------------------------------------------------------------

/// In-memory ledger of workflow executions, past and in-flight.
///
/// Records are append-then-finalize: once a run reaches a terminal status
/// every further mutation is a no-op, so a completed record never changes
/// under a reader.
#[derive(Debug, Default)]
pub struct RunLedger {
    inner: RwLock<HashMap<Uuid, WorkflowExecution>>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, execution: WorkflowExecution) {
        self.inner.write().unwrap().insert(execution.id, execution);
    }

    /// Fetch a run by id.
    ///
    /// # Errors
    /// [`EngineError::ExecutionNotFound`] if no such run exists.
    pub fn get(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.inner
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    /// Move a pending run to `Running`.
    pub fn mark_running(&self, id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        if let Some(run) = inner.get_mut(&id) {
            if run.status == ExecutionStatus::Pending {
                run.status = ExecutionStatus::Running;
            }
        }
    }

    /// Record a step's successful output on a live run.
    pub fn record_step_success(&self, id: Uuid, step_id: &str, output: Value) {
        let mut inner = self.inner.write().unwrap();
        if let Some(run) = inner.get_mut(&id) {
            if !run.status.is_terminal() {
                run.results.insert(step_id.to_string(), output);
            }
        }
    }

    /// Record a step failure on a live run.
    pub fn record_step_failure(&self, id: Uuid, failure: StepFailure) {
        let mut inner = self.inner.write().unwrap();
        if let Some(run) = inner.get_mut(&id) {
            if !run.status.is_terminal() {
                run.errors.push(failure);
            }
        }
    }

    /// Seal a run with its terminal status. A no-op if the run is already
    /// terminal.
    pub fn finalize(&self, id: Uuid, status: ExecutionStatus, results: HashMap<String, Value>) {
        debug_assert!(status.is_terminal());
        let mut inner = self.inner.write().unwrap();
        if let Some(run) = inner.get_mut(&id) {
            if !run.status.is_terminal() {
                run.status = status;
                run.completed_at = Some(Utc::now());
                run.results = results;
            }
        }
    }

    /// Number of non-terminal runs of the given workflow. Used to enforce
    /// schedule-trigger concurrency caps.
    pub fn running_count(&self, workflow_id: Uuid) -> usize {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|run| run.workflow_id == workflow_id && !run.status.is_terminal())
            .count()
    }

    /// List runs of one workflow, newest first.
    pub fn list_for_workflow(&self, workflow_id: Uuid, page: PageRequest) -> Page<WorkflowExecution> {
        let mut all: Vec<WorkflowExecution> = self
            .inner
            .read()
            .unwrap()
            .values()
            .filter(|run| run.workflow_id == workflow_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        paginate(all, page)
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TriggerConfig;
    use serde_json::json;

    fn workflow(name: &str) -> Workflow {
        Workflow::new(name, None, vec![], vec![TriggerConfig::Manual])
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let store = WorkflowStore::new();
        let wf = workflow("deploy");
        let id = wf.id;

        store.insert(wf);
        assert_eq!(store.get(id).unwrap().name, "deploy");
        store.remove(id).unwrap();
        assert!(matches!(
            store.get(id),
            Err(EngineError::WorkflowNotFound(missing)) if missing == id
        ));
    }

    #[test]
    fn status_transition_is_enforced() {
        let store = WorkflowStore::new();
        let wf = workflow("wf");
        let id = wf.id;
        store.insert(wf);

        // Draft -> Paused is illegal.
        assert!(matches!(
            store.set_status(id, WorkflowStatus::Paused),
            Err(EngineError::InvalidTransition { .. })
        ));

        let updated = store.set_status(id, WorkflowStatus::Active).unwrap();
        assert_eq!(updated.status, WorkflowStatus::Active);
        assert!(updated.updated_at >= updated.created_at);

        store.set_status(id, WorkflowStatus::Paused).unwrap();
        store.set_status(id, WorkflowStatus::Active).unwrap();
    }

    #[test]
    fn list_is_ordered_and_paginated() {
        let store = WorkflowStore::new();
        for i in 0..5 {
            store.insert(workflow(&format!("wf-{i}")));
        }

        let page = store.list(PageRequest { limit: 3, offset: 0 });
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.total_count, 5);
        assert_eq!(page.next_offset, Some(3));

        let rest = store.list(PageRequest { limit: 3, offset: 3 });
        assert_eq!(rest.items.len(), 2);
        assert_eq!(rest.next_offset, None);
    }

    #[test]
    fn ledger_rejects_mutation_after_finalize() {
        let ledger = RunLedger::new();
        let run = WorkflowExecution::new(Uuid::new_v4());
        let id = run.id;
        ledger.insert(run);
        ledger.mark_running(id);

        let mut results = HashMap::new();
        results.insert("a".to_string(), json!(1));
        ledger.finalize(id, ExecutionStatus::Completed, results);

        // Terminal: all of these must be no-ops.
        ledger.record_step_success(id, "b", json!(2));
        ledger.record_step_failure(id, StepFailure::new("c", "late"));
        ledger.finalize(id, ExecutionStatus::Failed, HashMap::new());

        let run = ledger.get(id).unwrap();
        assert_eq!(run.status, ExecutionStatus::Completed);
        assert_eq!(run.results.len(), 1);
        assert!(run.errors.is_empty());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn running_count_ignores_terminal_runs() {
        let ledger = RunLedger::new();
        let workflow_id = Uuid::new_v4();

        let live = WorkflowExecution::new(workflow_id);
        let live_id = live.id;
        ledger.insert(live);
        ledger.mark_running(live_id);

        let done = WorkflowExecution::new(workflow_id);
        let done_id = done.id;
        ledger.insert(done);
        ledger.finalize(done_id, ExecutionStatus::Cancelled, HashMap::new());

        // A run of some other workflow does not count either.
        ledger.insert(WorkflowExecution::new(Uuid::new_v4()));

        assert_eq!(ledger.running_count(workflow_id), 1);
    }

    #[test]
    fn list_for_workflow_is_newest_first() {
        let ledger = RunLedger::new();
        let workflow_id = Uuid::new_v4();

        let mut older = WorkflowExecution::new(workflow_id);
        older.started_at = Utc::now() - chrono::Duration::seconds(60);
        let older_id = older.id;
        ledger.insert(older);

        let newer = WorkflowExecution::new(workflow_id);
        let newer_id = newer.id;
        ledger.insert(newer);

        let page = ledger.list_for_workflow(workflow_id, PageRequest::default());
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, newer_id);
        assert_eq!(page.items[1].id, older_id);
    }
}
