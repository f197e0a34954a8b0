//! The engine facade — the one type hosts embed.
//!
//! Wires the store, ledger, scheduler and trigger manager together behind a
//! small API: define, activate/pause, start/cancel, inspect, subscribe.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use agents::{AgentDispatcher, EventSource, ExpressionEvaluator, HttpCaller, ScriptRunner};

use crate::dag;
use crate::error::EngineError;
use crate::events::{EventBus, ExecutionEvent};
use crate::executor::StepExecutor;
use crate::models::{
    Page, PageRequest, TriggerConfig, Workflow, WorkflowExecution, WorkflowStatus, WorkflowStep,
};
use crate::scheduler::{ExecutionScheduler, SchedulerConfig, StartMode};
use crate::store::{RunLedger, WorkflowStore};
use crate::trigger::TriggerManager;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_parallel_steps: usize,
    /// Capacity of the lifecycle event bus.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 8,
            event_capacity: 256,
        }
    }
}

/// The external implementations the engine delegates to.
pub struct Collaborators {
    pub agents: Arc<dyn AgentDispatcher>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub http: Arc<dyn HttpCaller>,
    pub scripts: Arc<dyn ScriptRunner>,
    pub events: Arc<dyn EventSource>,
}

/// Input shape for defining a workflow.
#[derive(Debug, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

/// The workflow orchestration engine.
pub struct WorkflowEngine {
    store: Arc<WorkflowStore>,
    ledger: Arc<RunLedger>,
    scheduler: ExecutionScheduler,
    triggers: TriggerManager,
    events: EventBus,
}

impl WorkflowEngine {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        let store = Arc::new(WorkflowStore::new());
        let ledger = Arc::new(RunLedger::new());
        let events = EventBus::new(config.event_capacity);

        let executor = StepExecutor::new(
            collaborators.agents,
            collaborators.evaluator,
            collaborators.http,
            collaborators.scripts,
        );
        let scheduler = ExecutionScheduler::new(
            executor,
            Arc::clone(&ledger),
            events.clone(),
            SchedulerConfig {
                max_parallel_steps: config.max_parallel_steps,
            },
        );
        let triggers = TriggerManager::new(
            scheduler.clone(),
            Arc::clone(&store),
            Arc::clone(&ledger),
            collaborators.events,
        );

        Self {
            store,
            ledger,
            scheduler,
            triggers,
            events,
        }
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Validate and store a new workflow definition. It starts in `Draft`;
    /// triggers stay dormant until activation.
    ///
    /// # Errors
    /// Any validation error from [`dag::validate`]; nothing is stored on
    /// rejection.
    pub fn create_workflow(&self, new: NewWorkflow) -> Result<Workflow, EngineError> {
        let workflow = Workflow::new(new.name, new.description, new.steps, new.triggers);
        dag::validate(&workflow)?;
        info!(workflow_id = %workflow.id, name = workflow.name.as_str(), "workflow created");
        self.store.insert(workflow.clone());
        Ok(workflow)
    }

    /// Move a workflow to `Active` and arm its triggers.
    pub fn activate(&self, id: Uuid) -> Result<Workflow, EngineError> {
        let workflow = self.store.set_status(id, WorkflowStatus::Active)?;
        self.triggers.arm(&workflow);
        Ok(workflow)
    }

    /// Move a workflow to `Paused` and disarm its triggers. In-flight runs
    /// are not touched.
    pub fn pause(&self, id: Uuid) -> Result<Workflow, EngineError> {
        let workflow = self.store.set_status(id, WorkflowStatus::Paused)?;
        self.triggers.disarm(id);
        Ok(workflow)
    }

    /// Remove a workflow definition, disarming its triggers first. Past runs
    /// stay readable in the ledger.
    pub fn delete_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        self.triggers.disarm(id);
        self.store.remove(id)?;
        info!(workflow_id = %id, "workflow deleted");
        Ok(())
    }

    pub fn get_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.store.get(id)
    }

    pub fn list_workflows(&self, page: PageRequest) -> Page<Workflow> {
        self.store.list(page)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Start a run manually.
    ///
    /// Allowed for `Draft` (test-before-activate) and `Active` workflows.
    ///
    /// # Errors
    /// [`EngineError::NotStartable`] for any other status.
    pub async fn start(
        &self,
        id: Uuid,
        params: Value,
        mode: StartMode,
    ) -> Result<WorkflowExecution, EngineError> {
        let workflow = self.store.get(id)?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Draft | WorkflowStatus::Active
        ) {
            return Err(EngineError::NotStartable {
                workflow_id: id,
                status: workflow.status,
            });
        }
        self.scheduler.start(&workflow, params, mode).await
    }

    /// Request cooperative cancellation of a run. Terminal runs are a no-op.
    pub fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.scheduler.cancel(execution_id)
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.ledger.get(execution_id)
    }

    /// Runs of one workflow, newest first.
    pub fn list_executions(&self, workflow_id: Uuid, page: PageRequest) -> Page<WorkflowExecution> {
        self.ledger.list_for_workflow(workflow_id, page)
    }

    // ------------------------------------------------------------------
    // Events and webhooks
    // ------------------------------------------------------------------

    /// Subscribe to the lifecycle event stream of all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Deliver an inbound webhook to whichever active workflow owns `path`.
    pub async fn fire_webhook(
        &self,
        path: &str,
        payload: Value,
    ) -> Result<WorkflowExecution, EngineError> {
        self.triggers.fire_webhook(path, payload).await
    }
}
