//! Run scheduling — turns a workflow definition into a driven execution.
//!
//! The drive loop is an eligibility loop: every pass launches all
//! not-yet-started top-level steps whose dependencies have succeeded, then
//! awaits one completion and re-evaluates. Steps that become eligible by a
//! sibling's success are picked up on the next pass, so independent branches
//! keep making progress after an unrelated branch fails — only steps downstream
//! of a failure are withheld.
//!
//! Concurrency across all runs is bounded by one shared semaphore; each
//! spawned step task takes a permit before executing.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::{EngineError, StepError};
use crate::events::{EventBus, ExecutionEvent};
use crate::executor::StepExecutor;
use crate::models::{ExecutionStatus, StepFailure, Workflow, WorkflowExecution};
use crate::store::RunLedger;

/// Whether `start` awaits the run or hands it to a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Drive the run to a terminal status before returning.
    Sync,
    /// Spawn the run and return the `Running` record immediately.
    Async,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently executing top-level steps, across all
    /// runs.
    pub max_parallel_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 8,
        }
    }
}

/// Drives workflow runs to completion.
///
/// Cheap to clone; clones share the ledger, bus, semaphore and cancellation
/// registry.
#[derive(Clone)]
pub struct ExecutionScheduler {
    executor: StepExecutor,
    ledger: Arc<RunLedger>,
    events: EventBus,
    limiter: Arc<Semaphore>,
    cancellations: Arc<DashMap<Uuid, CancellationToken>>,
}

impl ExecutionScheduler {
    pub fn new(
        executor: StepExecutor,
        ledger: Arc<RunLedger>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            ledger,
            events,
            limiter: Arc::new(Semaphore::new(config.max_parallel_steps.max(1))),
            cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Start a run of `workflow` with the given input parameters.
    ///
    /// The run is registered in the ledger (and cancellable) before this
    /// returns, in either mode.
    ///
    /// # Errors
    /// Only propagates ledger lookup failures; the run itself reports
    /// failures through its terminal status, not through this result.
    pub async fn start(
        &self,
        workflow: &Workflow,
        params: Value,
        mode: StartMode,
    ) -> Result<WorkflowExecution, EngineError> {
        let execution = WorkflowExecution::new(workflow.id);
        let execution_id = execution.id;

        self.ledger.insert(execution);
        self.ledger.mark_running(execution_id);

        let cancel = CancellationToken::new();
        self.cancellations.insert(execution_id, cancel.clone());

        info!(
            workflow_id = %workflow.id,
            execution_id = %execution_id,
            ?mode,
            "starting workflow run"
        );
        self.events.publish(ExecutionEvent::ExecutionStarted {
            execution_id,
            workflow_id: workflow.id,
        });

        match mode {
            StartMode::Sync => {
                self.clone()
                    .drive(workflow.clone(), execution_id, params, cancel)
                    .await;
                self.ledger.get(execution_id)
            }
            StartMode::Async => {
                let run = self.ledger.get(execution_id)?;
                let scheduler = self.clone();
                let workflow = workflow.clone();
                tokio::spawn(async move {
                    scheduler.drive(workflow, execution_id, params, cancel).await;
                });
                Ok(run)
            }
        }
    }

    /// Request cooperative cancellation of a run.
    ///
    /// Cancelling a run that already reached a terminal status is a no-op.
    ///
    /// # Errors
    /// [`EngineError::ExecutionNotFound`] if the run was never started.
    pub fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        if let Some(entry) = self.cancellations.get(&execution_id) {
            info!(execution_id = %execution_id, "cancellation requested");
            entry.value().cancel();
            return Ok(());
        }
        // Terminal runs have no token left; cancelling them is a no-op.
        self.ledger.get(execution_id).map(|_| ())
    }

    /// The eligibility loop. Runs until no step task is in flight and no new
    /// step can be launched, then seals the run in the ledger.
    async fn drive(
        self,
        workflow: Workflow,
        execution_id: Uuid,
        params: Value,
        cancel: CancellationToken,
    ) {
        let mut ctx = ExecutionContext::new(execution_id, workflow.id, params, cancel);
        let mut join_set: JoinSet<(String, Result<Value, StepError>)> = JoinSet::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut had_failure = false;
        // Set once a step fails terminally: in-flight steps drain but no new
        // step is launched.
        let mut halted = false;

        loop {
            if !halted && !ctx.is_cancelled() {
                for step in &workflow.steps {
                    if started.contains(&step.id) {
                        continue;
                    }
                    if !step.dependencies.iter().all(|d| ctx.succeeded(d)) {
                        continue;
                    }

                    started.insert(step.id.clone());
                    self.events.publish(ExecutionEvent::StepStarted {
                        execution_id,
                        step_id: step.id.clone(),
                    });

                    let exec = self.executor.clone();
                    let step = step.clone();
                    let scope = ctx.scope();
                    let limiter = Arc::clone(&self.limiter);
                    join_set.spawn(async move {
                        let _permit = match limiter.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(closed) => return (step.id, Err(StepError::Join(closed.to_string()))),
                        };
                        let result = exec.execute(&step, &scope).await;
                        (step.id, result)
                    });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                // Nothing in flight and nothing launchable: the run is over.
                break;
            };

            match joined {
                Ok((step_id, Ok(output))) => {
                    ctx.record_success(&step_id, output.clone());
                    self.ledger.record_step_success(execution_id, &step_id, output);
                    self.events.publish(ExecutionEvent::StepCompleted {
                        execution_id,
                        step_id,
                    });
                }
                Ok((_, Err(StepError::Cancelled))) => {
                    // Not a failure of the step, just the run winding down.
                }
                Ok((step_id, Err(err))) => {
                    warn!(
                        execution_id = %execution_id,
                        step_id = step_id.as_str(),
                        error = %err,
                        "step failed terminally"
                    );
                    self.ledger
                        .record_step_failure(execution_id, StepFailure::new(&step_id, err.to_string()));
                    self.events.publish(ExecutionEvent::StepFailed {
                        execution_id,
                        step_id,
                        error: err.to_string(),
                    });
                    had_failure = true;
                    halted = true;
                }
                Err(join_err) => {
                    warn!(execution_id = %execution_id, error = %join_err, "step task panicked");
                    self.ledger.record_step_failure(
                        execution_id,
                        StepFailure::new("unknown", format!("step task panicked: {join_err}")),
                    );
                    had_failure = true;
                    halted = true;
                }
            }
        }

        self.seal(&workflow, execution_id, &ctx, had_failure);
    }

    /// Decide the terminal status, finalize the ledger record, publish the
    /// terminal event and drop the cancellation token.
    fn seal(
        &self,
        workflow: &Workflow,
        execution_id: Uuid,
        ctx: &ExecutionContext,
        had_failure: bool,
    ) {
        let all_done = ctx.completed_count() == workflow.steps.len();

        let status = if all_done {
            ExecutionStatus::Completed
        } else if had_failure {
            ExecutionStatus::Failed
        } else if ctx.is_cancelled() {
            ExecutionStatus::Cancelled
        } else {
            // No failure, no cancellation, yet steps remain: their
            // dependencies can never be satisfied.
            let unreached: Vec<String> = workflow
                .steps
                .iter()
                .filter(|s| !ctx.succeeded(&s.id))
                .map(|s| s.id.clone())
                .collect();
            warn!(
                execution_id = %execution_id,
                error = %EngineError::Stuck { unreached: unreached.clone() },
                "run stuck"
            );
            for step_id in unreached {
                self.ledger.record_step_failure(
                    execution_id,
                    StepFailure::new(step_id, "step never became eligible"),
                );
            }
            ExecutionStatus::Failed
        };

        self.ledger.finalize(execution_id, status, ctx.results().clone());
        self.cancellations.remove(&execution_id);

        info!(execution_id = %execution_id, ?status, "run sealed");
        let workflow_id = workflow.id;
        self.events.publish(match status {
            ExecutionStatus::Completed => ExecutionEvent::ExecutionCompleted {
                execution_id,
                workflow_id,
            },
            ExecutionStatus::Cancelled => ExecutionEvent::ExecutionCancelled {
                execution_id,
                workflow_id,
            },
            _ => ExecutionEvent::ExecutionFailed {
                execution_id,
                workflow_id,
            },
        });
    }
}
