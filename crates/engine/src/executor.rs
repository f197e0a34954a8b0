//! Step execution — one step, one scope, one result.
//!
//! `StepExecutor` dispatches a step to its kind-specific handler and wraps
//! every attempt with the step's timeout and retry policy. Composite kinds
//! (parallel, sequential, conditional, loop) recurse into their children;
//! leaf kinds (agent-task, http, script) await a collaborator.
//!
//! Every handler returns `Result<Value, StepError>`; recording outputs into
//! the run and deciding what a failure means for the rest of the workflow is
//! the scheduler's job, not this module's.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use agents::{AgentDispatcher, ExpressionEvaluator, HttpCaller, ScriptRunner};

use crate::context::StepScope;
use crate::error::StepError;
use crate::models::{StepKind, WorkflowStep};

/// Default timeout for one leaf attempt when the step declares none.
/// Composite steps without an explicit timeout are unbounded; their
/// children carry their own limits.
pub const DEFAULT_LEAF_TIMEOUT_MS: u64 = 30_000;

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;

/// Executes single steps against the collaborator seams.
///
/// Cheap to clone; clones share the collaborators.
#[derive(Clone)]
pub struct StepExecutor {
    agents: Arc<dyn AgentDispatcher>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    http: Arc<dyn HttpCaller>,
    scripts: Arc<dyn ScriptRunner>,
}

impl StepExecutor {
    pub fn new(
        agents: Arc<dyn AgentDispatcher>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        http: Arc<dyn HttpCaller>,
        scripts: Arc<dyn ScriptRunner>,
    ) -> Self {
        Self {
            agents,
            evaluator,
            http,
            scripts,
        }
    }

    /// Execute `step` to a terminal per-step result, honouring its timeout
    /// and retry policy.
    ///
    /// Boxed because composite kinds recurse.
    pub fn execute<'a>(&'a self, step: &'a WorkflowStep, scope: &'a StepScope) -> StepFuture<'a> {
        Box::pin(async move {
            let mut retries = 0u32;

            loop {
                if scope.is_cancelled() {
                    return Err(StepError::Cancelled);
                }

                let result = match self.attempt_timeout(step) {
                    Some(limit) => match tokio::time::timeout(limit, self.attempt(step, scope))
                        .await
                    {
                        Ok(result) => result,
                        Err(_elapsed) => Err(StepError::Timeout(limit.as_millis() as u64)),
                    },
                    None => self.attempt(step, scope).await,
                };

                match result {
                    Ok(output) => return Ok(output),
                    Err(err) if err.is_retryable() => {
                        let Some(policy) = &step.retry else {
                            return Err(err);
                        };
                        // `retries` counts completed attempts beyond the first.
                        if retries + 1 >= policy.max_attempts {
                            return Err(err);
                        }
                        let delay = policy.delay_for(retries);
                        retries += 1;
                        warn!(
                            step_id = step.id.as_str(),
                            attempt = retries,
                            max_attempts = policy.max_attempts,
                            ?delay,
                            error = %err,
                            "retryable step failure, backing off"
                        );
                        tokio::select! {
                            _ = scope.cancelled() => return Err(StepError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    }

    /// Timeout applied to one attempt of `step`.
    fn attempt_timeout(&self, step: &WorkflowStep) -> Option<Duration> {
        match step.timeout_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None if step.kind.is_leaf() => Some(Duration::from_millis(DEFAULT_LEAF_TIMEOUT_MS)),
            None => None,
        }
    }

    /// One attempt, dispatched by kind.
    async fn attempt(&self, step: &WorkflowStep, scope: &StepScope) -> Result<Value, StepError> {
        debug!(step_id = step.id.as_str(), kind = step.kind.name(), "executing step");

        match &step.kind {
            StepKind::AgentTask {
                capability,
                action,
                params,
            } => {
                let timeout = self
                    .attempt_timeout(step)
                    .unwrap_or(Duration::from_millis(DEFAULT_LEAF_TIMEOUT_MS));
                self.agents
                    .dispatch(capability, action, params.clone(), timeout)
                    .await
                    .map_err(StepError::Dispatch)
            }

            StepKind::Parallel { children } => self.run_parallel(children, scope).await,

            StepKind::Sequential { children } => self.run_sequential(children, scope).await,

            StepKind::Conditional {
                predicate,
                if_true,
                if_false,
            } => {
                let verdict = self
                    .evaluator
                    .evaluate(predicate, &scope.eval_context())
                    .map_err(StepError::Expression)?;
                let branch = if verdict {
                    Some(if_true.as_ref())
                } else {
                    if_false.as_deref()
                };
                match branch {
                    Some(child) => match self.execute(child, scope).await {
                        Ok(output) => Ok(output),
                        Err(StepError::Cancelled) => Err(StepError::Cancelled),
                        Err(err) => Err(StepError::Child {
                            step_id: child.id.clone(),
                            source: Box::new(err),
                        }),
                    },
                    None => Ok(Value::Null),
                }
            }

            StepKind::Loop {
                items,
                body,
                continue_on_item_failure,
            } => {
                self.run_loop(items, body, *continue_on_item_failure, scope)
                    .await
            }

            StepKind::Http {
                method,
                url,
                payload,
            } => {
                let timeout = self
                    .attempt_timeout(step)
                    .unwrap_or(Duration::from_millis(DEFAULT_LEAF_TIMEOUT_MS));
                self.http
                    .call(method, url, payload.as_ref(), timeout)
                    .await
                    .map_err(StepError::Http)
            }

            StepKind::Script { source } => {
                let timeout = self
                    .attempt_timeout(step)
                    .unwrap_or(Duration::from_millis(DEFAULT_LEAF_TIMEOUT_MS));
                self.scripts
                    .run(source, &scope.eval_context(), timeout)
                    .await
                    .map_err(StepError::Script)
            }
        }
    }

    /// All children at once. Succeeds only when every child succeeds; the
    /// first observed failure decides the outcome, but launched siblings run
    /// to completion (their results are discarded with the parent's error).
    async fn run_parallel(
        &self,
        children: &[WorkflowStep],
        scope: &StepScope,
    ) -> Result<Value, StepError> {
        let mut join_set: JoinSet<(usize, Result<Value, StepError>)> = JoinSet::new();
        let mut cancelled_early = false;

        for (idx, child) in children.iter().enumerate() {
            // Cancellation check before dispatching each new child.
            if scope.is_cancelled() {
                cancelled_early = true;
                break;
            }
            let exec = self.clone();
            let child = child.clone();
            let child_scope = scope.clone();
            join_set.spawn(async move {
                let result = exec.execute(&child, &child_scope).await;
                (idx, result)
            });
        }

        let mut outputs: Vec<Value> = vec![Value::Null; children.len()];
        let mut first_failure: Option<StepError> = None;
        let mut saw_cancelled = false;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, Ok(output))) => outputs[idx] = output,
                // A cancelled child is the run winding down, not a failure of
                // this step; it must surface as `Cancelled`, never `Child`.
                Ok((_, Err(StepError::Cancelled))) => saw_cancelled = true,
                Ok((idx, Err(err))) => {
                    if first_failure.is_none() {
                        first_failure = Some(StepError::Child {
                            step_id: children[idx].id.clone(),
                            source: Box::new(err),
                        });
                    }
                }
                Err(join_err) => {
                    if first_failure.is_none() {
                        first_failure = Some(StepError::Join(join_err.to_string()));
                    }
                }
            }
        }

        if cancelled_early || (first_failure.is_none() && saw_cancelled) {
            return Err(StepError::Cancelled);
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(Value::Array(outputs)),
        }
    }

    /// Children one at a time, each child's output recorded into the local
    /// scope so later children can see it. Output is the last child's.
    async fn run_sequential(
        &self,
        children: &[WorkflowStep],
        scope: &StepScope,
    ) -> Result<Value, StepError> {
        let mut local = scope.clone();
        let mut last = Value::Null;

        for child in children {
            if local.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            match self.execute(child, &local).await {
                Ok(output) => {
                    local.record_local(&child.id, output.clone());
                    last = output;
                }
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(err) => {
                    return Err(StepError::Child {
                        step_id: child.id.clone(),
                        source: Box::new(err),
                    })
                }
            }
        }

        Ok(last)
    }

    /// `body` once per item. Fail-fast unless the loop opts into
    /// continue-on-item-failure, which collects partial outputs and
    /// per-item errors.
    async fn run_loop(
        &self,
        items: &[Value],
        body: &WorkflowStep,
        continue_on_item_failure: bool,
        scope: &StepScope,
    ) -> Result<Value, StepError> {
        let mut outputs: Vec<Value> = Vec::with_capacity(items.len());
        let mut item_errors: Vec<Value> = Vec::new();

        for (index, item) in items.iter().enumerate() {
            // Cancellation check between iterations.
            if scope.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            let item_scope = scope.with_item(item.clone());
            match self.execute(body, &item_scope).await {
                Ok(output) => outputs.push(output),
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(err) if continue_on_item_failure => {
                    warn!(
                        step_id = body.id.as_str(),
                        index,
                        error = %err,
                        "loop item failed, continuing"
                    );
                    item_errors.push(json!({ "index": index, "error": err.to_string() }));
                }
                Err(err) => {
                    return Err(StepError::Child {
                        step_id: body.id.clone(),
                        source: Box::new(err),
                    })
                }
            }
        }

        if continue_on_item_failure {
            Ok(json!({ "items": outputs, "errors": item_errors }))
        } else {
            Ok(Value::Array(outputs))
        }
    }
}
