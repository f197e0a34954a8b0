//! Standing triggers: schedule loops, event subscriptions and webhook routes.
//!
//! Arming a workflow materializes one resource per configured trigger;
//! disarming cancels them all. Both are idempotent, and every armed resource
//! carries the workflow's cancellation token so disarming tears the loops
//! down at their next await.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agents::EventSource;

use crate::error::EngineError;
use crate::models::{TriggerConfig, Workflow, WorkflowExecution, WorkflowStatus};
use crate::scheduler::{ExecutionScheduler, StartMode};
use crate::store::{RunLedger, WorkflowStore};

/// One materialized trigger of an armed workflow.
struct ArmedTrigger {
    kind: &'static str,
    token: CancellationToken,
    /// Webhook path owned by this trigger, removed from the routing table on
    /// disarm.
    route: Option<String>,
}

/// Owns the standing resources behind non-manual triggers.
pub struct TriggerManager {
    scheduler: ExecutionScheduler,
    store: Arc<WorkflowStore>,
    ledger: Arc<RunLedger>,
    source: Arc<dyn EventSource>,
    armed: DashMap<Uuid, Vec<ArmedTrigger>>,
    routes: DashMap<String, Uuid>,
}

impl TriggerManager {
    pub fn new(
        scheduler: ExecutionScheduler,
        store: Arc<WorkflowStore>,
        ledger: Arc<RunLedger>,
        source: Arc<dyn EventSource>,
    ) -> Self {
        Self {
            scheduler,
            store,
            ledger,
            source,
            armed: DashMap::new(),
            routes: DashMap::new(),
        }
    }

    /// Arm every trigger the workflow declares. Re-arming an already armed
    /// workflow disarms it first, so the armed set always mirrors the
    /// current definition.
    pub fn arm(&self, workflow: &Workflow) {
        self.disarm(workflow.id);

        let mut triggers = Vec::new();
        for config in &workflow.triggers {
            match config {
                TriggerConfig::Manual => {
                    // No standing resource; manual starts go through the API.
                }
                TriggerConfig::Schedule {
                    interval_ms,
                    max_concurrent_runs,
                } => {
                    let token = CancellationToken::new();
                    tokio::spawn(schedule_loop(
                        self.scheduler.clone(),
                        Arc::clone(&self.store),
                        Arc::clone(&self.ledger),
                        workflow.id,
                        Duration::from_millis((*interval_ms).max(1)),
                        *max_concurrent_runs,
                        token.clone(),
                    ));
                    triggers.push(ArmedTrigger {
                        kind: "schedule",
                        token,
                        route: None,
                    });
                }
                TriggerConfig::Event { event } => {
                    let token = CancellationToken::new();
                    tokio::spawn(event_loop(
                        self.scheduler.clone(),
                        Arc::clone(&self.store),
                        self.source.subscribe(event),
                        workflow.id,
                        event.clone(),
                        token.clone(),
                    ));
                    triggers.push(ArmedTrigger {
                        kind: "event",
                        token,
                        route: None,
                    });
                }
                TriggerConfig::Webhook { path } => {
                    self.routes.insert(path.clone(), workflow.id);
                    triggers.push(ArmedTrigger {
                        kind: "webhook",
                        token: CancellationToken::new(),
                        route: Some(path.clone()),
                    });
                }
            }
        }

        info!(workflow_id = %workflow.id, count = triggers.len(), "workflow armed");
        self.armed.insert(workflow.id, triggers);
    }

    /// Tear down every armed trigger of the workflow. A no-op if none are
    /// armed.
    pub fn disarm(&self, workflow_id: Uuid) {
        let Some((_, triggers)) = self.armed.remove(&workflow_id) else {
            return;
        };
        for trigger in triggers {
            debug!(workflow_id = %workflow_id, kind = trigger.kind, "disarming trigger");
            trigger.token.cancel();
            if let Some(path) = trigger.route {
                self.routes.remove(&path);
            }
        }
    }

    /// Deliver an inbound webhook: resolve the path to its armed workflow
    /// and start an async run with the payload as input parameters.
    ///
    /// # Errors
    /// - [`EngineError::UnknownWebhook`] if no armed trigger owns `path`.
    /// - [`EngineError::WorkflowNotFound`] if the routed workflow is gone.
    pub async fn fire_webhook(
        &self,
        path: &str,
        payload: Value,
    ) -> Result<WorkflowExecution, EngineError> {
        let workflow_id = self
            .routes
            .get(path)
            .map(|entry| *entry.value())
            .ok_or_else(|| EngineError::UnknownWebhook(path.to_string()))?;

        let workflow = self.store.get(workflow_id)?;
        info!(workflow_id = %workflow_id, path, "webhook fired");
        self.scheduler
            .start(&workflow, payload, StartMode::Async)
            .await
    }
}

/// Fires a run each interval while the workflow stays `Active`.
///
/// Ticks that would exceed `max_concurrent_runs` are skipped, never queued.
async fn schedule_loop(
    scheduler: ExecutionScheduler,
    store: Arc<WorkflowStore>,
    ledger: Arc<RunLedger>,
    workflow_id: Uuid,
    interval: Duration,
    max_concurrent_runs: Option<u32>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick of a tokio interval is immediate; arming must not fire.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Ok(workflow) = store.get(workflow_id) else {
            // Definition deleted out from under us.
            break;
        };
        if workflow.status != WorkflowStatus::Active {
            continue;
        }

        if let Some(max) = max_concurrent_runs {
            let running = ledger.running_count(workflow_id);
            if running >= max as usize {
                warn!(
                    workflow_id = %workflow_id,
                    running,
                    max,
                    "schedule tick skipped, concurrency cap reached"
                );
                continue;
            }
        }

        if let Err(err) = scheduler
            .start(&workflow, json!({}), StartMode::Async)
            .await
        {
            warn!(workflow_id = %workflow_id, error = %err, "scheduled start failed");
        }
    }
}

/// Starts a run for every payload the event subscription delivers.
///
/// The receiver is owned here, so the loop ending (either way) drops the
/// subscription.
async fn event_loop(
    scheduler: ExecutionScheduler,
    store: Arc<WorkflowStore>,
    mut rx: tokio::sync::mpsc::Receiver<Value>,
    workflow_id: Uuid,
    event: String,
    token: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = token.cancelled() => break,
            received = rx.recv() => match received {
                Some(payload) => payload,
                None => break, // source closed the channel
            },
        };

        let Ok(workflow) = store.get(workflow_id) else {
            break;
        };
        if workflow.status != WorkflowStatus::Active {
            continue;
        }

        debug!(workflow_id = %workflow_id, event = event.as_str(), "event trigger fired");
        if let Err(err) = scheduler
            .start(&workflow, payload, StartMode::Async)
            .await
        {
            warn!(workflow_id = %workflow_id, error = %err, "event start failed");
        }
    }
}
