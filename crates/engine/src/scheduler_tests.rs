//! End-to-end tests: full engine wiring over mock collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use agents::mock::{InMemoryEventSource, KeyEvaluator, MockAgent, MockHttp, MockScript};

use crate::events::EventBus;
use crate::executor::StepExecutor;
use crate::models::{
    ExecutionStatus, PageRequest, RetryPolicy, StepKind, TriggerConfig, Workflow,
    WorkflowExecution, WorkflowStatus, WorkflowStep,
};
use crate::scheduler::{ExecutionScheduler, SchedulerConfig, StartMode};
use crate::service::{Collaborators, EngineConfig, NewWorkflow, WorkflowEngine};
use crate::store::RunLedger;
use crate::{EngineError, ExecutionEvent};

fn agent_step(id: &str, deps: &[&str]) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        name: id.to_uppercase(),
        kind: StepKind::AgentTask {
            capability: "compute".into(),
            action: "run".into(),
            params: json!({}),
        },
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        timeout_ms: None,
        retry: None,
    }
}

fn http_step(id: &str, deps: &[&str]) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        name: id.to_uppercase(),
        kind: StepKind::Http {
            method: "POST".into(),
            url: "https://example.test/hook".into(),
            payload: None,
        },
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        timeout_ms: None,
        retry: None,
    }
}

struct Harness {
    engine: WorkflowEngine,
    agent: Arc<MockAgent>,
    source: Arc<InMemoryEventSource>,
}

fn harness_with(agent: MockAgent, http: MockHttp) -> Harness {
    let agent = Arc::new(agent);
    let source = Arc::new(InMemoryEventSource::new());
    let engine = WorkflowEngine::new(
        Collaborators {
            agents: agent.clone(),
            evaluator: Arc::new(KeyEvaluator),
            http: Arc::new(http),
            scripts: Arc::new(MockScript),
            events: source.clone(),
        },
        EngineConfig::default(),
    );
    Harness {
        engine,
        agent,
        source,
    }
}

fn harness() -> Harness {
    harness_with(
        MockAgent::returning(json!({ "ok": true })),
        MockHttp::returning(json!(null)),
    )
}

async fn wait_terminal(engine: &WorkflowEngine, execution_id: Uuid) -> WorkflowExecution {
    for _ in 0..500 {
        if let Ok(run) = engine.get_execution(execution_id) {
            if run.status.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {execution_id} never reached a terminal status");
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diamond_workflow_completes_with_all_results() {
    let h = harness();
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "diamond".into(),
            description: None,
            steps: vec![
                agent_step("a", &[]),
                agent_step("b", &["a"]),
                agent_step("c", &["a"]),
                agent_step("d", &["b", "c"]),
            ],
            triggers: vec![TriggerConfig::Manual],
        })
        .unwrap();

    let run = h
        .engine
        .start(wf.id, json!({}), StartMode::Sync)
        .await
        .unwrap();

    assert_eq!(run.status, ExecutionStatus::Completed);
    assert!(run.errors.is_empty());
    for id in ["a", "b", "c", "d"] {
        assert!(run.results.contains_key(id), "missing result for {id}");
    }
    assert_eq!(h.agent.call_count(), 4);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn failed_dependency_blocks_downstream_steps() {
    let h = harness_with(
        MockAgent::failing("agent offline"),
        MockHttp::returning(json!(null)),
    );
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "chain".into(),
            description: None,
            steps: vec![agent_step("a", &[]), agent_step("b", &["a"])],
            triggers: vec![],
        })
        .unwrap();

    let run = h
        .engine
        .start(wf.id, json!({}), StartMode::Sync)
        .await
        .unwrap();

    assert_eq!(run.status, ExecutionStatus::Failed);
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.errors[0].step_id, "a");
    assert!(run.results.is_empty());
    // "b" was never dispatched.
    assert_eq!(h.agent.call_count(), 1);
}

#[tokio::test]
async fn independent_step_still_completes_after_a_sibling_fails() {
    // "bad" and "good" have no dependency relationship; both launch on the
    // first pass, and "good"'s result survives the run failing.
    let h = harness_with(
        MockAgent::returning(json!({ "ok": true })),
        MockHttp::failing("503"),
    );
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "split".into(),
            description: None,
            steps: vec![http_step("bad", &[]), agent_step("good", &[])],
            triggers: vec![],
        })
        .unwrap();

    let run = h
        .engine
        .start(wf.id, json!({}), StartMode::Sync)
        .await
        .unwrap();

    assert_eq!(run.status, ExecutionStatus::Failed);
    assert!(run.results.contains_key("good"));
    assert!(run.errors.iter().any(|e| e.step_id == "bad"));
}

#[tokio::test]
async fn unsatisfiable_dependencies_fail_the_run_as_stuck() {
    // Validation would reject this definition; drive the scheduler directly
    // to exercise the dead-end guard.
    let executor = StepExecutor::new(
        Arc::new(MockAgent::returning(json!({ "ok": true }))),
        Arc::new(KeyEvaluator),
        Arc::new(MockHttp::returning(json!(null))),
        Arc::new(MockScript),
    );
    let ledger = Arc::new(RunLedger::new());
    let scheduler = ExecutionScheduler::new(
        executor,
        Arc::clone(&ledger),
        EventBus::default(),
        SchedulerConfig::default(),
    );

    let wf = Workflow::new(
        "stuck",
        None,
        vec![agent_step("a", &[]), agent_step("b", &["ghost"])],
        vec![TriggerConfig::Manual],
    );
    let run = scheduler
        .start(&wf, json!({}), StartMode::Sync)
        .await
        .unwrap();

    assert_eq!(run.status, ExecutionStatus::Failed);
    assert!(run.results.contains_key("a"));
    assert!(run
        .errors
        .iter()
        .any(|e| e.step_id == "b" && e.message.contains("never became eligible")));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_pending_steps() {
    let h = harness_with(
        MockAgent::returning(json!({ "ok": true })).with_delay(Duration::from_millis(200)),
        MockHttp::returning(json!(null)),
    );
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "slow-chain".into(),
            description: None,
            steps: vec![agent_step("a", &[]), agent_step("b", &["a"])],
            triggers: vec![],
        })
        .unwrap();

    let run = h
        .engine
        .start(wf.id, json!({}), StartMode::Async)
        .await
        .unwrap();
    assert_eq!(run.status, ExecutionStatus::Running);

    // Let "a" get in flight, then cancel while it is still sleeping.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.cancel(run.id).unwrap();

    let sealed = wait_terminal(&h.engine, run.id).await;
    assert_eq!(sealed.status, ExecutionStatus::Cancelled);
    // "a" ran to completion; "b" was never launched.
    assert_eq!(h.agent.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_inside_a_composite_step_is_not_a_failure() {
    // The run cancels while a parallel step's child sits in its retry
    // backoff; the run must seal Cancelled with no recorded failure.
    let h = harness_with(
        MockAgent::failing("transient"),
        MockHttp::returning(json!(null)),
    );
    let mut kid = agent_step("kid", &[]);
    kid.retry = Some(RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 5_000,
        backoff_multiplier: 2.0,
    });
    let par = WorkflowStep {
        id: "par".into(),
        name: "Par".into(),
        kind: StepKind::Parallel {
            children: vec![kid],
        },
        dependencies: vec![],
        timeout_ms: None,
        retry: None,
    };
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "cancel-mid-retry".into(),
            description: None,
            steps: vec![par],
            triggers: vec![],
        })
        .unwrap();

    let run = h
        .engine
        .start(wf.id, json!({}), StartMode::Async)
        .await
        .unwrap();

    // Let the child burn its first attempt and enter backoff, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.cancel(run.id).unwrap();

    let sealed = wait_terminal(&h.engine, run.id).await;
    assert_eq!(sealed.status, ExecutionStatus::Cancelled);
    assert!(sealed.errors.is_empty(), "spurious failures: {:?}", sealed.errors);
    assert!(sealed.results.is_empty());
}

#[tokio::test]
async fn cancel_is_a_noop_on_terminal_runs_and_an_error_on_unknown_ids() {
    let h = harness();
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "one".into(),
            description: None,
            steps: vec![agent_step("a", &[])],
            triggers: vec![],
        })
        .unwrap();
    let run = h
        .engine
        .start(wf.id, json!({}), StartMode::Sync)
        .await
        .unwrap();
    assert_eq!(run.status, ExecutionStatus::Completed);

    h.engine.cancel(run.id).unwrap();
    assert_eq!(
        h.engine.get_execution(run.id).unwrap().status,
        ExecutionStatus::Completed
    );

    assert!(matches!(
        h.engine.cancel(Uuid::new_v4()),
        Err(EngineError::ExecutionNotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn draft_runs_manually_but_paused_does_not() {
    let h = harness();
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "lifecycle".into(),
            description: None,
            steps: vec![agent_step("a", &[])],
            triggers: vec![],
        })
        .unwrap();
    assert_eq!(wf.status, WorkflowStatus::Draft);

    // Draft workflows can be exercised before activation.
    let run = h
        .engine
        .start(wf.id, json!({}), StartMode::Sync)
        .await
        .unwrap();
    assert_eq!(run.status, ExecutionStatus::Completed);

    h.engine.activate(wf.id).unwrap();
    h.engine.pause(wf.id).unwrap();

    assert!(matches!(
        h.engine.start(wf.id, json!({}), StartMode::Sync).await,
        Err(EngineError::NotStartable { status: WorkflowStatus::Paused, .. })
    ));
}

#[tokio::test]
async fn invalid_definition_is_rejected_and_not_stored() {
    let h = harness();
    let result = h.engine.create_workflow(NewWorkflow {
        name: "cyclic".into(),
        description: None,
        steps: vec![agent_step("a", &["b"]), agent_step("b", &["a"])],
        triggers: vec![],
    });
    assert!(matches!(result, Err(EngineError::CycleDetected { .. })));
    assert_eq!(h.engine.list_workflows(PageRequest::default()).total_count, 0);
}

#[tokio::test]
async fn lifecycle_events_arrive_in_order() {
    let h = harness();
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "observed".into(),
            description: None,
            steps: vec![agent_step("a", &[])],
            triggers: vec![],
        })
        .unwrap();

    let mut rx = h.engine.subscribe();
    h.engine
        .start(wf.id, json!({}), StartMode::Sync)
        .await
        .unwrap();

    assert!(matches!(
        rx.recv().await.unwrap(),
        ExecutionEvent::ExecutionStarted { .. }
    ));
    assert!(matches!(
        rx.recv().await.unwrap(),
        ExecutionEvent::StepStarted { ref step_id, .. } if step_id == "a"
    ));
    assert!(matches!(
        rx.recv().await.unwrap(),
        ExecutionEvent::StepCompleted { ref step_id, .. } if step_id == "a"
    ));
    assert!(matches!(
        rx.recv().await.unwrap(),
        ExecutionEvent::ExecutionCompleted { .. }
    ));
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn schedule_trigger_fires_and_respects_the_concurrency_cap() {
    let h = harness_with(
        MockAgent::returning(json!({ "ok": true })).with_delay(Duration::from_millis(2500)),
        MockHttp::returning(json!(null)),
    );
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "cron".into(),
            description: None,
            steps: vec![agent_step("a", &[])],
            triggers: vec![TriggerConfig::Schedule {
                interval_ms: 1000,
                max_concurrent_runs: Some(1),
            }],
        })
        .unwrap();
    h.engine.activate(wf.id).unwrap();

    // Ticks at 1s (fires; run busy until 3.5s), 2s and 3s (skipped by the
    // cap).
    tokio::time::sleep(Duration::from_millis(3400)).await;
    let runs = h.engine.list_executions(wf.id, PageRequest::default());
    assert_eq!(runs.total_count, 1);

    // Pausing disarms the schedule; no further ticks fire.
    h.engine.pause(wf.id).unwrap();
    tokio::time::sleep(Duration::from_millis(3000)).await;
    let runs = h.engine.list_executions(wf.id, PageRequest::default());
    assert_eq!(runs.total_count, 1);
}

#[tokio::test]
async fn event_trigger_starts_a_run_with_the_payload_as_params() {
    let h = harness();
    let gate = WorkflowStep {
        id: "gate".into(),
        name: "Gate".into(),
        kind: StepKind::Conditional {
            predicate: "params.env".into(),
            if_true: Box::new(agent_step("then", &[])),
            if_false: None,
        },
        dependencies: vec![],
        timeout_ms: None,
        retry: None,
    };
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "on-deploy".into(),
            description: None,
            steps: vec![gate],
            triggers: vec![TriggerConfig::Event {
                event: "deploy.finished".into(),
            }],
        })
        .unwrap();
    h.engine.activate(wf.id).unwrap();

    h.source.emit("deploy.finished", json!({ "env": "prod" }));

    let mut started = None;
    for _ in 0..500 {
        let runs = h.engine.list_executions(wf.id, PageRequest::default());
        if let Some(run) = runs.items.first() {
            started = Some(run.id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let run = wait_terminal(&h.engine, started.expect("event trigger never fired")).await;

    assert_eq!(run.status, ExecutionStatus::Completed);
    // The predicate saw the payload, so the true branch ran.
    assert_eq!(run.results["gate"]["ok"], json!(true));
}

#[tokio::test]
async fn webhook_routes_while_armed_and_rejects_after_disarm() {
    let h = harness();
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "hooked".into(),
            description: None,
            steps: vec![agent_step("a", &[])],
            triggers: vec![TriggerConfig::Webhook {
                path: "/hooks/deploy".into(),
            }],
        })
        .unwrap();

    // Not armed yet: the route does not exist.
    assert!(matches!(
        h.engine.fire_webhook("/hooks/deploy", json!({})).await,
        Err(EngineError::UnknownWebhook(_))
    ));

    h.engine.activate(wf.id).unwrap();
    let run = h
        .engine
        .fire_webhook("/hooks/deploy", json!({ "ref": "main" }))
        .await
        .unwrap();
    let sealed = wait_terminal(&h.engine, run.id).await;
    assert_eq!(sealed.status, ExecutionStatus::Completed);

    h.engine.pause(wf.id).unwrap();
    assert!(matches!(
        h.engine.fire_webhook("/hooks/deploy", json!({})).await,
        Err(EngineError::UnknownWebhook(_))
    ));
}

#[tokio::test]
async fn delete_disarms_but_keeps_run_history_readable() {
    let h = harness();
    let wf = h
        .engine
        .create_workflow(NewWorkflow {
            name: "short-lived".into(),
            description: None,
            steps: vec![agent_step("a", &[])],
            triggers: vec![TriggerConfig::Webhook {
                path: "/hooks/x".into(),
            }],
        })
        .unwrap();
    h.engine.activate(wf.id).unwrap();

    let run = h
        .engine
        .start(wf.id, json!({}), StartMode::Sync)
        .await
        .unwrap();

    // Pause already disarmed; delete disarms again, which must be a no-op.
    h.engine.pause(wf.id).unwrap();
    h.engine.delete_workflow(wf.id).unwrap();
    assert!(matches!(
        h.engine.get_workflow(wf.id),
        Err(EngineError::WorkflowNotFound(_))
    ));
    assert!(matches!(
        h.engine.fire_webhook("/hooks/x", json!({})).await,
        Err(EngineError::UnknownWebhook(_))
    ));
    // The ledger outlives the definition.
    assert_eq!(
        h.engine.get_execution(run.id).unwrap().status,
        ExecutionStatus::Completed
    );
}
