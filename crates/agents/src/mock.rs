//! Mock collaborators — test doubles for every trait in [`crate::traits`].
//!
//! Useful in unit and integration tests where a real agent fleet, HTTP
//! stack or script sandbox is unavailable or irrelevant. The CLI's `run`
//! command also wires these in so a workflow file can be executed end-to-end
//! without any external services.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::error::{CallError, DispatchError, EvalError};
use crate::traits::{
    AgentDispatcher, EventSource, ExpressionEvaluator, HttpCaller, ScriptRunner,
};

// ---------------------------------------------------------------------------
// MockAgent
// ---------------------------------------------------------------------------

/// Behaviour injected into [`MockAgent`] at construction time.
pub enum AgentBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with [`DispatchError::Timeout`].
    TimeOut,
    /// Fail with [`DispatchError::Failed`].
    Fail(String),
    /// Fail with [`DispatchError::Failed`] for the first `n` calls, then
    /// return the value. Exercises retry policies.
    FailThenSucceed { remaining: Mutex<u32>, value: Value },
}

/// One recorded dispatch.
#[derive(Debug, Clone)]
pub struct DispatchCall {
    pub capability: String,
    pub action: String,
    pub params: Value,
}

/// A mock dispatcher that records every call it receives and returns a
/// programmer-specified result, optionally after a simulated latency.
pub struct MockAgent {
    behaviour: AgentBehaviour,
    /// Simulated dispatch latency (uses the tokio clock, so paused-time
    /// tests auto-advance through it).
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<DispatchCall>>>,
}

impl MockAgent {
    /// Create a mock that always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self::with_behaviour(AgentBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a dispatch error.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::with_behaviour(AgentBehaviour::Fail(msg.into()))
    }

    /// Create a mock that always times out.
    pub fn timing_out() -> Self {
        Self::with_behaviour(AgentBehaviour::TimeOut)
    }

    /// Create a mock that fails `failures` times, then succeeds with `value`.
    pub fn flaky(failures: u32, value: Value) -> Self {
        Self::with_behaviour(AgentBehaviour::FailThenSucceed {
            remaining: Mutex::new(failures),
            value,
        })
    }

    fn with_behaviour(behaviour: AgentBehaviour) -> Self {
        Self {
            behaviour,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a simulated per-dispatch latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of dispatches this mock has received.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// All recorded dispatches, in call order.
    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentDispatcher for MockAgent {
    async fn dispatch(
        &self,
        capability: &str,
        action: &str,
        params: Value,
        _timeout: Duration,
    ) -> Result<Value, DispatchError> {
        self.calls.lock().unwrap().push(DispatchCall {
            capability: capability.to_owned(),
            action: action.to_owned(),
            params: params.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behaviour {
            AgentBehaviour::ReturnValue(v) => Ok(describe(capability, action, v)),
            AgentBehaviour::TimeOut => Err(DispatchError::Timeout),
            AgentBehaviour::Fail(msg) => Err(DispatchError::Failed(msg.clone())),
            AgentBehaviour::FailThenSucceed { remaining, value } => {
                let mut left = remaining.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    Err(DispatchError::Failed("transient failure".into()))
                } else {
                    Ok(describe(capability, action, value))
                }
            }
        }
    }
}

/// Merge the mock's canned value with the capability/action it was asked
/// for, so tests can trace which dispatch produced which output.
fn describe(capability: &str, action: &str, value: &Value) -> Value {
    let mut out = json!({ "capability": capability, "action": action });
    if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
        for (k, val) in v_obj {
            out_obj.insert(k.clone(), val.clone());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Evaluators
// ---------------------------------------------------------------------------

/// An evaluator that ignores the expression and always returns a fixed
/// verdict.
pub struct StaticEvaluator(pub bool);

impl ExpressionEvaluator for StaticEvaluator {
    fn evaluate(&self, _expression: &str, _context: &Value) -> Result<bool, EvalError> {
        Ok(self.0)
    }
}

/// An evaluator that treats the expression as a dotted path into the
/// context (`params.flag`, `results.step_a.ok`) and returns the truthiness
/// of the value found there. A missing path is `false`; an empty expression
/// is an error.
pub struct KeyEvaluator;

impl ExpressionEvaluator for KeyEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, EvalError> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(EvalError("empty expression".into()));
        }

        let mut current = context;
        for segment in expr.split('.') {
            match current.get(segment) {
                Some(v) => current = v,
                None => return Ok(false),
            }
        }

        Ok(match current {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(_) => true,
        })
    }
}

// ---------------------------------------------------------------------------
// MockHttp / MockScript
// ---------------------------------------------------------------------------

/// A canned HTTP collaborator.
pub struct MockHttp {
    response: Result<Value, CallError>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockHttp {
    pub fn returning(response: Value) -> Self {
        Self {
            response: Ok(response),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(msg: impl Into<String>) -> Self {
        Self {
            response: Err(CallError::Failed(msg.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `(method, url)` pairs seen so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpCaller for MockHttp {
    async fn call(
        &self,
        method: &str,
        url: &str,
        _payload: Option<&Value>,
        _timeout: Duration,
    ) -> Result<Value, CallError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_owned(), url.to_owned()));
        self.response.clone()
    }
}

/// A script "sandbox" that echoes its context back, tagged with the source
/// it was handed. Good enough to assert the engine delegated rather than
/// evaluated.
pub struct MockScript;

#[async_trait]
impl ScriptRunner for MockScript {
    async fn run(
        &self,
        source: &str,
        context: &Value,
        _timeout: Duration,
    ) -> Result<Value, CallError> {
        Ok(json!({ "source": source, "context": context }))
    }
}

// ---------------------------------------------------------------------------
// InMemoryEventSource
// ---------------------------------------------------------------------------

/// An in-process event surface: `emit` on one side, [`EventSource`]
/// subscriptions on the other.
///
/// Each event name owns a broadcast channel; `subscribe` bridges it onto an
/// `mpsc` receiver via a forwarding task, so dropping the receiver tears the
/// bridge down and releases the subscription.
pub struct InMemoryEventSource {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `payload` under `event`. A no-op with no subscribers.
    pub fn emit(&self, event: &str, payload: Value) {
        let sender = self.sender_for(event);
        let _ = sender.send(payload);
    }

    fn sender_for(&self, event: &str) -> broadcast::Sender<Value> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(event.to_owned())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl Default for InMemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for InMemoryEventSource {
    fn subscribe(&self, event: &str) -> mpsc::Receiver<Value> {
        let mut upstream = self.sender_for(event).subscribe();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break; // subscriber dropped its receiver
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
