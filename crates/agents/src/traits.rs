//! The collaborator traits — the contract between the engine and the world.
//!
//! Defined here (outside the engine crate) so hosts can implement them
//! without pulling in the scheduler, and so the engine can be tested against
//! the mocks in [`crate::mock`] without a circular dependency.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{CallError, DispatchError, EvalError};

/// Dispatches a unit of work to an agent selected by capability.
///
/// The engine is capability-addressed, never instance-addressed: which
/// concrete agent serves a `capability` — and how ties are broken when
/// several match — is entirely the implementor's concern. Idempotency of
/// dispatched actions is likewise the implementor's responsibility; the
/// engine may re-dispatch after a timeout.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Send `action` with `params` to an agent advertising `capability` and
    /// await its result, giving up after `timeout`.
    async fn dispatch(
        &self,
        capability: &str,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError>;
}

/// Evaluates a boolean predicate against a JSON context.
///
/// Used only by conditional steps. Implementations must be pure and
/// side-effect free from the engine's perspective.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<bool, EvalError>;
}

/// Performs one outbound HTTP request.
#[async_trait]
pub trait HttpCaller: Send + Sync {
    /// Issue `method url` with an optional JSON body; the engine imposes
    /// `timeout` independently of any transport-level default.
    async fn call(
        &self,
        method: &str,
        url: &str,
        payload: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, CallError>;
}

/// Runs a script in an external sandbox.
///
/// The engine never executes untrusted code in-process; `source` is handed
/// to the sandbox verbatim together with a read-only JSON view of the run.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(
        &self,
        source: &str,
        context: &Value,
        timeout: Duration,
    ) -> Result<Value, CallError>;
}

/// A named-event surface the trigger manager can subscribe to.
///
/// The returned receiver *is* the subscription handle: dropping it releases
/// the subscription. The trigger manager owns the receiver inside the armed
/// trigger's task, so disarming the trigger drops it exactly once.
pub trait EventSource: Send + Sync {
    fn subscribe(&self, event: &str) -> mpsc::Receiver<Value>;
}
