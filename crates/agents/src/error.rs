//! Collaborator-level error types.

use thiserror::Error;

/// Errors returned by [`crate::AgentDispatcher::dispatch`].
///
/// The engine uses the variant to decide retry behaviour:
/// - `Timeout` / `Failed` — transient, retried per the step's retry policy.
/// - `NoCapability` — no agent can ever serve this step; fails immediately.
#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    /// No registered agent advertises the requested capability.
    #[error("no agent with capability '{0}'")]
    NoCapability(String),

    /// The agent did not report a result within the allotted time.
    #[error("agent dispatch timed out")]
    Timeout,

    /// The agent accepted the command but reported a failure.
    #[error("agent dispatch failed: {0}")]
    Failed(String),
}

impl DispatchError {
    /// Whether the engine should consider re-dispatching.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::NoCapability(_))
    }
}

/// Errors returned by the outbound-call collaborators
/// ([`crate::HttpCaller`] and [`crate::ScriptRunner`]).
#[derive(Debug, Error, Clone)]
pub enum CallError {
    /// The call did not complete within the engine-imposed timeout.
    #[error("call timed out")]
    Timeout,

    /// The call completed with an error.
    #[error("call failed: {0}")]
    Failed(String),
}

/// Error returned by [`crate::ExpressionEvaluator::evaluate`].
///
/// Predicate evaluation is expected to be pure, so a failure here is a
/// definition problem, never a transient one — the engine does not retry it.
#[derive(Debug, Error, Clone)]
#[error("expression error: {0}")]
pub struct EvalError(pub String);
