//! `agents` crate — the collaborator traits the engine executes against.
//!
//! The engine never talks to the outside world directly: agent dispatch,
//! predicate evaluation, outbound HTTP, script sandboxing, and event
//! subscriptions all go through the trait objects defined here. The engine
//! crate depends on these seams; production hosts and tests plug in their
//! own implementations.

pub mod error;
pub mod traits;
pub mod mock;

pub use error::{CallError, DispatchError, EvalError};
pub use traits::{AgentDispatcher, EventSource, ExpressionEvaluator, HttpCaller, ScriptRunner};
