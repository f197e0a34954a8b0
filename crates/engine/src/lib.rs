//! Workflow orchestration engine.
//!
//! Workflows are validated DAGs of typed steps. The scheduler launches every
//! step whose dependencies have succeeded, the executor runs each step
//! against externally supplied collaborators (agent fleet, HTTP, scripts,
//! expression evaluation), and each run is recorded in an in-memory ledger
//! with a broadcast stream of lifecycle events.
//!
//! The engine owns orchestration only: it never executes agent work,
//! scripts or HTTP itself — those arrive through the traits in the `agents`
//! crate.

pub mod context;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod trigger;

pub use error::{EngineError, StepError};
pub use events::{EventBus, ExecutionEvent};
pub use models::{
    ExecutionStatus, Page, PageRequest, RetryPolicy, StepFailure, StepKind, TriggerConfig,
    Workflow, WorkflowExecution, WorkflowStatus, WorkflowStep,
};
pub use scheduler::{ExecutionScheduler, SchedulerConfig, StartMode};
pub use service::{Collaborators, EngineConfig, NewWorkflow, WorkflowEngine};
pub use store::{RunLedger, WorkflowStore};

#[cfg(test)]
mod scheduler_tests;
