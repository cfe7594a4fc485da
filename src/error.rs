//! Engine error types

use thiserror::Error;

use crate::types::{Capability, EscalationId, RunId, RunState};
use crate::worker::WorkerError;

/// Errors surfaced by the engine API.
///
/// Circuit-open and duplicate-risk conditions are per-task outcomes, not API
/// errors: they surface through [`RetryError`](crate::retry::RetryError) and
/// the task's failure record. Escalation timeouts surface through
/// [`RunStatus::Parked`](crate::types::RunStatus) and the final report.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural plan error - cyclic dependencies, unknown capability,
    /// duplicate or unknown task ids. Fatal; the run never starts.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// No run registered under this handle
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// No escalation registered under this id
    #[error("escalation not found: {0}")]
    EscalationNotFound(EscalationId),

    /// Operation not legal in the run's current state
    #[error("cannot {action} while run is {state:?}")]
    InvalidTransition {
        state: RunState,
        action: &'static str,
    },

    /// Worker failure that was not (or could no longer be) retried
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// No worker registered for this capability
    #[error("no worker registered for capability {0}")]
    NoWorker(Capability),

    /// A resume payload was already applied for this escalation
    #[error("escalation already resolved: {0}")]
    AlreadyResolved(EscalationId),

    /// Event channel closed
    #[error("channel error: {0}")]
    Channel(String),

    /// Snapshot serialization failed
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}
