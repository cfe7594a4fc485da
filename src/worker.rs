//! Capability workers and the dispatch registry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Capability, WorkerOutput};

/// Typed failure returned by a worker or a data-source client
///
/// The transient/permanent split drives the retry controller: only transient
/// failures are retried, everything else surfaces as a failed task.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkerError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authorization failed: {0}")]
    Unauthorized(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

impl WorkerError {
    /// Whether the retry controller may retry this failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WorkerError::Timeout(_) | WorkerError::Connection(_) | WorkerError::RateLimited(_)
        )
    }

    /// Machine-readable failure class for task error records
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Timeout(_) => "timeout",
            WorkerError::Connection(_) => "connection",
            WorkerError::RateLimited(_) => "rate-limited",
            WorkerError::NotFound(_) => "not-found",
            WorkerError::Unauthorized(_) => "unauthorized",
            WorkerError::MalformedInput(_) => "malformed-input",
            WorkerError::ValidationFailed(_) => "validation-failed",
        }
    }
}

/// Whether re-executing a capability is safe without side effects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyKind {
    /// Pure read - retry freely
    PureRead,
    /// Creates external state - retry only after a negative
    /// `check_already_applied` probe
    Effectful,
}

/// A unit that executes one task
///
/// The orchestrator treats workers polymorphically: a capability identifier,
/// an execution function, and a declared idempotency property.
#[async_trait]
pub trait CapabilityWorker: Send + Sync {
    /// The capability tag this worker serves
    fn capability(&self) -> Capability;

    /// Declared idempotency property
    fn idempotency_kind(&self) -> IdempotencyKind {
        IdempotencyKind::PureRead
    }

    /// Execute one task given its structured input
    async fn execute(&self, input: serde_json::Value) -> Result<WorkerOutput, WorkerError>;

    /// For effectful capabilities: did a prior attempt for this subject
    /// already commit its side effect (fully or partially)?
    ///
    /// Pure-read workers never get asked.
    async fn check_already_applied(&self, _subject_key: &str) -> Result<bool, WorkerError> {
        Ok(false)
    }
}

/// External data-source client contract (e.g. the CRM API)
///
/// Implementations must classify failures as transient or permanent via
/// `WorkerError` so the retry controller can decide whether to retry.
#[async_trait]
pub trait DataSourceClient: Send + Sync {
    async fn fetch(
        &self,
        resource: &str,
        filters: serde_json::Value,
    ) -> Result<serde_json::Value, WorkerError>;

    async fn create(
        &self,
        resource: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, WorkerError>;
}

/// Closed dispatch table from capability tag to worker implementation
///
/// Validated at plan submission: a task whose tag has no registered worker is
/// an `InvalidPlan`, never a runtime routing decision.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<Capability, Arc<dyn CapabilityWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a worker under its declared capability
    pub fn register(&mut self, worker: Arc<dyn CapabilityWorker>) {
        self.workers.insert(worker.capability(), worker);
    }

    pub fn get(&self, capability: Capability) -> Option<Arc<dyn CapabilityWorker>> {
        self.workers.get(&capability).cloned()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.workers.contains_key(&capability)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Worker built from a closure, for embedding and tests
pub struct FnWorker<F> {
    capability: Capability,
    kind: IdempotencyKind,
    func: F,
}

impl<F> FnWorker<F>
where
    F: Fn(serde_json::Value) -> Result<WorkerOutput, WorkerError> + Send + Sync,
{
    pub fn new(capability: Capability, func: F) -> Self {
        Self {
            capability,
            kind: IdempotencyKind::PureRead,
            func,
        }
    }

    pub fn effectful(mut self) -> Self {
        self.kind = IdempotencyKind::Effectful;
        self
    }
}

#[async_trait]
impl<F> CapabilityWorker for FnWorker<F>
where
    F: Fn(serde_json::Value) -> Result<WorkerOutput, WorkerError> + Send + Sync,
{
    fn capability(&self) -> Capability {
        self.capability
    }

    fn idempotency_kind(&self) -> IdempotencyKind {
        self.kind
    }

    async fn execute(&self, input: serde_json::Value) -> Result<WorkerOutput, WorkerError> {
        (self.func)(input)
    }
}
