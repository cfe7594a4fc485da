//! Core protocol types shared across the engine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one run of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EscalationId(Uuid);

impl EscalationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EscalationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EscalationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier returned by the human-input channel for a sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier for a task within a plan
///
/// Task ids are assigned by the planner, not generated, because the planner
/// authors the dependency edges between them. Result folding and discrepancy
/// derivation happen in task-id order, so ids double as the deterministic
/// ordering key within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Capability tag - which worker class handles a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Free-form data query against the CRM
    Query,
    /// Cross-checking fetched data against declared data
    Validation,
    /// Invoice generation (effectful)
    InvoiceGeneration,
    /// Post-generation invoice verification (read-back)
    InvoiceVerification,
    /// Worker/personnel lookup
    Resource,
    /// Timesheet (CRA) lookup
    Timesheet,
    /// Project lookup
    Project,
}

impl Capability {
    /// Capabilities that create external state and must be paired with a
    /// verification dependent before a run may finalize.
    pub fn is_generation(&self) -> bool {
        matches!(self, Capability::InvoiceGeneration)
    }

    pub fn is_verification(&self) -> bool {
        matches!(self, Capability::InvoiceVerification)
    }

    /// The verification capability paired with a generation capability
    pub fn paired_verification(&self) -> Option<Capability> {
        match self {
            Capability::InvoiceGeneration => Some(Capability::InvoiceVerification),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Query => "query",
            Capability::Validation => "validation",
            Capability::InvoiceGeneration => "invoice-generation",
            Capability::InvoiceVerification => "invoice-verification",
            Capability::Resource => "resource",
            Capability::Timesheet => "timesheet",
            Capability::Project => "project",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    AwaitingInput,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// What kind of value a comparison is over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueKind {
    /// Worked days in a billing period (CRA days)
    DayCount,
    /// Monetary amount
    Monetary,
}

/// A value pair a worker surfaced for reconciliation
///
/// `authoritative` is what the system of record holds, `reported` is what the
/// external request declared for the same subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Subject key, e.g. "LEGUAY Elodie/Modernisation/2025-09"
    pub subject: String,
    pub kind: ValueKind,
    pub authoritative: f64,
    pub reported: f64,
    /// Warnings the data source attached to the authoritative value
    /// (e.g. unvalidated timesheet). A nonzero difference inside the soft
    /// threshold only downgrades to `Warned` when these are present.
    pub warnings: Vec<String>,
}

/// Invoice totals, as declared by a generation task or read back by its
/// paired verification task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub count: u32,
    pub total_amount: f64,
}

impl InvoiceTotals {
    /// Exact comparison for the generation/verification cross-check; only
    /// sub-cent amount noise is tolerated
    pub fn matches(&self, other: &InvoiceTotals) -> bool {
        self.count == other.count && (self.total_amount - other.total_amount).abs() < 0.005
    }
}

/// Signal that a task cannot proceed without external human input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequest {
    pub reason: String,
    pub context: serde_json::Value,
}

/// Structured result of one successful worker execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Opaque result data, folded into the workflow state as-is
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Value pairs to route through the reconciliation engine
    #[serde(default)]
    pub comparisons: Vec<Comparison>,
    /// Source-level warnings, merged into each surfaced comparison before
    /// classification (e.g. an unvalidated timesheet downgrades an in-soft
    /// difference to warned)
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Invoice totals: declared by generation, observed by verification
    #[serde(default)]
    pub invoices: Option<InvoiceTotals>,
    /// Set when the task needs human input before the run can continue
    #[serde(default)]
    pub needs_input: Option<InputRequest>,
}

impl WorkerOutput {
    /// A plain success carrying only a payload
    pub fn payload(value: serde_json::Value) -> Self {
        Self {
            payload: value,
            ..Default::default()
        }
    }
}

/// Record of a failed task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Machine-readable failure class, e.g. "timeout", "not-found",
    /// "circuit-open", "duplicate-risk"
    pub kind: String,
    pub message: String,
}

/// A single task in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Narrative description - metadata only, never parsed for control flow
    pub description: String,
    pub capability: Capability,
    pub depends_on: Vec<TaskId>,
    pub status: TaskStatus,
    /// Structured input payload for the worker
    pub input: serde_json::Value,
    /// Subject key for circuit breaking and idempotency probes
    pub subject: Option<String>,
    /// Treat `skipped` dependencies as satisfied
    pub tolerate_skipped: bool,
    /// Whether re-execution is side-effect free; derived from the worker's
    /// declared idempotency kind at submission
    pub idempotent: bool,
    pub result: Option<WorkerOutput>,
    pub error: Option<TaskFailure>,
    /// Retries consumed by the retry controller (attempts - 1)
    pub retries: u32,
}

/// Task shape as produced by the external planner, before admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub description: String,
    pub capability: Capability,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub tolerate_skipped: bool,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, capability: Capability) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            capability,
            depends_on: Vec::new(),
            input: serde_json::Value::Null,
            subject: None,
            tolerate_skipped: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl Task {
    /// Admit a planner-produced spec into a run
    pub fn from_spec(spec: TaskSpec, idempotent: bool) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            capability: spec.capability,
            depends_on: spec.depends_on,
            status: TaskStatus::Pending,
            input: spec.input,
            subject: spec.subject,
            tolerate_skipped: spec.tolerate_skipped,
            idempotent,
            result: None,
            error: None,
            retries: 0,
        }
    }

    /// Breaker/idempotency key: capability plus subject
    pub fn subject_key(&self) -> String {
        match &self.subject {
            Some(s) => format!("{}/{}", self.capability, s),
            None => format!("{}/{}", self.capability, self.id),
        }
    }
}

/// Committed external side effect, kept for idempotency checks and reporting
///
/// Side effects are never rolled back on abort; they are reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SideEffect {
    EmailSent {
        recipient: String,
        message_id: MessageId,
        at: DateTime<Utc>,
    },
    InvoiceGenerated {
        subject: String,
        invoice_id: String,
        amount: f64,
        at: DateTime<Utc>,
    },
    Other {
        description: String,
        at: DateTime<Utc>,
    },
}

/// State-machine states of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// Plan admitted, nothing dispatched yet
    Submitted,
    Scheduling,
    Executing,
    /// Parked on one or more pending escalations; re-entrant
    AwaitingInput,
    Reconciling,
    Finalizing,
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }
}

/// Status returned to the caller after each `advance` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RunStatus {
    /// More ready tasks remain; call `advance` again
    InProgress { completed: usize, remaining: usize },
    /// Parked on pending escalations; call `resume` with a response
    AwaitingInput { pending: Vec<EscalationId> },
    /// Escalations timed out after their single reminder; the run stays
    /// parked until resumed or aborted
    Parked { timed_out: Vec<EscalationId> },
    /// Every task is terminal and nothing is pending; call `finalize`
    ReadyToFinalize,
    Done,
    Aborted,
}
