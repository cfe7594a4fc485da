//! # Tally
//!
//! Task orchestration and reconciliation engine - the bean counter.
//!
//! Tally takes a dependency-ordered plan of capability-tagged tasks,
//! dispatches them in parallel batches to registered workers, reconciles the
//! values they surface against a system of record, and refuses to finish
//! until every discrepancy is resolved and every generated invoice has been
//! independently verified. When a decision needs a human, the run suspends,
//! escalates, and resumes where it left off.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌──────────────┐  ┌───────────────┐  ┌────────────────────────┐    │
//! │  │ Plan Admitter│  │ Batch Dispatch│  │ Result Folder (id order)│   │
//! │  └──────────────┘  └───────┬───────┘  └────────────────────────┘    │
//! └────────────────────────────┼────────────────────────────────────────┘
//!                              │ retry / breaker / idempotency gate
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │   Worker    │     │   Worker    │     │   Worker    │
//!   │  (query)    │     │ (generate)  │     │  (verify)   │
//!   └──────┬──────┘     └──────┬──────┘     └──────┬──────┘
//!          │ comparisons       │ totals            │ read-back
//!          ▼                   ▼                   ▼
//!   ┌─────────────────────────────────────────────────────┐
//!   │  Reconcile Engine ──▶ Escalations ──▶ Final Report  │
//!   └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Plan**: A validated DAG of capability-tagged tasks
//! - **Worker**: One executor per capability, with a declared idempotency kind
//! - **Discrepancy**: An authoritative-vs-reported value pair outside tolerance
//! - **Escalation**: A suspended decision point awaiting human input
//! - **Report**: The auditable summary a run produces when it finishes

pub mod channel;
pub mod error;
pub mod escalation;
pub mod orchestrator;
pub mod plan;
pub mod reconcile;
pub mod retry;
pub mod state;
pub mod types;
pub mod worker;

pub use channel::{ChannelPair, EngineChannel, Event};
pub use error::EngineError;
pub use escalation::{
    Escalation, EscalationManager, EscalationReason, EscalationStatus, HumanChannel,
};
pub use orchestrator::{EngineConfig, Orchestrator, RunHandle};
pub use plan::{Plan, Planner};
pub use reconcile::{Classification, Discrepancy, ReconcileEngine, ResolutionStatus, TolerancePolicy};
pub use retry::{BreakerRegistry, RetryController, RetryError, RetryPolicy};
pub use state::{Report, WorkflowState};
pub use types::{
    Capability, Comparison, EscalationId, InputRequest, InvoiceTotals, RunId, RunState, RunStatus,
    SideEffect, Task, TaskId, TaskSpec, TaskStatus, ValueKind, WorkerOutput,
};
pub use worker::{
    CapabilityWorker, DataSourceClient, FnWorker, IdempotencyKind, WorkerError, WorkerRegistry,
};
