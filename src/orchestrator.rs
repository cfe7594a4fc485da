//! Main orchestrator - drives plans through supervised runs
//!
//! Each run is a single-threaded state machine: all mutation of its
//! `WorkflowState` happens under the run's async mutex, in one `advance` or
//! `resume` call at a time. Parallelism exists only inside a dispatch batch,
//! and batch results are folded back in task-id order so identical inputs
//! yield identical reports.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelPair, EngineChannel, Event};
use crate::error::EngineError;
use crate::escalation::{EscalationManager, EscalationReason};
use crate::plan::Plan;
use crate::reconcile::{Classification, ReconcileEngine, TolerancePolicy};
use crate::retry::{BreakerRegistry, RetryController, RetryError, RetryOutcome, RetryPolicy};
use crate::state::{Report, WorkflowState};
use crate::types::{
    Comparison, EscalationId, RunId, RunState, RunStatus, SideEffect, Task, TaskFailure, TaskId,
    TaskStatus, WorkerOutput,
};
use crate::worker::{IdempotencyKind, WorkerRegistry};

/// Engine-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker-pool concurrency limit for one dispatch batch, shared across
    /// runs
    pub max_parallel_tasks: usize,
    pub retry: RetryPolicy,
    pub tolerance: TolerancePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 4,
            retry: RetryPolicy::default(),
            tolerance: TolerancePolicy::default(),
        }
    }
}

/// Handle to one run for external interaction
///
/// The async mutex is what guarantees at-most-one driving operation per run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: RunId,
    state: Arc<Mutex<WorkflowState>>,
}

impl RunHandle {
    fn new(state: WorkflowState) -> Self {
        Self {
            id: state.run_id,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    /// Serialize the run for restart-safe parking
    pub async fn snapshot(&self) -> Result<String, EngineError> {
        self.state.lock().await.snapshot()
    }

    /// Inspect state under the run lock
    pub async fn with_state<R>(&self, f: impl FnOnce(&WorkflowState) -> R) -> R {
        f(&*self.state.lock().await)
    }

    #[cfg(test)]
    pub(crate) async fn with_state_mut<R>(&self, f: impl FnOnce(&mut WorkflowState) -> R) -> R {
        f(&mut *self.state.lock().await)
    }
}

/// The task orchestration and reconciliation engine
pub struct Orchestrator {
    /// Active runs
    runs: parking_lot::RwLock<HashMap<RunId, RunHandle>>,
    /// Closed capability dispatch table
    registry: Arc<WorkerRegistry>,
    retry: RetryController,
    reconcile: ReconcileEngine,
    escalations: EscalationManager,
    /// Worker-pool limiter shared across runs
    limiter: Arc<Semaphore>,
    /// Channel for emitting events
    event_tx: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl Orchestrator {
    /// Create a new orchestrator with the given channel pair
    pub fn new(
        registry: Arc<WorkerRegistry>,
        escalations: EscalationManager,
        config: EngineConfig,
        channels: ChannelPair,
    ) -> Self {
        Self {
            runs: parking_lot::RwLock::new(HashMap::new()),
            registry,
            retry: RetryController::new(config.retry, Arc::new(BreakerRegistry::new())),
            reconcile: ReconcileEngine::new(config.tolerance),
            escalations,
            limiter: Arc::new(Semaphore::new(config.max_parallel_tasks.max(1))),
            event_tx: channels.event_tx,
        }
    }

    /// Create an orchestrator and return a channel for observing it
    pub fn with_channel(
        registry: Arc<WorkerRegistry>,
        escalations: EscalationManager,
        config: EngineConfig,
    ) -> (Self, EngineChannel) {
        let (channel, pair) = EngineChannel::new();
        (Self::new(registry, escalations, config, pair), channel)
    }

    /// Admit a plan and create a run.
    ///
    /// Augments missing generation/verification pairings, then validates
    /// structure; a cyclic, dangling, or unroutable plan fails with
    /// `InvalidPlan` and the run never starts.
    #[instrument(skip(self, plan), fields(summary = %plan.summary))]
    pub fn submit(&self, mut plan: Plan) -> Result<RunHandle, EngineError> {
        let appended = plan.ensure_verification_pairing();
        if !appended.is_empty() {
            debug!(appended = appended.len(), "augmented plan with verification tasks");
        }
        plan.validate(&self.registry)?;

        let run_id = RunId::new();
        let tasks: Vec<Task> = plan
            .tasks()
            .iter()
            .cloned()
            .map(|spec| {
                let idempotent = self
                    .registry
                    .get(spec.capability)
                    .map(|w| w.idempotency_kind() == IdempotencyKind::PureRead)
                    .unwrap_or(false);
                Task::from_spec(spec, idempotent)
            })
            .collect();

        let task_count = tasks.len();
        let mut state = WorkflowState::new(run_id, plan.summary.clone(), tasks);
        state.state = RunState::Scheduling;

        let handle = RunHandle::new(state);
        self.runs.write().insert(run_id, handle.clone());

        let _ = self.event_tx.send(Event::RunSubmitted {
            run_id,
            tasks: task_count,
        });
        info!(run_id = %run_id, tasks = task_count, "run submitted");
        Ok(handle)
    }

    /// Re-register a parked run from a snapshot (e.g. after restart)
    pub fn restore(&self, snapshot: &str) -> Result<RunHandle, EngineError> {
        let state = WorkflowState::restore(snapshot)?;
        let handle = RunHandle::new(state);
        self.runs.write().insert(handle.id(), handle.clone());
        info!(run_id = %handle.id(), "run restored from snapshot");
        Ok(handle)
    }

    /// Get a run by id
    pub fn get_run(&self, id: &RunId) -> Result<RunHandle, EngineError> {
        self.runs
            .read()
            .get(id)
            .cloned()
            .ok_or(EngineError::RunNotFound(*id))
    }

    /// Get all run ids
    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.read().keys().copied().collect()
    }

    /// Drive the run one step: sweep escalation deadlines, dispatch the
    /// current batch of ready tasks, fold results, and route comparisons and
    /// input requests.
    #[instrument(skip(self, handle), fields(run_id = %handle.id()))]
    pub async fn advance(&self, handle: &RunHandle) -> Result<RunStatus, EngineError> {
        let mut state = handle.state.lock().await;

        match state.state {
            RunState::Done => return Ok(RunStatus::Done),
            RunState::Aborted => return Ok(RunStatus::Aborted),
            _ => {}
        }

        let now = Utc::now();
        let (effects, timed_out) = self
            .escalations
            .check_timeouts(&mut state.escalations, now)
            .await;
        for effect in effects {
            state.record_side_effect(effect);
        }
        if !timed_out.is_empty() {
            state.state = RunState::AwaitingInput;
            return Ok(RunStatus::Parked { timed_out });
        }

        let pending = state.pending_escalations();
        if !pending.is_empty() {
            state.state = RunState::AwaitingInput;
            return Ok(RunStatus::AwaitingInput { pending });
        }
        let stale = state.timed_out_escalations();
        if !stale.is_empty() {
            state.state = RunState::AwaitingInput;
            return Ok(RunStatus::Parked { timed_out: stale });
        }

        self.cascade_unreachable(&mut state);

        state.state = RunState::Scheduling;
        let batch = state.ready_tasks();
        if batch.is_empty() {
            return Ok(self.derive_status(&mut state));
        }

        // Ready tasks share no dependency relationship (their dependencies
        // are already terminal), so the whole set is one dispatch batch.
        // Marking them running here excludes them from later batches, so no
        // task is ever in flight twice.
        state.state = RunState::Executing;
        let mut join = JoinSet::new();
        for task_id in &batch {
            let (worker, subject_key, input) = {
                let task = state.task_mut(task_id).ok_or_else(|| {
                    EngineError::InvalidPlan(format!("ready task {task_id} vanished"))
                })?;
                task.status = TaskStatus::Running;
                let worker = self
                    .registry
                    .get(task.capability)
                    .ok_or_else(|| EngineError::NoWorker(task.capability))?;
                (worker, task.subject_key(), task.input.clone())
            };
            let _ = self.event_tx.send(Event::TaskStarted {
                run_id: state.run_id,
                task: task_id.clone(),
            });

            let controller = self.retry.clone();
            let limiter = self.limiter.clone();
            let id = task_id.clone();
            join.spawn(async move {
                let permit = limiter.acquire_owned().await;
                let result = match permit {
                    Ok(_permit) => controller.execute(&worker, &subject_key, input).await,
                    Err(_) => Err(RetryError::Permanent(
                        crate::worker::WorkerError::ValidationFailed(
                            "worker pool shut down".into(),
                        ),
                    )),
                };
                (id, result)
            });
        }

        let mut results = Vec::with_capacity(batch.len());
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => return Err(EngineError::Channel(format!("batch task panicked: {e}"))),
            }
        }
        // Fold in task-id order regardless of which task finished first
        results.sort_by(|a, b| a.0.cmp(&b.0));

        state.state = RunState::Reconciling;
        for (task_id, result) in results {
            self.fold_result(&mut state, task_id, result).await?;
        }

        Ok(self.derive_status(&mut state))
    }

    /// Deliver an external response to a pending escalation and re-enter
    /// scheduling.
    ///
    /// The payload is applied to workflow state exactly once: it resolves
    /// the attached discrepancy (if any) and completes the task that was
    /// awaiting input (if any).
    #[instrument(skip(self, handle, payload), fields(run_id = %handle.id()))]
    pub async fn resume(
        &self,
        handle: &RunHandle,
        escalation_id: EscalationId,
        payload: serde_json::Value,
    ) -> Result<RunStatus, EngineError> {
        let mut state = handle.state.lock().await;

        if state.state.is_terminal() {
            return Err(EngineError::InvalidTransition {
                state: state.state,
                action: "resume",
            });
        }

        let run_id = state.run_id;
        let esc = state
            .escalation_mut(escalation_id)
            .ok_or(EngineError::EscalationNotFound(escalation_id))?;
        esc.resolve(payload)?;
        let payload = match esc.take_resume_payload() {
            Some(p) => p,
            None => return Err(EngineError::AlreadyResolved(escalation_id)),
        };
        let subject = esc.subject.clone();
        let task_id = esc.task.clone();

        let _ = self.event_tx.send(Event::EscalationResolved {
            run_id,
            escalation: escalation_id,
        });
        info!(run_id = %run_id, escalation_id = %escalation_id, "escalation resolved");

        // Re-derive the attached discrepancy with the agreed value
        if let Some(subject) = subject {
            if let Some(d) = state.discrepancies.get_mut(&subject) {
                let value = payload
                    .get("resolved_value")
                    .and_then(|v| v.as_f64())
                    .or_else(|| payload.as_f64())
                    .unwrap_or(d.authoritative);
                d.resolve(value);
            }
        }

        // Complete the task that was suspended on this input
        if let Some(task_id) = task_id {
            if let Some(task) = state.task_mut(&task_id) {
                if task.status == TaskStatus::AwaitingInput {
                    task.status = TaskStatus::Succeeded;
                    task.result = Some(WorkerOutput::payload(payload.clone()));
                    let _ = self.event_tx.send(Event::TaskFinished {
                        run_id,
                        task: task_id,
                        status: TaskStatus::Succeeded,
                    });
                }
            }
        }

        state.state = RunState::Scheduling;
        Ok(self.derive_status(&mut state))
    }

    /// Produce the final report and mark the run done.
    ///
    /// Legal only when every task is terminal, no escalation blocks, no
    /// discrepancy is unresolved, and every succeeded generation task has a
    /// succeeded, matching (or explicitly signed-off) verification dependent.
    #[instrument(skip(self, handle), fields(run_id = %handle.id()))]
    pub async fn finalize(&self, handle: &RunHandle) -> Result<Report, EngineError> {
        let mut state = handle.state.lock().await;

        if let (RunState::Done, Some(report)) = (state.state, state.report.as_ref()) {
            return Ok(report.clone());
        }
        if state.state == RunState::Aborted {
            return Err(EngineError::InvalidTransition {
                state: state.state,
                action: "finalize",
            });
        }

        if !state.all_terminal() {
            return Err(EngineError::InvalidTransition {
                state: state.state,
                action: "finalize with non-terminal tasks",
            });
        }
        if state.has_blocking_escalations() {
            return Err(EngineError::InvalidTransition {
                state: state.state,
                action: "finalize with open escalations",
            });
        }
        if !state.blocking_discrepancies().is_empty() {
            return Err(EngineError::InvalidTransition {
                state: state.state,
                action: "finalize with unresolved discrepancies",
            });
        }
        self.check_verification_pairs(&state)?;

        state.state = RunState::Finalizing;
        let report = state.build_report(false, Utc::now());
        state.report = Some(report.clone());
        state.state = RunState::Done;

        let _ = self.event_tx.send(Event::RunFinalized {
            run_id: state.run_id,
        });
        info!(run_id = %state.run_id, "run finalized");
        Ok(report)
    }

    /// Abort the run: cancel open escalations, skip unfinished tasks, and
    /// report. Committed side effects are reported, never rolled back.
    #[instrument(skip(self, handle), fields(run_id = %handle.id()))]
    pub async fn abort(&self, handle: &RunHandle) -> Result<Report, EngineError> {
        let mut state = handle.state.lock().await;

        if let (RunState::Aborted, Some(report)) = (state.state, state.report.as_ref()) {
            return Ok(report.clone());
        }
        if state.state == RunState::Done {
            return Err(EngineError::InvalidTransition {
                state: state.state,
                action: "abort",
            });
        }

        for esc in state.escalations.iter_mut() {
            esc.cancel();
        }

        let run_id = state.run_id;
        let unfinished: Vec<TaskId> = state
            .tasks()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for task_id in unfinished {
            if let Some(task) = state.task_mut(&task_id) {
                task.status = TaskStatus::Skipped;
            }
            let _ = self.event_tx.send(Event::TaskFinished {
                run_id,
                task: task_id,
                status: TaskStatus::Skipped,
            });
        }

        state.state = RunState::Aborted;
        let report = state.build_report(true, Utc::now());
        state.report = Some(report.clone());

        let _ = self.event_tx.send(Event::RunAborted { run_id });
        warn!(run_id = %run_id, "run aborted");
        Ok(report)
    }

    // === Internals ===

    /// Generation success alone never unlocks finalization: the paired
    /// verification must succeed and its read-back must match what
    /// generation declared, unless the mismatch escalation was resolved.
    fn check_verification_pairs(&self, state: &WorkflowState) -> Result<(), EngineError> {
        for (generation, verification) in state.verification_pairs() {
            if generation.status != TaskStatus::Succeeded {
                continue;
            }
            let Some(verification) = verification else {
                return Err(EngineError::InvalidTransition {
                    state: state.state,
                    action: "finalize generation without verification pair",
                });
            };
            if verification.status != TaskStatus::Succeeded {
                return Err(EngineError::InvalidTransition {
                    state: state.state,
                    action: "finalize with unverified generation",
                });
            }

            let declared = generation.result.as_ref().and_then(|r| r.invoices);
            let observed = verification.result.as_ref().and_then(|r| r.invoices);
            let Some(declared) = declared else {
                continue;
            };
            if matches!(observed, Some(o) if declared.matches(&o)) {
                continue;
            }

            let signed_off = state.escalations.iter().any(|e| {
                e.reason == EscalationReason::GenerationVerificationMismatch
                    && e.task.as_ref() == Some(&verification.id)
                    && e.status == crate::escalation::EscalationStatus::Resolved
            });
            if !signed_off {
                return Err(EngineError::InvalidTransition {
                    state: state.state,
                    action: "finalize with generation-verification mismatch",
                });
            }
        }
        Ok(())
    }

    /// Skip pending tasks whose dependencies can no longer be satisfied, so
    /// a failed branch still lets the run reach a terminal state.
    fn cascade_unreachable(&self, state: &mut WorkflowState) {
        loop {
            let unreachable: Vec<TaskId> = state
                .tasks()
                .filter(|t| t.status == TaskStatus::Pending)
                .filter(|t| {
                    t.depends_on
                        .iter()
                        .any(|dep| match state.task(dep).map(|d| d.status) {
                            Some(TaskStatus::Failed) => true,
                            Some(TaskStatus::Skipped) => !t.tolerate_skipped,
                            _ => false,
                        })
                })
                .map(|t| t.id.clone())
                .collect();

            if unreachable.is_empty() {
                break;
            }
            for task_id in unreachable {
                debug!(task = %task_id, "skipping task with unsatisfiable dependencies");
                if let Some(task) = state.task_mut(&task_id) {
                    task.status = TaskStatus::Skipped;
                }
                let _ = self.event_tx.send(Event::TaskFinished {
                    run_id: state.run_id,
                    task: task_id,
                    status: TaskStatus::Skipped,
                });
            }
        }
    }

    /// Fold one batch result into workflow state
    async fn fold_result(
        &self,
        state: &mut WorkflowState,
        task_id: TaskId,
        result: Result<RetryOutcome, RetryError>,
    ) -> Result<(), EngineError> {
        match result {
            Ok(outcome) => {
                let output = outcome.output;
                let (capability, subject_key) = match state.task_mut(&task_id) {
                    Some(task) => {
                        task.retries = outcome.retries;
                        task.result = Some(output.clone());
                        (task.capability, task.subject_key())
                    }
                    None => return Ok(()),
                };

                if let Some(request) = output.needs_input.clone() {
                    self.set_task_status(state, &task_id, TaskStatus::AwaitingInput);
                    let context = serde_json::json!({
                        "task": task_id,
                        "reason": request.reason,
                        "context": request.context,
                    });
                    self.raise_escalation(
                        state,
                        EscalationReason::NeedsInput,
                        context,
                        None,
                        Some(task_id),
                    )
                    .await?;
                    return Ok(());
                }

                self.set_task_status(state, &task_id, TaskStatus::Succeeded);

                if capability.is_generation() {
                    if let Some(totals) = output.invoices {
                        let invoice_id = output
                            .payload
                            .get("invoice_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or(task_id.as_str())
                            .to_string();
                        state.record_side_effect(SideEffect::InvoiceGenerated {
                            subject: subject_key,
                            invoice_id,
                            amount: totals.total_amount,
                            at: Utc::now(),
                        });
                    }
                }

                // Source-level warnings apply to every comparison the worker
                // surfaced; classification keys off them
                for mut comparison in output.comparisons {
                    comparison.warnings.extend(output.warnings.iter().cloned());
                    self.ingest_comparison(state, comparison).await?;
                }

                if capability.is_verification() {
                    self.cross_check_verification(state, &task_id).await?;
                }
            }
            Err(err) => match err {
                RetryError::CircuitOpen(ref key) => {
                    // Transient from the run's perspective: the task goes
                    // back to pending so a later advance retries it once the
                    // breaker cools down
                    debug!(task = %task_id, key = %key, "deferring task behind open circuit");
                    if let Some(task) = state.task_mut(&task_id) {
                        task.status = TaskStatus::Pending;
                        task.error = Some(TaskFailure {
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        });
                    }
                }
                RetryError::Permanent(ref worker_err) => {
                    if let Some(task) = state.task_mut(&task_id) {
                        task.error = Some(TaskFailure {
                            kind: worker_err.kind().to_string(),
                            message: worker_err.to_string(),
                        });
                    }
                    self.set_task_status(state, &task_id, TaskStatus::Failed);
                }
                RetryError::Exhausted { ref last, attempts } => {
                    if let Some(task) = state.task_mut(&task_id) {
                        task.retries = attempts.saturating_sub(1);
                        task.error = Some(TaskFailure {
                            kind: last.kind().to_string(),
                            message: err.to_string(),
                        });
                    }
                    self.set_task_status(state, &task_id, TaskStatus::Failed);
                    let context = serde_json::json!({
                        "task": task_id,
                        "attempts": attempts,
                        "last_error": last.to_string(),
                    });
                    self.raise_escalation(
                        state,
                        EscalationReason::RetriesExhausted,
                        context,
                        None,
                        Some(task_id),
                    )
                    .await?;
                }
                RetryError::DuplicateRisk(ref key) => {
                    // The prior attempt may have committed; a human decides
                    if let Some(task) = state.task_mut(&task_id) {
                        task.error = Some(TaskFailure {
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        });
                    }
                    self.set_task_status(state, &task_id, TaskStatus::AwaitingInput);
                    let context = serde_json::json!({
                        "task": task_id,
                        "subject": key,
                    });
                    self.raise_escalation(
                        state,
                        EscalationReason::DuplicateRisk,
                        context,
                        None,
                        Some(task_id),
                    )
                    .await?;
                }
            },
        }
        Ok(())
    }

    /// Classify a surfaced comparison and open a discrepancy; anything not
    /// matched is escalated, never silently dropped.
    async fn ingest_comparison(
        &self,
        state: &mut WorkflowState,
        comparison: Comparison,
    ) -> Result<(), EngineError> {
        let discrepancy = self.reconcile.classify(&comparison);
        let subject = discrepancy.subject.clone();
        let classification = discrepancy.classification;

        let _ = self.event_tx.send(Event::DiscrepancyDetected {
            run_id: state.run_id,
            subject: subject.clone(),
            classification,
        });

        state.discrepancies.insert(subject.clone(), discrepancy);

        let reason = match classification {
            Classification::Matched => return Ok(()),
            Classification::Warned => EscalationReason::DiscrepancyWarned,
            Classification::Discrepant => EscalationReason::DiscrepancyExceeded,
        };

        let context = serde_json::json!({
            "subject": subject,
            "kind": comparison.kind,
            "authoritative": comparison.authoritative,
            "reported": comparison.reported,
            "warnings": comparison.warnings,
        });
        self.raise_escalation(state, reason, context, Some(subject), None)
            .await?;
        Ok(())
    }

    /// Compare a verification task's read-back against what its generation
    /// dependency declared. A mismatch is escalated unconditionally; no
    /// tolerance applies to invoice counts or totals.
    async fn cross_check_verification(
        &self,
        state: &mut WorkflowState,
        verification_id: &TaskId,
    ) -> Result<(), EngineError> {
        let Some(verification) = state.task(verification_id) else {
            return Ok(());
        };
        let generation_id = verification
            .depends_on
            .iter()
            .find(|dep| {
                state
                    .task(dep)
                    .map(|t| t.capability.is_generation())
                    .unwrap_or(false)
            })
            .cloned();
        let Some(generation_id) = generation_id else {
            return Ok(());
        };

        let declared = state
            .task(&generation_id)
            .and_then(|t| t.result.as_ref())
            .and_then(|r| r.invoices);
        let observed = verification.result.as_ref().and_then(|r| r.invoices);

        let Some(declared) = declared else {
            // Generation declared no totals to check against
            return Ok(());
        };
        if matches!(observed, Some(o) if declared.matches(&o)) {
            return Ok(());
        }

        warn!(
            generation = %generation_id,
            verification = %verification_id,
            ?declared,
            ?observed,
            "generation-verification mismatch"
        );
        let context = serde_json::json!({
            "generation_task": generation_id,
            "verification_task": verification_id,
            "declared": declared,
            "observed": observed,
        });
        self.raise_escalation(
            state,
            EscalationReason::GenerationVerificationMismatch,
            context,
            None,
            Some(verification_id.clone()),
        )
        .await?;
        Ok(())
    }

    /// Raise an escalation, record its send side effect, and link it to the
    /// discrepancy for the given subject
    async fn raise_escalation(
        &self,
        state: &mut WorkflowState,
        reason: EscalationReason,
        context: serde_json::Value,
        subject: Option<String>,
        task: Option<TaskId>,
    ) -> Result<EscalationId, EngineError> {
        let (escalation, effect) = self
            .escalations
            .raise(reason, context, subject.clone(), task, None, Utc::now())
            .await?;
        let id = escalation.id;

        state.record_side_effect(effect);
        if let Some(subject) = subject {
            if let Some(d) = state.discrepancies.get_mut(&subject) {
                d.escalate(id);
            }
        }
        state.escalations.push(escalation);

        let _ = self.event_tx.send(Event::EscalationRaised {
            run_id: state.run_id,
            escalation: id,
            reason,
        });
        Ok(id)
    }

    fn set_task_status(&self, state: &mut WorkflowState, task_id: &TaskId, status: TaskStatus) {
        if let Some(task) = state.task_mut(task_id) {
            task.status = status;
        }
        let _ = self.event_tx.send(Event::TaskFinished {
            run_id: state.run_id,
            task: task_id.clone(),
            status,
        });
    }

    /// Derive the caller-facing status after folding (or an idle pass)
    fn derive_status(&self, state: &mut WorkflowState) -> RunStatus {
        let pending = state.pending_escalations();
        if !pending.is_empty() {
            state.state = RunState::AwaitingInput;
            let _ = self.event_tx.send(Event::RunSuspended {
                run_id: state.run_id,
            });
            return RunStatus::AwaitingInput { pending };
        }

        let timed_out = state.timed_out_escalations();
        if !timed_out.is_empty() {
            state.state = RunState::AwaitingInput;
            return RunStatus::Parked { timed_out };
        }

        if state.all_terminal() {
            if state.blocking_discrepancies().is_empty() {
                state.state = RunState::Finalizing;
                return RunStatus::ReadyToFinalize;
            }
            // Unresolved discrepancy without a live escalation: stay parked
            state.state = RunState::AwaitingInput;
            return RunStatus::AwaitingInput { pending: vec![] };
        }

        state.state = RunState::Scheduling;
        RunStatus::InProgress {
            completed: state.completed_count(),
            remaining: state.remaining_count(),
        }
    }
}
