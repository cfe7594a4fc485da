//! Per-run workflow state - the single source of truth for one run
//!
//! Owned exclusively by the orchestrator for the lifetime of a run and never
//! shared across runs. Serializable, so a parked run can be snapshotted and
//! restored after a process restart.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::escalation::{Escalation, EscalationStatus};
use crate::reconcile::{Classification, Discrepancy, ResolutionStatus};
use crate::types::{
    Capability, EscalationId, InvoiceTotals, RunId, RunState, SideEffect, Task, TaskId, TaskStatus,
};

/// The run's single source of truth
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: RunId,
    pub state: RunState,
    pub plan_summary: String,
    /// Tasks keyed by id; BTreeMap iteration gives the deterministic
    /// task-id order used for result folding and reporting
    tasks: BTreeMap<TaskId, Task>,
    /// Discrepancies keyed by comparison subject
    pub discrepancies: BTreeMap<String, Discrepancy>,
    pub escalations: Vec<Escalation>,
    /// Committed side effects, in commit order; reported, never rolled back
    pub side_effects: Vec<SideEffect>,
    pub report: Option<Report>,
}

impl WorkflowState {
    pub fn new(run_id: RunId, plan_summary: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            run_id,
            state: RunState::Submitted,
            plan_summary: plan_summary.into(),
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            discrepancies: BTreeMap::new(),
            escalations: Vec::new(),
            side_effects: Vec::new(),
            report: None,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Tasks in task-id order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Append a corrective task the orchestrator synthesized mid-run
    pub fn insert_task(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// Dependency satisfied when succeeded, or skipped under the task's
    /// explicit override
    fn dependency_satisfied(&self, dep: &TaskId, tolerate_skipped: bool) -> bool {
        match self.tasks.get(dep).map(|t| t.status) {
            Some(TaskStatus::Succeeded) => true,
            Some(TaskStatus::Skipped) => tolerate_skipped,
            _ => false,
        }
    }

    /// Pending tasks whose dependencies are all satisfied, in task-id order.
    ///
    /// Ready tasks can never depend on one another (their dependencies are
    /// already terminal), so the whole set forms one dispatch batch.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|dep| self.dependency_satisfied(dep, t.tolerate_skipped))
            })
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn completed_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .count()
    }

    pub fn remaining_count(&self) -> usize {
        self.task_count() - self.completed_count()
    }

    pub fn record_side_effect(&mut self, effect: SideEffect) {
        self.side_effects.push(effect);
    }

    pub fn escalation(&self, id: EscalationId) -> Option<&Escalation> {
        self.escalations.iter().find(|e| e.id == id)
    }

    pub fn escalation_mut(&mut self, id: EscalationId) -> Option<&mut Escalation> {
        self.escalations.iter_mut().find(|e| e.id == id)
    }

    /// Escalations still awaiting a response (pending or reminded)
    pub fn pending_escalations(&self) -> Vec<EscalationId> {
        self.escalations
            .iter()
            .filter(|e| {
                matches!(
                    e.status,
                    EscalationStatus::Pending | EscalationStatus::ReminderSent
                )
            })
            .map(|e| e.id)
            .collect()
    }

    pub fn timed_out_escalations(&self) -> Vec<EscalationId> {
        self.escalations
            .iter()
            .filter(|e| e.status == EscalationStatus::TimedOut)
            .map(|e| e.id)
            .collect()
    }

    /// Any escalation that still blocks finalization
    pub fn has_blocking_escalations(&self) -> bool {
        self.escalations.iter().any(|e| e.blocks_finalize())
    }

    /// Discrepancies that still block finalization, in subject order
    pub fn blocking_discrepancies(&self) -> Vec<&Discrepancy> {
        self.discrepancies
            .values()
            .filter(|d| d.blocks_finalize())
            .collect()
    }

    /// Serialize for restart-safe parking
    pub fn snapshot(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Restore a parked run from a snapshot
    pub fn restore(snapshot: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(snapshot)?)
    }

    /// Generation tasks paired with their verification dependents
    pub fn verification_pairs(&self) -> Vec<(&Task, Option<&Task>)> {
        self.tasks
            .values()
            .filter(|t| t.capability.is_generation())
            .map(|generation| {
                let paired = generation.capability.paired_verification();
                let verification = self.tasks.values().find(|t| {
                    Some(t.capability) == paired && t.depends_on.contains(&generation.id)
                });
                (generation, verification)
            })
            .collect()
    }

    /// Build the final report from the current state
    pub fn build_report(&self, aborted: bool, generated_at: DateTime<Utc>) -> Report {
        let task_outcomes: Vec<TaskOutcome> = self
            .tasks
            .values()
            .map(|t| TaskOutcome {
                task: t.id.clone(),
                capability: t.capability,
                status: t.status,
                retries: t.retries,
                error: t.error.as_ref().map(|e| e.message.clone()),
            })
            .collect();

        let totals = ReportTotals {
            tasks: self.tasks.len(),
            succeeded: self.count_status(TaskStatus::Succeeded),
            failed: self.count_status(TaskStatus::Failed),
            skipped: self.count_status(TaskStatus::Skipped),
            retries: self.tasks.values().map(|t| t.retries).sum(),
        };

        let verification_checklist = self
            .verification_pairs()
            .into_iter()
            .map(|(generation, verification)| {
                let declared = generation.result.as_ref().and_then(|r| r.invoices);
                let observed = verification
                    .and_then(|v| v.result.as_ref())
                    .and_then(|r| r.invoices);
                VerificationCheck {
                    generation: generation.id.clone(),
                    verification: verification.map(|v| v.id.clone()),
                    declared,
                    observed,
                    matched: match (declared, observed) {
                        (Some(d), Some(o)) => d.matches(&o),
                        _ => false,
                    },
                }
            })
            .collect();

        let subjects = self
            .discrepancies
            .values()
            .map(|d| SubjectOutcome {
                subject: d.subject.clone(),
                classification: d.classification,
                resolution: d.resolution,
                authoritative: d.authoritative,
                reported: d.reported,
                resolution_value: d.resolution_value,
            })
            .collect();

        Report {
            run_id: self.run_id,
            summary: self.plan_summary.clone(),
            generated_at,
            aborted,
            task_outcomes,
            subjects,
            totals,
            verification_checklist,
            unresolved_discrepancies: self
                .blocking_discrepancies()
                .iter()
                .map(|d| d.subject.clone())
                .collect(),
            timed_out_escalations: self.timed_out_escalations(),
            side_effects: self.side_effects.clone(),
        }
    }

    fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

/// Per-task outcome line in the final report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: TaskId,
    pub capability: Capability,
    pub status: TaskStatus,
    pub retries: u32,
    pub error: Option<String>,
}

/// Per-subject reconciliation outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectOutcome {
    pub subject: String,
    pub classification: Classification,
    pub resolution: ResolutionStatus,
    pub authoritative: f64,
    pub reported: f64,
    pub resolution_value: Option<f64>,
}

/// Aggregate counters for the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportTotals {
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retries: u32,
}

/// Generation vs. verification cross-check line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub generation: TaskId,
    pub verification: Option<TaskId>,
    pub declared: Option<InvoiceTotals>,
    pub observed: Option<InvoiceTotals>,
    pub matched: bool,
}

/// Aggregated, auditable summary of one run
///
/// Unresolved discrepancies and timed-out escalations are always listed,
/// even when the run is otherwise done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: RunId,
    pub summary: String,
    pub generated_at: DateTime<Utc>,
    pub aborted: bool,
    pub task_outcomes: Vec<TaskOutcome>,
    pub subjects: Vec<SubjectOutcome>,
    pub totals: ReportTotals,
    pub verification_checklist: Vec<VerificationCheck>,
    pub unresolved_discrepancies: Vec<String>,
    pub timed_out_escalations: Vec<EscalationId>,
    pub side_effects: Vec<SideEffect>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskSpec;

    fn task(id: &str, capability: Capability, deps: &[&str]) -> Task {
        let mut spec = TaskSpec::new(id, capability);
        for dep in deps {
            spec = spec.depends_on(*dep);
        }
        Task::from_spec(spec, true)
    }

    fn three_task_state() -> WorkflowState {
        WorkflowState::new(
            RunId::new(),
            "demo",
            vec![
                task("t1", Capability::Project, &[]),
                task("t2", Capability::Timesheet, &["t1"]),
                task("t3", Capability::Validation, &["t2"]),
            ],
        )
    }

    // === Readiness ===

    #[test]
    fn test_only_dependency_free_tasks_ready() {
        let state = three_task_state();
        assert_eq!(state.ready_tasks(), vec![TaskId::from("t1")]);
    }

    #[test]
    fn test_ready_after_dependency_succeeds() {
        let mut state = three_task_state();
        state.task_mut(&TaskId::from("t1")).unwrap().status = TaskStatus::Succeeded;
        assert_eq!(state.ready_tasks(), vec![TaskId::from("t2")]);
    }

    #[test]
    fn test_skipped_dependency_blocks_without_override() {
        let mut state = three_task_state();
        state.task_mut(&TaskId::from("t1")).unwrap().status = TaskStatus::Skipped;
        assert!(state.ready_tasks().is_empty());
    }

    #[test]
    fn test_skipped_dependency_allowed_with_override() {
        let mut state = three_task_state();
        state.task_mut(&TaskId::from("t1")).unwrap().status = TaskStatus::Skipped;
        state.task_mut(&TaskId::from("t2")).unwrap().tolerate_skipped = true;
        assert_eq!(state.ready_tasks(), vec![TaskId::from("t2")]);
    }

    #[test]
    fn test_ready_tasks_in_task_id_order() {
        let state = WorkflowState::new(
            RunId::new(),
            "order",
            vec![
                task("t9", Capability::Query, &[]),
                task("t1", Capability::Query, &[]),
                task("t5", Capability::Query, &[]),
            ],
        );
        assert_eq!(
            state.ready_tasks(),
            vec![TaskId::from("t1"), TaskId::from("t5"), TaskId::from("t9")]
        );
    }

    // === Terminal accounting ===

    #[test]
    fn test_all_terminal_counts() {
        let mut state = three_task_state();
        assert!(!state.all_terminal());
        assert_eq!(state.remaining_count(), 3);

        for t in ["t1", "t2", "t3"] {
            state.task_mut(&TaskId::from(t)).unwrap().status = TaskStatus::Succeeded;
        }
        assert!(state.all_terminal());
        assert_eq!(state.completed_count(), 3);
    }

    // === Snapshot / restore ===

    #[test]
    fn test_snapshot_roundtrip_preserves_progress() {
        let mut state = three_task_state();
        state.task_mut(&TaskId::from("t1")).unwrap().status = TaskStatus::Succeeded;
        state.task_mut(&TaskId::from("t1")).unwrap().retries = 2;
        state.state = RunState::AwaitingInput;

        let snapshot = state.snapshot().unwrap();
        let restored = WorkflowState::restore(&snapshot).unwrap();

        assert_eq!(restored.run_id, state.run_id);
        assert_eq!(restored.state, RunState::AwaitingInput);
        assert_eq!(
            restored.task(&TaskId::from("t1")).unwrap().status,
            TaskStatus::Succeeded
        );
        assert_eq!(restored.task(&TaskId::from("t1")).unwrap().retries, 2);
        assert_eq!(restored.ready_tasks(), vec![TaskId::from("t2")]);
    }

    // === Report ===

    #[test]
    fn test_report_lists_unresolved_items() {
        let mut state = three_task_state();
        for t in ["t1", "t2", "t3"] {
            state.task_mut(&TaskId::from(t)).unwrap().status = TaskStatus::Succeeded;
        }

        let discrepancy = crate::reconcile::ReconcileEngine::default().classify(
            &crate::types::Comparison {
                subject: "GEIG/Modernisation/2025-09".into(),
                kind: crate::types::ValueKind::DayCount,
                authoritative: 22.0,
                reported: 12.0,
                warnings: Vec::new(),
            },
        );
        state
            .discrepancies
            .insert(discrepancy.subject.clone(), discrepancy);

        let report = state.build_report(false, Utc::now());
        assert_eq!(report.totals.succeeded, 3);
        assert_eq!(
            report.unresolved_discrepancies,
            vec!["GEIG/Modernisation/2025-09".to_string()]
        );
        assert!(!report.aborted);
    }

    #[test]
    fn test_verification_pairs_found() {
        let state = WorkflowState::new(
            RunId::new(),
            "invoices",
            vec![
                task("gen", Capability::InvoiceGeneration, &[]),
                task("gen-verify", Capability::InvoiceVerification, &["gen"]),
            ],
        );

        let pairs = state.verification_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.id, TaskId::from("gen"));
        assert_eq!(pairs[0].1.map(|t| t.id.clone()), Some(TaskId::from("gen-verify")));
    }
}
