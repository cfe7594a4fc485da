//! Plans: ordered, dependency-annotated task lists and their validation
//!
//! Plans come from the external planner. The engine validates structural
//! well-formedness only - it never judges plan quality, and narrative task
//! descriptions are metadata, not control flow.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::types::{TaskId, TaskSpec};
use crate::worker::WorkerRegistry;

/// The ordered set of tasks produced for one request
///
/// Immutable after handoff to the orchestrator, except for corrective tasks
/// the orchestrator itself appends (verification pairing).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Planner's narrative summary of the request
    pub summary: String,
    tasks: Vec<TaskSpec>,
}

impl Plan {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, spec: TaskSpec) {
        self.tasks.push(spec);
    }

    pub fn with_task(mut self, spec: TaskSpec) -> Self {
        self.push(spec);
        self
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Validate structural well-formedness against the dispatch table.
    ///
    /// Checks, in order: duplicate ids, unknown dependency ids,
    /// self-dependencies, unregistered capability tags, dependency cycles.
    pub fn validate(&self, registry: &WorkerRegistry) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(&task.id) {
                return Err(EngineError::InvalidPlan(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(EngineError::InvalidPlan(format!(
                        "task {} depends on itself",
                        task.id
                    )));
                }
                if !seen.contains(dep) {
                    return Err(EngineError::InvalidPlan(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }

            if !registry.contains(task.capability) {
                return Err(EngineError::InvalidPlan(format!(
                    "no worker registered for capability {} (task {})",
                    task.capability, task.id
                )));
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the dependency edges
    fn check_acyclic(&self) -> Result<(), EngineError> {
        let mut indegree: HashMap<&TaskId, usize> = HashMap::new();
        let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();

        for task in &self.tasks {
            indegree.entry(&task.id).or_insert(0);
            for dep in &task.depends_on {
                *indegree.entry(&task.id).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(&task.id);
            }
        }

        let mut queue: VecDeque<&TaskId> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            if let Some(next) = dependents.get(id) {
                for dependent in next {
                    if let Some(deg) = indegree.get_mut(*dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if processed != self.tasks.len() {
            return Err(EngineError::InvalidPlan(
                "dependency graph contains a cycle".into(),
            ));
        }
        Ok(())
    }

    /// Ensure every generation task has a verification dependent, appending
    /// synthesized verification tasks where missing.
    ///
    /// Returns the ids of appended tasks.
    pub fn ensure_verification_pairing(&mut self) -> Vec<TaskId> {
        let mut appended = Vec::new();

        let generation: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.capability.is_generation())
            .map(|(i, _)| i)
            .collect();

        for idx in generation {
            let gen_id = self.tasks[idx].id.clone();
            let Some(paired) = self.tasks[idx].capability.paired_verification() else {
                continue;
            };

            let already_paired = self.tasks.iter().any(|t| {
                t.capability == paired && t.depends_on.contains(&gen_id)
            });
            if already_paired {
                continue;
            }

            let verify_id = TaskId::new(format!("{gen_id}-verify"));
            debug!(generation = %gen_id, verification = %verify_id, "synthesizing verification task");

            let gen = &self.tasks[idx];
            let spec = TaskSpec {
                id: verify_id.clone(),
                description: format!("Verify output of {gen_id}"),
                capability: paired,
                depends_on: vec![gen_id],
                input: gen.input.clone(),
                subject: gen.subject.clone(),
                tolerate_skipped: false,
            };
            self.tasks.push(spec);
            appended.push(verify_id);
        }

        appended
    }
}

/// External planner contract: natural-language request in, plan out.
///
/// The engine validates the result structurally; it does not evaluate plan
/// quality.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &str) -> Result<Plan, EngineError>;
}
