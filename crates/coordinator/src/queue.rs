//! The task queue and fair-share scheduler.
//!
//! Tasks group by project. Each project carries a virtual-time counter:
//! every pull serves the eligible project with the lowest virtual time and
//! advances it one quantum, so projects share capacity evenly regardless
//! of how many tasks each has queued. Ties break deterministically by
//! oldest enqueue, then project id.

use std::collections::HashMap;

use edgecoder_db::{TaskRecord, TaskResult, TaskStatus};
use edgecoder_mesh_types::{ResourceClass, TaskSpec};
use edgecoder_primitives::{AgentId, TaskId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::CoordinatorError;

/// A task whose overall age exceeds this many times its own timeout is
/// expired outright.
const DEADLINE_FACTOR: u64 = 10;

/// Reason recorded when the retry budget runs out.
pub(crate) const MAX_RETRIES_REASON: &str = "max_retries_exceeded";

/// What the pulling agent can serve.
#[derive(Debug, Clone)]
pub struct PullFilter {
    pub agent_id: AgentId,
    pub resource_classes: Vec<ResourceClass>,
    /// Parameter size of the agent's active model, in billions.
    pub model_param_size: f64,
}

impl PullFilter {
    fn eligible(&self, spec: &TaskSpec) -> bool {
        self.resource_classes.contains(&spec.project.resource_class)
            && self.model_param_size >= spec.required_model_size
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    tasks: HashMap<TaskId, TaskRecord>,
    virtual_time: HashMap<String, u64>,
    completed: u64,
    failed: u64,
    expired: u64,
}

/// Aggregate counters for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct QueueCounters {
    pub queued: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
}

/// Exclusive owner of all task state. Mutation happens only through the
/// scheduler methods below.
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    max_requeues: u32,
}

impl TaskQueue {
    pub fn new(max_requeues: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_requeues,
        }
    }

    /// Enqueues a task. Re-enqueueing a known id returns the existing
    /// record unchanged.
    pub fn enqueue(&self, spec: TaskSpec, now_ms: u64) -> TaskRecord {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.tasks.get(&spec.task_id) {
            return existing.clone();
        }
        let record = TaskRecord::new(spec, now_ms);
        info!(task = %record.spec.task_id, project = %record.spec.project.project_id, "task enqueued");
        inner
            .tasks
            .insert(record.spec.task_id.clone(), record.clone());
        record
    }

    /// Claims up to `max` tasks for the agent under the fair-share policy.
    pub fn pull(&self, filter: &PullFilter, max: usize, now_ms: u64) -> Vec<TaskRecord> {
        let mut inner = self.inner.lock();
        let mut claimed = Vec::new();

        for _ in 0..max {
            let Some(task_id) = next_task_for(&inner, filter) else {
                break;
            };
            let project = {
                let record = inner.tasks.get_mut(&task_id).expect("selected id exists");
                record.status = TaskStatus::Claimed;
                record.claimed_by = Some(filter.agent_id.clone());
                record.claimed_at_ms = Some(now_ms);
                record.spec.project.project_id.clone()
            };
            *inner.virtual_time.entry(project).or_insert(0) += 1;
            claimed.push(inner.tasks[&task_id].clone());
        }

        if !claimed.is_empty() {
            debug!(agent = %filter.agent_id, count = claimed.len(), "tasks claimed");
        }
        claimed
    }

    /// Marks a queued task as offered to the mesh.
    pub fn mark_offered(&self, task_id: &TaskId) -> Result<(), CoordinatorError> {
        self.transition(task_id, TaskStatus::Offered, |_| Ok(()))
    }

    /// Returns an offered task to the queue (claim race produced no
    /// usable winner).
    pub fn mark_unoffered(&self, task_id: &TaskId) -> Result<(), CoordinatorError> {
        self.transition(task_id, TaskStatus::Queued, |_| Ok(()))
    }

    /// Claims a specific task for a gossip claim-race winner.
    pub fn claim_for(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        now_ms: u64,
    ) -> Result<TaskRecord, CoordinatorError> {
        let mut inner = self.inner.lock();
        let record = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinatorError::UnknownTask(task_id.clone()))?;
        check_transition(record, TaskStatus::Claimed)?;
        record.status = TaskStatus::Claimed;
        record.claimed_by = Some(agent_id.clone());
        record.claimed_at_ms = Some(now_ms);
        Ok(record.clone())
    }

    /// Settles a task as completed. Only the claiming agent may report.
    pub fn complete(
        &self,
        task_id: &TaskId,
        reporter: &AgentId,
        result: TaskResult,
        now_ms: u64,
    ) -> Result<TaskRecord, CoordinatorError> {
        let mut inner = self.inner.lock();
        let record = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinatorError::UnknownTask(task_id.clone()))?;
        check_reporter(record, reporter)?;
        check_transition(record, TaskStatus::Completed)?;
        record.status = TaskStatus::Completed;
        record.completed_at_ms = Some(now_ms);
        record.result = Some(result);
        let record = record.clone();
        inner.completed += 1;
        Ok(record)
    }

    /// Settles a task as failed.
    pub fn fail(
        &self,
        task_id: &TaskId,
        reporter: &AgentId,
        reason: String,
        now_ms: u64,
    ) -> Result<TaskRecord, CoordinatorError> {
        let mut inner = self.inner.lock();
        let record = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinatorError::UnknownTask(task_id.clone()))?;
        check_reporter(record, reporter)?;
        check_transition(record, TaskStatus::Failed)?;
        record.status = TaskStatus::Failed;
        record.completed_at_ms = Some(now_ms);
        record.failure_reason = Some(reason);
        let record = record.clone();
        inner.failed += 1;
        Ok(record)
    }

    /// Requeues claims that have sat for more than twice their task's
    /// timeout. A task out of requeue budget dead-letters instead.
    pub fn requeue_timeouts(&self, now_ms: u64) -> Vec<TaskRecord> {
        let mut inner = self.inner.lock();
        let mut changed = Vec::new();
        let mut failed_count = 0;

        for record in inner.tasks.values_mut() {
            if record.status != TaskStatus::Claimed {
                continue;
            }
            let Some(claimed_at) = record.claimed_at_ms else {
                continue;
            };
            if now_ms.saturating_sub(claimed_at) <= record.spec.timeout_ms * 2 {
                continue;
            }

            if record.requeues >= self.max_requeues {
                warn!(task = %record.spec.task_id, "task dead-lettered");
                record.status = TaskStatus::Failed;
                record.failure_reason = Some(MAX_RETRIES_REASON.to_owned());
                record.completed_at_ms = Some(now_ms);
                failed_count += 1;
            } else {
                debug!(task = %record.spec.task_id, "claim timed out, requeueing");
                record.status = TaskStatus::Queued;
                record.requeues += 1;
                record.claimed_by = None;
                record.claimed_at_ms = None;
            }
            changed.push(record.clone());
        }
        inner.failed += failed_count;
        changed
    }

    /// Requeues everything claimed by a reaped agent.
    pub fn requeue_for_agent(&self, agent_id: &AgentId) -> Vec<TaskRecord> {
        let mut inner = self.inner.lock();
        let mut changed = Vec::new();
        for record in inner.tasks.values_mut() {
            if record.status == TaskStatus::Claimed && record.claimed_by.as_ref() == Some(agent_id)
            {
                record.status = TaskStatus::Queued;
                record.requeues += 1;
                record.claimed_by = None;
                record.claimed_at_ms = None;
                changed.push(record.clone());
            }
        }
        changed
    }

    /// Expires live tasks whose overall age blew past their deadline.
    pub fn expire_overdue(&self, now_ms: u64) -> Vec<TaskRecord> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        let mut expired_count = 0;
        for record in inner.tasks.values_mut() {
            if record.status.is_terminal() {
                continue;
            }
            let deadline = record.enqueued_at_ms + record.spec.timeout_ms * DEADLINE_FACTOR;
            if now_ms > deadline {
                record.status = TaskStatus::Expired;
                record.completed_at_ms = Some(now_ms);
                expired.push(record.clone());
                expired_count += 1;
            }
        }
        inner.expired += expired_count;
        expired
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.inner.lock().tasks.get(task_id).cloned()
    }

    /// Drops a settled task from the in-memory map (it stays archived in
    /// the persistent store).
    pub fn remove_settled(&self, task_id: &TaskId) {
        let mut inner = self.inner.lock();
        if inner
            .tasks
            .get(task_id)
            .is_some_and(|r| r.status.is_terminal())
        {
            inner.tasks.remove(task_id);
        }
    }

    /// Tasks waiting for a worker (queued or out on offer).
    pub fn queued_depth(&self) -> u64 {
        self.inner
            .lock()
            .tasks
            .values()
            .filter(|r| matches!(r.status, TaskStatus::Queued | TaskStatus::Offered))
            .count() as u64
    }

    pub(crate) fn counters(&self) -> QueueCounters {
        let inner = self.inner.lock();
        QueueCounters {
            queued: inner
                .tasks
                .values()
                .filter(|r| matches!(r.status, TaskStatus::Queued | TaskStatus::Offered))
                .count() as u64,
            claimed: inner
                .tasks
                .values()
                .filter(|r| matches!(r.status, TaskStatus::Claimed | TaskStatus::Running))
                .count() as u64,
            completed: inner.completed,
            failed: inner.failed,
            expired: inner.expired,
        }
    }

    fn transition(
        &self,
        task_id: &TaskId,
        to: TaskStatus,
        check: impl FnOnce(&TaskRecord) -> Result<(), CoordinatorError>,
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock();
        let record = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinatorError::UnknownTask(task_id.clone()))?;
        check(record)?;
        check_transition(record, to)?;
        record.status = to;
        Ok(())
    }
}

fn check_transition(record: &TaskRecord, to: TaskStatus) -> Result<(), CoordinatorError> {
    if !record.status.can_transition_to(to) {
        return Err(CoordinatorError::InvalidTransition {
            task: record.spec.task_id.clone(),
            from: record.status,
            to,
        });
    }
    Ok(())
}

fn check_reporter(record: &TaskRecord, reporter: &AgentId) -> Result<(), CoordinatorError> {
    match &record.claimed_by {
        Some(claimer) if claimer == reporter => Ok(()),
        claimer => Err(CoordinatorError::NotClaimer {
            task: record.spec.task_id.clone(),
            claimer: claimer
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "nobody".to_owned()),
            reporter: reporter.clone(),
        }),
    }
}

/// The fair-share selection: eligible project with the lowest virtual
/// time (ties: oldest enqueue, then project id), then that project's
/// highest-priority oldest task.
fn next_task_for(inner: &QueueInner, filter: &PullFilter) -> Option<TaskId> {
    let mut project_best: HashMap<&str, (u64, u64)> = HashMap::new();
    for record in inner.tasks.values() {
        if !matches!(record.status, TaskStatus::Queued | TaskStatus::Offered) {
            continue;
        }
        if !filter.eligible(&record.spec) {
            continue;
        }
        let vt = inner
            .virtual_time
            .get(&record.spec.project.project_id)
            .copied()
            .unwrap_or(0);
        let entry = project_best
            .entry(record.spec.project.project_id.as_str())
            .or_insert((vt, record.enqueued_at_ms));
        entry.1 = entry.1.min(record.enqueued_at_ms);
    }

    let (project, _) = project_best.into_iter().min_by(
        |(proj_a, (vt_a, oldest_a)), (proj_b, (vt_b, oldest_b))| {
            vt_a.cmp(vt_b)
                .then(oldest_a.cmp(oldest_b))
                .then(proj_a.cmp(proj_b))
        },
    )?;

    inner
        .tasks
        .values()
        .filter(|r| {
            matches!(r.status, TaskStatus::Queued | TaskStatus::Offered)
                && r.spec.project.project_id == project
                && filter.eligible(&r.spec)
        })
        .min_by(|a, b| {
            b.spec
                .project
                .priority
                .cmp(&a.spec.project.priority)
                .then(a.enqueued_at_ms.cmp(&b.enqueued_at_ms))
                .then(a.spec.task_id.cmp(&b.spec.task_id))
        })
        .map(|r| r.spec.task_id.clone())
}
