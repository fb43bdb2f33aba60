//! Schedulers: pure policies deciding which gathered start calls are
//! eligible this cycle. A scheduler never mutates the plan; it only picks.

use ahash::AHashSet;
use chrono::{DateTime, Utc};

use super::propagation::PendingCall;
use crate::{
    config::SchedulerKind,
    ident::ObjectId,
    internal::{plan::Plan, relation::Relation, task::TaskState},
};

/// Policy object consulted by the engine before propagating start-like
/// calls. Replaceable per engine.
pub trait Scheduler {
    fn name(&self) -> &'static str;

    /// The subset of `pending` generators allowed to fire this cycle.
    fn eligible(
        &self,
        plan: &Plan,
        pending: &[PendingCall],
        now: DateTime<Utc>,
    ) -> AHashSet<ObjectId>;
}

/// Build the scheduler selected by the engine configuration.
pub fn build(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::Basic => Box::new(BasicScheduler),
        SchedulerKind::Temporal => Box::new(TemporalScheduler),
    }
}

/// Is the owning task still waiting to start, and are its scheduling
/// constraints satisfied? Shared gate of both reference schedulers.
fn basic_eligible(plan: &Plan, generator: ObjectId) -> bool {
    let Some(event) = plan.get_event(generator) else {
        return false;
    };
    if event.unreachable() {
        return false;
    }
    if let Some(task_id) = event.task() {
        let Some(task) = plan.get_task(task_id) else {
            return false;
        };
        if task.state() != TaskState::Pending {
            return false;
        }
    }
    // a SchedulingConstraints parent must be scheduled itself: emitted, or
    // owned by a task that already started
    for parent in plan
        .graph(Relation::SchedulingConstraints)
        .parents(generator)
    {
        let Some(parent_event) = plan.get_event(parent) else {
            return false;
        };
        let satisfied = parent_event.emitted()
            || parent_event
                .task()
                .and_then(|t| plan.get_task(t))
                .map(|t| {
                    matches!(
                        t.state(),
                        TaskState::Running | TaskState::Finishing | TaskState::Finished
                    )
                })
                .unwrap_or(false);
        if !satisfied {
            return false;
        }
    }
    // every Temporal parent must have occurred
    plan.graph(Relation::Temporal)
        .parents(generator)
        .all(|parent| {
            plan.get_event(parent)
                .map(|e| e.emitted())
                .unwrap_or(false)
        })
}

/// Eligibility from pending state, `SchedulingConstraints` parents, and
/// emitted `Temporal` parents.
pub struct BasicScheduler;

impl Scheduler for BasicScheduler {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn eligible(
        &self,
        plan: &Plan,
        pending: &[PendingCall],
        _now: DateTime<Utc>,
    ) -> AHashSet<ObjectId> {
        pending
            .iter()
            .map(|call| call.generator)
            .filter(|generator| basic_eligible(plan, *generator))
            .collect()
    }
}

/// As [`BasicScheduler`], plus the per-edge delay bounds of `Temporal`
/// edges: a target whose window `source + max_delay` already closed is not
/// scheduled; the deadline machinery reports the violation.
pub struct TemporalScheduler;

impl Scheduler for TemporalScheduler {
    fn name(&self) -> &'static str {
        "temporal"
    }

    fn eligible(
        &self,
        plan: &Plan,
        pending: &[PendingCall],
        now: DateTime<Utc>,
    ) -> AHashSet<ObjectId> {
        pending
            .iter()
            .map(|call| call.generator)
            .filter(|generator| {
                if !basic_eligible(plan, *generator) {
                    return false;
                }
                plan.graph(Relation::Temporal)
                    .parents(*generator)
                    .all(|parent| {
                        let Some(max_delay) = plan
                            .graph(Relation::Temporal)
                            .edge_info(parent, *generator)
                            .and_then(|i| i.as_temporal())
                            .and_then(|t| t.max_delay)
                        else {
                            return true;
                        };
                        let Some(emission) = plan
                            .get_event(parent)
                            .and_then(|e| e.last_emission())
                        else {
                            return false;
                        };
                        let elapsed = (now - emission.time).num_milliseconds() as f64 / 1000.0;
                        elapsed <= max_delay
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ahash::AHashSet;
    use chrono::Utc;

    use super::{BasicScheduler, Scheduler};
    use crate::internal::{
        engine::propagation::PendingCall,
        plan::Plan,
        relation::{EdgeInfo, Relation},
        task::{Task, TaskModel, TaskState},
    };

    fn pending_for(plan: &Plan, task: crate::ident::ObjectId) -> Vec<PendingCall> {
        vec![PendingCall {
            generator: plan.task(task).unwrap().start_event().unwrap(),
            context: None,
        }]
    }

    /// A pending task with no constraints is eligible.
    #[test]
    fn test_unconstrained_task_is_eligible() {
        let mut plan = Plan::new();
        let task = plan.add_task(Task::new(Arc::new(TaskModel::new("A")))).unwrap();
        let pending = pending_for(&plan, task);
        let eligible = BasicScheduler.eligible(&plan, &pending, Utc::now());
        assert_eq!(eligible.len(), 1);
    }

    /// An unsatisfied Temporal parent blocks scheduling.
    #[test]
    fn test_temporal_parent_blocks() {
        let mut plan = Plan::new();
        let first = plan.add_task(Task::new(Arc::new(TaskModel::new("First")))).unwrap();
        let second = plan.add_task(Task::new(Arc::new(TaskModel::new("Second")))).unwrap();
        let first_stop = plan.task(first).unwrap().stop_event().unwrap();
        let second_start = plan.task(second).unwrap().start_event().unwrap();
        plan.add_edge(Relation::Temporal, first_stop, second_start, EdgeInfo::None)
            .unwrap();
        let pending = pending_for(&plan, second);
        let eligible = BasicScheduler.eligible(&plan, &pending, Utc::now());
        assert!(eligible.is_empty());
    }

    /// Started tasks are no longer pending-compatible.
    #[test]
    fn test_started_task_not_eligible() {
        let mut plan = Plan::new();
        let task = plan.add_task(Task::new(Arc::new(TaskModel::new("A")))).unwrap();
        let pending = pending_for(&plan, task);
        plan.set_task_state(task, TaskState::Running);
        let eligible: AHashSet<_> = BasicScheduler.eligible(&plan, &pending, Utc::now());
        assert!(eligible.is_empty());
    }
}
