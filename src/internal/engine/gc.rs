//! Garbage collector: reachability from missions and permanents over the
//! strong relations decides which objects are still needed; the rest are
//! stopped and finalized. The GC is the only component that removes objects
//! from a plan during normal execution.

use ahash::{AHashMap, AHashSet};

use super::propagation::Propagation;
use crate::{
    ident::ObjectId,
    internal::{plan::Plan, relation::Relation, task::TaskState},
};

/// Per-engine GC state: which unneeded objects are waiting out their
/// one-cycle observation delay.
pub(crate) struct GarbageCollector {
    finalize_delay: u64,
    pending_tasks: AHashMap<ObjectId, u64>,
    pending_events: AHashMap<ObjectId, u64>,
}

impl GarbageCollector {
    pub(crate) fn new(finalize_delay: u64) -> Self {
        Self {
            finalize_delay,
            pending_tasks: AHashMap::new(),
            pending_events: AHashMap::new(),
        }
    }

    /// One GC pass: stop running unneeded tasks, finalize the ones whose
    /// observation delay elapsed.
    pub(crate) fn collect(&mut self, propagation: &mut Propagation<'_>) {
        let cycle = propagation.plan().cycle();

        // a finished mission no longer serves anything
        let finished_missions: Vec<ObjectId> = propagation
            .plan()
            .missions()
            .filter(|id| {
                propagation
                    .plan()
                    .get_task(*id)
                    .map(|t| t.state() == TaskState::Finished)
                    .unwrap_or(true)
            })
            .collect();
        for id in finished_missions {
            propagation.plan_mut().remove_mission(id);
        }

        let useful = useful_tasks(propagation.plan());

        let mut to_stop = Vec::new();
        let mut candidates = Vec::new();
        for task in propagation.plan().tasks() {
            let id = task.id();
            if useful.contains(&id) {
                continue;
            }
            match task.state() {
                TaskState::Starting | TaskState::Running => to_stop.push(id),
                TaskState::Pending | TaskState::Finished => candidates.push(id),
                TaskState::Finishing => {}
            }
        }
        self.pending_tasks.retain(|id, _| !useful.contains(id));
        for id in &candidates {
            self.pending_tasks.entry(*id).or_insert(cycle);
        }

        for id in to_stop {
            tracing::debug!("gc: stopping unneeded task {id}");
            propagation.fault_reaction(id);
        }
        propagation.process_queue();

        // finalize, parents first, so strong edges never dangle
        let due: AHashSet<ObjectId> = self
            .pending_tasks
            .iter()
            .filter(|(id, since)| {
                cycle.saturating_sub(**since) >= self.finalize_delay
                    && propagation.plan().contains_task(**id)
            })
            .map(|(id, _)| *id)
            .collect();
        let mut remaining: Vec<ObjectId> = due.iter().copied().collect();
        loop {
            let mut progressed = false;
            remaining.retain(|id| {
                let blocked = Relation::TASK_RELATIONS.iter().any(|relation| {
                    relation.is_strong()
                        && propagation
                            .plan()
                            .graph(*relation)
                            .parents(*id)
                            .any(|parent| propagation.plan().contains_task(parent))
                });
                if blocked {
                    return true;
                }
                match propagation.plan_mut().remove_task(*id) {
                    Ok(()) => {
                        tracing::debug!("gc: finalized task {id}");
                        progressed = true;
                        false
                    }
                    Err(_) => true,
                }
            });
            if !progressed || remaining.is_empty() {
                break;
            }
        }
        self.pending_tasks
            .retain(|id, _| propagation.plan().contains_task(*id));

        // free events: unneeded and unreachable ones die after the delay
        let useful_events = useful_free_events(propagation.plan(), &useful);
        let dead: Vec<ObjectId> = propagation
            .plan()
            .free_events()
            .filter(|id| {
                !useful_events.contains(id)
                    && propagation
                        .plan()
                        .get_event(*id)
                        .map(|e| e.unreachable())
                        .unwrap_or(false)
            })
            .collect();
        self.pending_events.retain(|id, _| dead.contains(id));
        for id in &dead {
            self.pending_events.entry(*id).or_insert(cycle);
        }
        let due_events: Vec<ObjectId> = self
            .pending_events
            .iter()
            .filter(|(_, since)| cycle.saturating_sub(**since) >= self.finalize_delay)
            .map(|(id, _)| *id)
            .collect();
        for id in due_events {
            propagation.plan_mut().remove_free_event(id);
            self.pending_events.remove(&id);
            tracing::debug!("gc: finalized free event {id}");
        }
    }
}

/// A task is useful iff it is a mission or permanent, is reachable from one
/// through a strong relation, is finishing, or (transitively) serves as
/// planner or execution agent of a useful task — the latter two being strong
/// child edges.
pub(crate) fn useful_tasks(plan: &Plan) -> AHashSet<ObjectId> {
    let mut useful: AHashSet<ObjectId> = plan.missions().collect();
    useful.extend(plan.permanent_tasks());
    useful.extend(
        plan.tasks()
            .filter(|t| t.state() == TaskState::Finishing)
            .map(|t| t.id()),
    );
    let mut worklist: Vec<ObjectId> = useful.iter().copied().collect();
    while let Some(current) = worklist.pop() {
        for relation in Relation::TASK_RELATIONS {
            if !relation.is_strong() {
                continue;
            }
            for child in plan.graph(relation).children(current) {
                if useful.insert(child) {
                    worklist.push(child);
                }
            }
        }
    }
    useful
}

/// A free event is useful iff it is permanent or linked, in any event
/// relation, to a bound event of a useful task.
pub(crate) fn useful_free_events(plan: &Plan, useful: &AHashSet<ObjectId>) -> AHashSet<ObjectId> {
    let mut useful_events: AHashSet<ObjectId> = plan.permanent_events().collect();
    for id in plan.free_events() {
        if useful_events.contains(&id) {
            continue;
        }
        let linked = Relation::EVENT_RELATIONS.iter().any(|relation| {
            plan.graph(*relation).neighbours(id).any(|neighbour| {
                plan.get_event(neighbour)
                    .and_then(|e| e.task())
                    .map(|task| useful.contains(&task))
                    .unwrap_or(false)
            })
        });
        if linked {
            useful_events.insert(id);
        }
    }
    useful_events
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::useful_tasks;
    use crate::internal::{
        plan::Plan,
        relation::{DependencyInfo, EdgeInfo, Relation},
        task::{Task, TaskModel},
    };

    /// Mission children through strong relations are useful; orphans are
    /// not.
    #[test]
    fn test_useful_closure() {
        let mut plan = Plan::new();
        let mission = plan.add_task(Task::new(Arc::new(TaskModel::new("Mission")))).unwrap();
        let child = plan.add_task(Task::new(Arc::new(TaskModel::new("Child")))).unwrap();
        let planner = plan.add_task(Task::new(Arc::new(TaskModel::new("Planner")))).unwrap();
        let orphan = plan.add_task(Task::new(Arc::new(TaskModel::new("Orphan")))).unwrap();
        plan.add_mission(mission).unwrap();
        plan.add_edge(
            Relation::Dependency,
            mission,
            child,
            EdgeInfo::Dependency(DependencyInfo::new()),
        )
        .unwrap();
        plan.add_edge(Relation::PlannedBy, child, planner, EdgeInfo::None).unwrap();

        let useful = useful_tasks(&plan);
        assert!(useful.contains(&mission));
        assert!(useful.contains(&child));
        assert!(useful.contains(&planner));
        assert!(!useful.contains(&orphan));
    }
}
