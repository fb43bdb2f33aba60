//! Transactions: a disposable, consistent staged view over a live plan.
//!
//! A transaction is a set, not a diff: wrapping the same plan object twice
//! yields the same proxy, and edges inside the transaction connect proxies,
//! never a mix of plan and transaction objects. Plan edges are materialized
//! lazily, when both endpoints have been wrapped; the materialized set is
//! remembered as the snapshot against which commit computes the exact edge
//! diff, so concurrent plan activity outside the wrapped scope is never
//! touched.
//!
//! Commit is all-or-nothing with respect to observation: validation happens
//! first (conflicts, DAG acyclicity on clones), and only then are the plan
//! mutations applied back-to-back, with no user code in between. On
//! validation failure the transaction is discarded and the plan is left
//! untouched.

use ahash::{AHashMap, AHashSet};
use serde_json::Value;

use super::plan::{Plan, RelationGraphs, bind_task_events, model_wiring};
use crate::{
    errors::PlanError,
    ident::ObjectId,
    internal::{
        event::generator::{EmissionHandler, EventGenerator},
        relation::{EdgeInfo, Relation, RelationScope},
        task::Task,
    },
};

type EdgeKey = (ObjectId, ObjectId);

/// Staged modifications of a plan. Create one with [`Transaction::new`] or
/// through [`Plan::in_transaction`].
pub struct Transaction {
    /// Staged task state, keyed by the plan object's id (identity is
    /// preserved across wrap calls). Contains both proxies and locals.
    tasks: AHashMap<ObjectId, Task>,
    /// Staged generator state for wrapped plan events and local events.
    events: AHashMap<ObjectId, EventGenerator>,
    local_tasks: AHashSet<ObjectId>,
    local_events: AHashSet<ObjectId>,
    /// Bound generator ids of local tasks, in model order; the generator
    /// state itself lives in `events` so staged mutations are not lost.
    local_generators: AHashMap<ObjectId, Vec<ObjectId>>,
    imported_tasks: AHashSet<ObjectId>,
    imported_events: AHashSet<ObjectId>,
    graphs: RelationGraphs,
    /// Plan edges seen at wrap time, per relation: the snapshot side of the
    /// commit diff.
    snapshot_edges: [AHashSet<EdgeKey>; 9],
    missions_added: AHashSet<ObjectId>,
    missions_removed: AHashSet<ObjectId>,
    permanent_tasks_added: AHashSet<ObjectId>,
    permanent_tasks_removed: AHashSet<ObjectId>,
    permanent_events_added: AHashSet<ObjectId>,
    permanent_events_removed: AHashSet<ObjectId>,
    /// Argument writes replayed onto the originals at commit.
    argument_ops: Vec<(ObjectId, String, Value)>,
    /// Handler registrations replayed onto the originals at commit.
    staged_handlers: Vec<(ObjectId, EmissionHandler)>,
    base_cycle: u64,
}

impl Transaction {
    pub fn new(plan: &Plan) -> Self {
        Self {
            tasks: AHashMap::new(),
            events: AHashMap::new(),
            local_tasks: AHashSet::new(),
            local_events: AHashSet::new(),
            local_generators: AHashMap::new(),
            imported_tasks: AHashSet::new(),
            imported_events: AHashSet::new(),
            graphs: RelationGraphs::new(),
            snapshot_edges: Default::default(),
            missions_added: AHashSet::new(),
            missions_removed: AHashSet::new(),
            permanent_tasks_added: AHashSet::new(),
            permanent_tasks_removed: AHashSet::new(),
            permanent_events_added: AHashSet::new(),
            permanent_events_removed: AHashSet::new(),
            argument_ops: Vec::new(),
            staged_handlers: Vec::new(),
            base_cycle: plan.cycle(),
        }
    }

    /// The plan cycle at transaction creation.
    pub fn base_cycle(&self) -> u64 {
        self.base_cycle
    }

    // -- wrapping -----------------------------------------------------------

    /// Import a plan task into the transaction, once. Returns the same id:
    /// proxies mirror the identity of their originals. The task's bound
    /// events are wrapped along with it, and edges to already-wrapped
    /// objects are materialized.
    pub fn wrap_task(&mut self, plan: &Plan, id: ObjectId) -> Result<ObjectId, PlanError> {
        if self.tasks.contains_key(&id) {
            return Ok(id);
        }
        let task = plan.task(id)?.clone();
        let bound: Vec<ObjectId> = task.bound_events().map(|(_, g)| g).collect();
        self.tasks.insert(id, task);
        self.imported_tasks.insert(id);
        for relation in Relation::TASK_RELATIONS {
            self.graphs.graph_mut(relation).add_vertex(id);
        }
        self.materialize_edges(plan, id, RelationScope::Task)?;
        for event in bound {
            self.wrap_event(plan, event)?;
        }
        Ok(id)
    }

    /// Import a plan event generator into the transaction, once.
    pub fn wrap_event(&mut self, plan: &Plan, id: ObjectId) -> Result<ObjectId, PlanError> {
        if self.events.contains_key(&id) {
            return Ok(id);
        }
        let generator = plan.event(id)?.clone();
        self.events.insert(id, generator);
        self.imported_events.insert(id);
        for relation in Relation::EVENT_RELATIONS {
            self.graphs.graph_mut(relation).add_vertex(id);
        }
        self.materialize_edges(plan, id, RelationScope::Event)?;
        Ok(id)
    }

    /// Copy the plan edges between `id` and the already-wrapped vertices
    /// into the transaction graphs, recording them in the snapshot.
    fn materialize_edges(
        &mut self,
        plan: &Plan,
        id: ObjectId,
        scope: RelationScope,
    ) -> Result<(), PlanError> {
        for relation in Relation::ALL {
            if relation.scope() != scope {
                continue;
            }
            let plan_graph = plan.graph(relation);
            if !plan_graph.contains(id) {
                continue;
            }
            let children: Vec<(ObjectId, EdgeInfo)> = plan_graph
                .children(id)
                .filter(|c| self.graphs.graph(relation).contains(*c))
                .map(|c| (c, plan_graph.edge_info(id, c).cloned().unwrap_or_default()))
                .collect();
            let parents: Vec<(ObjectId, EdgeInfo)> = plan_graph
                .parents(id)
                .filter(|p| self.graphs.graph(relation).contains(*p))
                .map(|p| (p, plan_graph.edge_info(p, id).cloned().unwrap_or_default()))
                .collect();
            for (child, info) in children {
                self.graphs.graph_mut(relation).add_edge(id, child, info)?;
                self.snapshot_edges[relation.index()].insert((id, child));
            }
            for (parent, info) in parents {
                self.graphs.graph_mut(relation).add_edge(parent, id, info)?;
                self.snapshot_edges[relation.index()].insert((parent, id));
            }
        }
        Ok(())
    }

    // -- local objects ------------------------------------------------------

    /// Create a task local to the transaction. Its events are bound
    /// immediately and its model wiring staged, so it behaves exactly like a
    /// plan task inside the transaction; ids survive commit unchanged.
    pub fn add_task(&mut self, task: Task) -> Result<ObjectId, PlanError> {
        let id = task.id();
        if self.tasks.contains_key(&id) {
            return Ok(id);
        }
        let mut task = task;
        let generators = bind_task_events(&mut task)?;
        for relation in Relation::TASK_RELATIONS {
            self.graphs.graph_mut(relation).add_vertex(id);
        }
        let mut generator_ids = Vec::with_capacity(generators.len());
        for generator in generators {
            let generator_id = generator.id();
            for relation in Relation::EVENT_RELATIONS {
                self.graphs.graph_mut(relation).add_vertex(generator_id);
            }
            self.events.insert(generator_id, generator);
            self.local_events.insert(generator_id);
            generator_ids.push(generator_id);
        }
        let wiring = model_wiring(&task);
        self.local_generators.insert(id, generator_ids);
        self.tasks.insert(id, task);
        self.local_tasks.insert(id);
        for (relation, from, to) in wiring {
            self.add_edge(relation, from, to, EdgeInfo::None)?;
        }
        Ok(id)
    }

    /// Create a free event generator local to the transaction.
    pub fn add_free_event(&mut self, generator: EventGenerator) -> ObjectId {
        let id = generator.id();
        for relation in Relation::EVENT_RELATIONS {
            self.graphs.graph_mut(relation).add_vertex(id);
        }
        self.events.insert(id, generator);
        self.local_events.insert(id);
        id
    }

    // -- reads --------------------------------------------------------------

    pub fn task(&self, id: ObjectId) -> Result<&Task, PlanError> {
        self.tasks
            .get(&id)
            .ok_or_else(|| PlanError::Finalized(id.to_string()))
    }

    pub fn event(&self, id: ObjectId) -> Result<&EventGenerator, PlanError> {
        self.events
            .get(&id)
            .ok_or_else(|| PlanError::Finalized(id.to_string()))
    }

    pub fn graph(&self, relation: Relation) -> &crate::internal::relation::RelationGraph {
        self.graphs.graph(relation)
    }

    // -- staged mutations ---------------------------------------------------

    /// Stage an edge addition between two transaction vertices.
    pub fn add_edge(
        &mut self,
        relation: Relation,
        parent: ObjectId,
        child: ObjectId,
        info: EdgeInfo,
    ) -> Result<(), PlanError> {
        self.check_endpoint(relation, parent)?;
        self.check_endpoint(relation, child)?;
        if relation == Relation::Signal {
            let target = self.event(child)?;
            if !target.controllable() {
                return Err(PlanError::NotControllable(child.to_string()));
            }
        }
        self.graphs.graph_mut(relation).add_edge(parent, child, info)?;
        if matches!(relation, Relation::Signal | Relation::Forwarding) {
            self.graphs
                .graph_mut(Relation::CausalLink)
                .add_edge(parent, child, EdgeInfo::None)?;
        }
        Ok(())
    }

    /// Stage an edge removal; no-op when the edge is not part of the
    /// transaction's view.
    pub fn remove_edge(&mut self, relation: Relation, parent: ObjectId, child: ObjectId) {
        if self
            .graphs
            .graph_mut(relation)
            .remove_edge(parent, child)
            .is_none()
        {
            return;
        }
        if matches!(relation, Relation::Signal | Relation::Forwarding) {
            let other = if relation == Relation::Signal {
                Relation::Forwarding
            } else {
                Relation::Signal
            };
            if !self.graphs.graph(other).has_edge(parent, child) {
                self.graphs
                    .graph_mut(Relation::CausalLink)
                    .remove_edge(parent, child);
            }
        }
    }

    fn check_endpoint(&self, relation: Relation, id: ObjectId) -> Result<(), PlanError> {
        let present = match relation.scope() {
            RelationScope::Task => self.tasks.contains_key(&id),
            RelationScope::Event => self.events.contains_key(&id),
        };
        if present {
            Ok(())
        } else {
            Err(PlanError::Finalized(id.to_string()))
        }
    }

    /// Stage an argument write; visible through the proxy immediately,
    /// replayed onto the original at commit.
    pub fn set_argument(
        &mut self,
        task: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<(), PlanError> {
        let proxy = self
            .tasks
            .get_mut(&task)
            .ok_or_else(|| PlanError::Finalized(task.to_string()))?;
        proxy.arguments_mut().set(name, value.clone());
        if !self.local_tasks.contains(&task) {
            self.argument_ops.push((task, name.to_string(), value));
        }
        Ok(())
    }

    /// Stage an emission handler registration on a wrapped or local event.
    pub fn on(&mut self, event: ObjectId, handler: EmissionHandler) -> Result<(), PlanError> {
        let proxy = self
            .events
            .get_mut(&event)
            .ok_or_else(|| PlanError::Finalized(event.to_string()))?;
        proxy.on(handler.clone());
        if !self.local_events.contains(&event) {
            self.staged_handlers.push((event, handler));
        }
        Ok(())
    }

    pub fn add_mission(&mut self, task: ObjectId) -> Result<(), PlanError> {
        self.task(task)?;
        self.missions_removed.remove(&task);
        self.missions_added.insert(task);
        Ok(())
    }

    pub fn remove_mission(&mut self, task: ObjectId) {
        self.missions_added.remove(&task);
        self.missions_removed.insert(task);
    }

    pub fn add_permanent_task(&mut self, task: ObjectId) -> Result<(), PlanError> {
        self.task(task)?;
        self.permanent_tasks_removed.remove(&task);
        self.permanent_tasks_added.insert(task);
        Ok(())
    }

    pub fn remove_permanent_task(&mut self, task: ObjectId) {
        self.permanent_tasks_added.remove(&task);
        self.permanent_tasks_removed.insert(task);
    }

    pub fn add_permanent_event(&mut self, event: ObjectId) -> Result<(), PlanError> {
        self.event(event)?;
        self.permanent_events_removed.remove(&event);
        self.permanent_events_added.insert(event);
        Ok(())
    }

    pub fn remove_permanent_event(&mut self, event: ObjectId) {
        self.permanent_events_added.remove(&event);
        self.permanent_events_removed.insert(event);
    }

    // -- commit / discard ---------------------------------------------------

    /// Atomically apply the staged modifications to the plan. Validation
    /// runs first; once the first plan mutation happens, no user code runs
    /// until the last one. On `Err` the transaction is consumed with no
    /// effect on the plan.
    pub fn commit(mut self, plan: &mut Plan) -> Result<(), PlanError> {
        // validation: every imported object must still be part of the plan
        for id in &self.imported_tasks {
            if !plan.contains_task(*id) {
                return Err(PlanError::CommitConflict(format!(
                    "task {id} was finalized while the transaction was open"
                )));
            }
        }
        for id in &self.imported_events {
            if !plan.contains_event(*id) {
                return Err(PlanError::CommitConflict(format!(
                    "event {id} was finalized while the transaction was open"
                )));
            }
        }

        // edge diff against the wrap-time snapshot
        let mut additions: Vec<(Relation, ObjectId, ObjectId, EdgeInfo)> = Vec::new();
        let mut removals: Vec<(Relation, ObjectId, ObjectId)> = Vec::new();
        for relation in Relation::ALL {
            if relation == Relation::CausalLink {
                // maintained as the mirror of Signal/Forwarding on both sides
                continue;
            }
            let staged = self.graphs.graph(relation);
            let snapshot = &self.snapshot_edges[relation.index()];
            for (parent, child, info) in staged.edges() {
                if !snapshot.contains(&(parent, child)) {
                    additions.push((relation, parent, child, info.cloned().unwrap_or_default()));
                }
            }
            for (parent, child) in snapshot {
                if !staged.has_edge(*parent, *child) {
                    removals.push((relation, *parent, *child));
                }
            }
        }

        // DAG validation on clones before touching the plan
        for relation in Relation::ALL {
            if !relation.is_dag() {
                continue;
            }
            let touched = additions.iter().any(|(r, ..)| *r == relation)
                || removals.iter().any(|(r, ..)| *r == relation);
            if !touched {
                continue;
            }
            let mut probe = plan.graph(relation).clone();
            for (r, parent, child) in &removals {
                if *r == relation {
                    probe.remove_edge(*parent, *child);
                }
            }
            for (r, parent, child, info) in &additions {
                if *r == relation {
                    probe
                        .add_edge(*parent, *child, info.clone())
                        .map_err(|e| PlanError::CommitConflict(e.to_string()))?;
                }
            }
        }

        // apply: locals, then edges, then marks, then replayed mutations
        let local_tasks = std::mem::take(&mut self.local_tasks);
        for id in &local_tasks {
            let task = self.tasks.remove(id).ok_or_else(|| {
                PlanError::CommitConflict(format!("local task {id} disappeared"))
            })?;
            let generators: Vec<EventGenerator> = self
                .local_generators
                .remove(id)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|generator_id| self.events.remove(&generator_id))
                .collect();
            plan.insert_prepared_task(task, generators);
        }
        for id in std::mem::take(&mut self.local_events) {
            if let Some(generator) = self.events.remove(&id)
                && generator.task().is_none()
            {
                plan.add_free_event(generator);
            }
        }
        for (relation, parent, child) in removals {
            plan.remove_edge(relation, parent, child);
        }
        for (relation, parent, child, info) in additions {
            plan.add_edge(relation, parent, child, info)?;
        }
        for task in self.missions_added.drain() {
            plan.add_mission(task)?;
        }
        for task in self.missions_removed.drain() {
            plan.remove_mission(task);
        }
        for task in self.permanent_tasks_added.drain() {
            plan.add_permanent_task(task)?;
        }
        for task in self.permanent_tasks_removed.drain() {
            plan.remove_permanent_task(task);
        }
        for event in self.permanent_events_added.drain() {
            plan.add_permanent_event(event)?;
        }
        for event in self.permanent_events_removed.drain() {
            plan.remove_permanent_event(event);
        }
        for (task, name, value) in self.argument_ops.drain(..) {
            if let Some(original) = plan.get_task_mut(task) {
                original.arguments_mut().set(&name, value);
            }
        }
        for (event, handler) in self.staged_handlers.drain(..) {
            if let Some(original) = plan.get_event_mut(event) {
                original.on(handler);
            }
        }
        Ok(())
    }

    /// Drop all proxies and locals with no effect on the plan.
    pub fn discard(self) {}
}

impl Plan {
    /// Run `f` with a fresh transaction; commit when it returns `Ok`,
    /// discard when it returns `Err`.
    pub fn in_transaction<R>(
        &mut self,
        f: impl FnOnce(&Plan, &mut Transaction) -> Result<R, PlanError>,
    ) -> Result<R, PlanError> {
        let mut transaction = Transaction::new(self);
        match f(self, &mut transaction) {
            Ok(result) => {
                transaction.commit(self)?;
                Ok(result)
            }
            Err(error) => {
                transaction.discard();
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::Transaction;
    use crate::internal::{
        plan::Plan,
        relation::{DependencyInfo, EdgeInfo, Relation},
        task::{Task, TaskModel},
    };

    fn model(name: &str) -> Arc<TaskModel> {
        Arc::new(TaskModel::new(name))
    }

    /// Wrapping the same object twice yields the same proxy identity.
    #[test]
    fn test_wrap_identity() {
        let mut plan = Plan::new();
        let id = plan.add_task(Task::new(model("MoveTo"))).unwrap();
        let mut trsc = Transaction::new(&plan);
        assert_eq!(trsc.wrap_task(&plan, id).unwrap(), id);
        assert_eq!(trsc.wrap_task(&plan, id).unwrap(), id);
    }

    /// Modifications stay invisible until commit, then all appear.
    #[test]
    fn test_commit_applies_everything() {
        let mut plan = Plan::new();
        let mut trsc = Transaction::new(&plan);
        let parent = trsc.add_task(Task::new(model("Root"))).unwrap();
        let child = trsc.add_task(Task::new(model("Leaf"))).unwrap();
        trsc.add_edge(
            Relation::Dependency,
            parent,
            child,
            EdgeInfo::Dependency(DependencyInfo::new()),
        )
        .unwrap();
        trsc.add_mission(parent).unwrap();

        assert_eq!(plan.task_count(), 0);
        trsc.commit(&mut plan).unwrap();
        assert_eq!(plan.task_count(), 2);
        assert!(plan.graph(Relation::Dependency).has_edge(parent, child));
        assert!(plan.is_mission(parent));
        // model wiring of locals landed too
        let stop = plan.task(parent).unwrap().stop_event().unwrap();
        let success = plan.task(parent).unwrap().event("success").unwrap();
        assert!(plan.graph(Relation::Forwarding).has_edge(success, stop));
    }

    /// Discard leaves the plan untouched.
    #[test]
    fn test_discard_is_invisible() {
        let mut plan = Plan::new();
        let id = plan.add_task(Task::new(model("MoveTo"))).unwrap();
        let mut trsc = Transaction::new(&plan);
        trsc.wrap_task(&plan, id).unwrap();
        trsc.set_argument(id, "goal", json!([1, 2])).unwrap();
        let other = trsc.add_task(Task::new(model("Extra"))).unwrap();
        trsc.remove_mission(id);
        trsc.discard();
        assert_eq!(plan.task_count(), 1);
        assert!(plan.task(other).is_err());
        assert!(plan.task(id).unwrap().arguments().get("goal").is_none());
    }

    /// Edge removals staged in the transaction reach the plan at commit;
    /// concurrent edges outside the wrapped scope survive.
    #[test]
    fn test_edge_diff_against_snapshot() {
        let mut plan = Plan::new();
        let a = plan.add_task(Task::new(model("A"))).unwrap();
        let b = plan.add_task(Task::new(model("B"))).unwrap();
        let c = plan.add_task(Task::new(model("C"))).unwrap();
        plan.add_edge(Relation::Dependency, a, b, EdgeInfo::None).unwrap();

        let mut trsc = Transaction::new(&plan);
        trsc.wrap_task(&plan, a).unwrap();
        trsc.wrap_task(&plan, b).unwrap();
        trsc.remove_edge(Relation::Dependency, a, b);

        // concurrent change outside the wrapped scope
        plan.add_edge(Relation::Dependency, b, c, EdgeInfo::None).unwrap();

        trsc.commit(&mut plan).unwrap();
        assert!(!plan.graph(Relation::Dependency).has_edge(a, b));
        assert!(plan.graph(Relation::Dependency).has_edge(b, c));
    }

    /// A concurrent plan change that would make a staged DAG edge cyclic
    /// fails the whole commit.
    #[test]
    fn test_commit_conflict_on_cycle() {
        let mut plan = Plan::new();
        let a = plan.add_task(Task::new(model("A"))).unwrap();
        let b = plan.add_task(Task::new(model("B"))).unwrap();

        let mut trsc = Transaction::new(&plan);
        trsc.wrap_task(&plan, a).unwrap();
        trsc.wrap_task(&plan, b).unwrap();
        trsc.add_edge(Relation::Dependency, a, b, EdgeInfo::None).unwrap();

        // concurrent plan change introducing the reverse edge
        plan.add_edge(Relation::Dependency, b, a, EdgeInfo::None).unwrap();

        assert!(trsc.commit(&mut plan).is_err());
        assert!(!plan.graph(Relation::Dependency).has_edge(a, b));
    }

    /// in_transaction commits on Ok and discards on Err.
    #[test]
    fn test_in_transaction() {
        let mut plan = Plan::new();
        let id = plan
            .in_transaction(|_, trsc| trsc.add_task(Task::new(model("MoveTo"))))
            .unwrap();
        assert!(plan.task(id).is_ok());

        let result: Result<(), _> = plan.in_transaction(|_, trsc| {
            trsc.add_task(Task::new(model("Doomed")))?;
            Err(crate::errors::PlanError::CustomError("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(plan.task_count(), 1);
    }
}
