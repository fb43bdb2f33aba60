//! The plan arena: tasks, event generators, relation graphs, ownership
//! marks, and the model/state indexes that keep typed queries O(1) per
//! candidate.
//!
//! Objects are owned by identity: every cross-reference in the crate is an
//! [`ObjectId`] resolved through the plan, never a pointer. Handles held by
//! external code survive finalization and fail open to
//! [`PlanError::Finalized`].

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    errors::PlanError,
    ident::{Digest, ObjectId},
    internal::{
        event::generator::{EventGenerator, GeneratorKind},
        relation::{EdgeInfo, Relation, RelationGraph, RelationScope},
        task::{Task, TaskState},
    },
};

/// Structural change journal entry, drained by the execution engine into the
/// event logger once per cycle. A transaction commit appends its whole batch
/// before any other code runs, so the journal preserves commit atomicity.
#[derive(Clone, Debug)]
pub enum PlanChange {
    TaskAdded {
        task: ObjectId,
        model_digest: Digest,
        arguments_digest: Digest,
        bound_events: Vec<(String, ObjectId)>,
    },
    TaskFinalized {
        task: ObjectId,
    },
    EdgeAdded {
        relation: Relation,
        parent: ObjectId,
        child: ObjectId,
        info_digest: Digest,
    },
    EdgeRemoved {
        relation: Relation,
        parent: ObjectId,
        child: ObjectId,
    },
}

/// Create and bind one generator per model event symbol, with the default
/// command ("arrange for the event itself to emit") on controllable events
/// and the model-level handlers attached. Shared by [`Plan::add_task`] and
/// the transaction layer so both bind identically.
pub(crate) fn bind_task_events(task: &mut Task) -> Result<Vec<EventGenerator>, PlanError> {
    task.model().validate()?;
    let model = task.model().clone();
    let id = task.id();
    let mut generators = Vec::with_capacity(model.events().len());
    for event_model in model.events() {
        let symbol = event_model.symbol.clone();
        let mut generator = EventGenerator::with_kind(GeneratorKind::TaskBound {
            task: id,
            symbol: symbol.clone(),
        });
        if event_model.controllable {
            let generator_id = generator.id();
            generator.set_command(Rc::new(move |propagation, context| {
                propagation.emit(generator_id, context)
            }));
        }
        for handler in model.handlers_for(&symbol) {
            generator.on(handler);
        }
        task.bind_event(&symbol, generator.id());
        generators.push(generator);
    }
    Ok(generators)
}

/// The model-level Signal/Forwarding edges of a bound task, ready to insert.
pub(crate) fn model_wiring(task: &Task) -> Vec<(Relation, ObjectId, ObjectId)> {
    let model = task.model();
    let mut wiring = Vec::new();
    for (from, to) in model.forwardings() {
        if let (Ok(from), Ok(to)) = (task.event(from), task.event(to)) {
            wiring.push((Relation::Forwarding, from, to));
        }
    }
    for (from, to) in model.signals() {
        if let (Ok(from), Ok(to)) = (task.event(from), task.event(to)) {
            wiring.push((Relation::Signal, from, to));
        }
    }
    wiring
}

/// The set of relation graphs of one plan or transaction, indexed by
/// [`Relation::index`].
#[derive(Clone, Debug)]
pub(crate) struct RelationGraphs {
    graphs: [RelationGraph; 9],
}

impl RelationGraphs {
    pub(crate) fn new() -> Self {
        Self {
            graphs: Relation::ALL.map(RelationGraph::new),
        }
    }

    pub(crate) fn graph(&self, relation: Relation) -> &RelationGraph {
        &self.graphs[relation.index()]
    }

    pub(crate) fn graph_mut(&mut self, relation: Relation) -> &mut RelationGraph {
        &mut self.graphs[relation.index()]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &RelationGraph> {
        self.graphs.iter()
    }
}

/// A collection of tasks and free events, their relation graphs, and the
/// mission/permanent marks that drive garbage collection.
pub struct Plan {
    tasks: AHashMap<ObjectId, Task>,
    events: AHashMap<ObjectId, EventGenerator>,
    free_events: AHashSet<ObjectId>,
    graphs: RelationGraphs,
    missions: AHashSet<ObjectId>,
    permanent_tasks: AHashSet<ObjectId>,
    permanent_events: AHashSet<ObjectId>,
    model_index: AHashMap<String, AHashSet<ObjectId>>,
    state_index: [AHashSet<ObjectId>; 5],
    /// `achieve_with` links: (achieving task's success event, achieved
    /// generator). The target becomes unreachable when the source does,
    /// regardless of its own controllability.
    achieve_links: Vec<(ObjectId, ObjectId)>,
    changes: Vec<PlanChange>,
    cycle: u64,
    executable: bool,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan {
    pub fn new() -> Self {
        Self {
            tasks: AHashMap::new(),
            events: AHashMap::new(),
            free_events: AHashSet::new(),
            graphs: RelationGraphs::new(),
            missions: AHashSet::new(),
            permanent_tasks: AHashSet::new(),
            permanent_events: AHashSet::new(),
            achieve_links: Vec::new(),
            model_index: AHashMap::new(),
            state_index: Default::default(),
            changes: Vec::new(),
            cycle: 0,
            executable: false,
        }
    }

    /// Monotonic execution cycle counter, bumped by the engine.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub(crate) fn bump_cycle(&mut self) {
        self.cycle += 1;
    }

    /// Plain plans hold objects whose events cannot be called or emitted;
    /// binding an execution engine makes the plan executable.
    pub fn executable(&self) -> bool {
        self.executable
    }

    pub(crate) fn set_executable(&mut self, executable: bool) {
        self.executable = executable;
    }

    // -- object insertion ---------------------------------------------------

    /// Insert a task, taking ownership. Idempotent: re-adding a task already
    /// in the plan is a no-op. Binds one generator per model event symbol,
    /// wires the model-level forwardings and signals, and attaches the
    /// model-level handlers.
    pub fn add_task(&mut self, task: Task) -> Result<ObjectId, PlanError> {
        let id = task.id();
        if self.tasks.contains_key(&id) {
            return Ok(id);
        }
        let mut task = task;
        let generators = bind_task_events(&mut task)?;
        let wiring = model_wiring(&task);
        self.insert_prepared_task(task, generators);
        for (relation, from, to) in wiring {
            self.add_edge(relation, from, to, EdgeInfo::None)?;
        }
        Ok(id)
    }

    /// Insert a task whose generators were already bound (directly or by a
    /// transaction). Model wiring edges are the caller's responsibility.
    pub(crate) fn insert_prepared_task(&mut self, task: Task, generators: Vec<EventGenerator>) {
        let id = task.id();
        let model = task.model().clone();
        for generator in generators {
            self.insert_event(generator);
        }
        for relation in Relation::TASK_RELATIONS {
            self.graphs.graph_mut(relation).add_vertex(id);
        }
        self.model_index
            .entry(model.name().to_string())
            .or_default()
            .insert(id);
        self.state_index[task.state().index()].insert(id);
        self.changes.push(PlanChange::TaskAdded {
            task: id,
            model_digest: model.digest(),
            arguments_digest: task.arguments().digest(),
            bound_events: task.bound_events().map(|(s, g)| (s.to_string(), g)).collect(),
        });
        self.tasks.insert(id, task);
    }

    /// Insert a free event generator, taking ownership. Idempotent.
    pub fn add_free_event(&mut self, generator: EventGenerator) -> ObjectId {
        let id = generator.id();
        if self.events.contains_key(&id) {
            return id;
        }
        self.free_events.insert(id);
        self.insert_event(generator);
        id
    }

    fn insert_event(&mut self, generator: EventGenerator) {
        let id = generator.id();
        for relation in Relation::EVENT_RELATIONS {
            self.graphs.graph_mut(relation).add_vertex(id);
        }
        self.events.insert(id, generator);
    }

    // -- object access ------------------------------------------------------

    pub fn contains_task(&self, id: ObjectId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn contains_event(&self, id: ObjectId) -> bool {
        self.events.contains_key(&id)
    }

    pub fn get_task(&self, id: ObjectId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub(crate) fn get_task_mut(&mut self, id: ObjectId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Resolve a task handle; fails open to `Finalized` for ids that are not
    /// (or no longer) part of this plan.
    pub fn task(&self, id: ObjectId) -> Result<&Task, PlanError> {
        self.tasks
            .get(&id)
            .ok_or_else(|| PlanError::Finalized(id.to_string()))
    }

    /// Mutable task handle, for argument writes and handler registration.
    pub fn task_mut(&mut self, id: ObjectId) -> Result<&mut Task, PlanError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| PlanError::Finalized(id.to_string()))
    }

    pub fn get_event(&self, id: ObjectId) -> Option<&EventGenerator> {
        self.events.get(&id)
    }

    pub(crate) fn get_event_mut(&mut self, id: ObjectId) -> Option<&mut EventGenerator> {
        self.events.get_mut(&id)
    }

    /// Resolve an event handle; fails open to `Finalized`.
    pub fn event(&self, id: ObjectId) -> Result<&EventGenerator, PlanError> {
        self.events
            .get(&id)
            .ok_or_else(|| PlanError::Finalized(id.to_string()))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.tasks.keys().copied()
    }

    pub fn free_events(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.free_events.iter().copied()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// True when no tasks remain; the shutdown sequence runs GC cycles until
    /// this holds.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    // -- relation graphs ----------------------------------------------------

    pub fn graph(&self, relation: Relation) -> &RelationGraph {
        self.graphs.graph(relation)
    }

    pub(crate) fn graph_mut(&mut self, relation: Relation) -> &mut RelationGraph {
        self.graphs.graph_mut(relation)
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

    /// Add an edge in the given relation. Both endpoints must live in this
    /// plan; Signal targets must be controllable; DAG relations reject
    /// cycles. Signal/Forwarding edges are mirrored into CausalLink.
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
        let info_digest = info.digest();
        self.graphs.graph_mut(relation).add_edge(parent, child, info)?;
        if matches!(relation, Relation::Signal | Relation::Forwarding) {
            self.graphs
                .graph_mut(Relation::CausalLink)
                .add_edge(parent, child, EdgeInfo::None)?;
        }
        self.changes.push(PlanChange::EdgeAdded {
            relation,
            parent,
            child,
            info_digest,
        });
        Ok(())
    }

    /// Remove an edge; no-op when absent. The CausalLink mirror edge is
    /// dropped only when neither Signal nor Forwarding still carries it.
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
        self.changes.push(PlanChange::EdgeRemoved {
            relation,
            parent,
            child,
        });
    }

    /// Convenience: add a Signal edge (fire `target`'s command when
    /// `source` emits).
    pub fn signal(&mut self, source: ObjectId, target: ObjectId) -> Result<(), PlanError> {
        self.add_edge(Relation::Signal, source, target, EdgeInfo::None)
    }

    /// Convenience: add a Forwarding edge (emit `target` when `source`
    /// emits).
    pub fn forward(&mut self, source: ObjectId, target: ObjectId) -> Result<(), PlanError> {
        self.add_edge(Relation::Forwarding, source, target, EdgeInfo::None)
    }

    /// Convenience lifting [`Plan::signal`] to task event symbols.
    pub fn signal_events(
        &mut self,
        source_task: ObjectId,
        source_symbol: &str,
        target_task: ObjectId,
        target_symbol: &str,
    ) -> Result<(), PlanError> {
        let source = self.task(source_task)?.event(source_symbol)?;
        let target = self.task(target_task)?.event(target_symbol)?;
        self.signal(source, target)
    }

    /// Convenience lifting [`Plan::forward`] to task event symbols.
    pub fn forward_events(
        &mut self,
        source_task: ObjectId,
        source_symbol: &str,
        target_task: ObjectId,
        target_symbol: &str,
    ) -> Result<(), PlanError> {
        let source = self.task(source_task)?.event(source_symbol)?;
        let target = self.task(target_task)?.event(target_symbol)?;
        self.forward(source, target)
    }

    /// The dependency child of `task` filling `role`, if any.
    pub fn find_child(&self, task: ObjectId, role: &str) -> Option<ObjectId> {
        let graph = self.graph(Relation::Dependency);
        graph.children(task).find(|child| {
            graph
                .edge_info(task, *child)
                .and_then(|info| info.as_dependency())
                .map(|info| info.roles.contains(role))
                .unwrap_or(false)
        })
    }

    // -- missions and permanents --------------------------------------------

    pub fn add_mission(&mut self, task: ObjectId) -> Result<(), PlanError> {
        self.task(task)?;
        self.missions.insert(task);
        Ok(())
    }

    pub fn remove_mission(&mut self, task: ObjectId) {
        self.missions.remove(&task);
    }

    pub fn add_permanent_task(&mut self, task: ObjectId) -> Result<(), PlanError> {
        self.task(task)?;
        self.permanent_tasks.insert(task);
        Ok(())
    }

    pub fn remove_permanent_task(&mut self, task: ObjectId) {
        self.permanent_tasks.remove(&task);
    }

    pub fn add_permanent_event(&mut self, event: ObjectId) -> Result<(), PlanError> {
        self.event(event)?;
        self.permanent_events.insert(event);
        Ok(())
    }

    pub fn remove_permanent_event(&mut self, event: ObjectId) {
        self.permanent_events.remove(&event);
    }

    pub fn is_mission(&self, task: ObjectId) -> bool {
        self.missions.contains(&task)
    }

    pub fn is_permanent_task(&self, task: ObjectId) -> bool {
        self.permanent_tasks.contains(&task)
    }

    pub fn is_permanent_event(&self, event: ObjectId) -> bool {
        self.permanent_events.contains(&event)
    }

    pub fn missions(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.missions.iter().copied()
    }

    pub fn permanent_tasks(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.permanent_tasks.iter().copied()
    }

    pub fn permanent_events(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.permanent_events.iter().copied()
    }

    pub(crate) fn clear_missions(&mut self) {
        self.missions.clear();
    }

    // -- indexes ------------------------------------------------------------

    pub(crate) fn tasks_by_model(&self, model: &str) -> Option<&AHashSet<ObjectId>> {
        self.model_index.get(model)
    }

    pub(crate) fn tasks_in_state(&self, state: TaskState) -> &AHashSet<ObjectId> {
        &self.state_index[state.index()]
    }

    /// Update a task's cached state and the state index. The kernel is the
    /// only caller; states never regress.
    pub(crate) fn set_task_state(&mut self, id: ObjectId, state: TaskState) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let old = task.state();
        if old == state {
            return;
        }
        task.set_state(state);
        self.state_index[old.index()].remove(&id);
        self.state_index[state.index()].insert(id);
    }

    // -- replacement --------------------------------------------------------

    /// Replace `old` by `new` everywhere `old` appears in a strong relation:
    /// parent-side edges and child-side edges both move, with edge infos
    /// merged through the relation's policy. Mission and permanent marks
    /// carry over; weak edges are dropped with `old`'s removal eligibility.
    pub fn replace_task(&mut self, old: ObjectId, new: ObjectId) -> Result<(), PlanError> {
        self.replace_edges(old, new, true)
    }

    /// Replace `old` by `new` in its parents only: `old` keeps its own
    /// subplan (its strong children), which lets a placeholder hand its
    /// place over while its planning artifacts are collected separately.
    pub fn replace(&mut self, old: ObjectId, new: ObjectId) -> Result<(), PlanError> {
        self.replace_edges(old, new, false)
    }

    fn replace_edges(
        &mut self,
        old: ObjectId,
        new: ObjectId,
        move_children: bool,
    ) -> Result<(), PlanError> {
        self.task(old)?;
        self.task(new)?;
        for relation in Relation::TASK_RELATIONS {
            if !relation.is_strong() {
                continue;
            }
            let parents: Vec<(ObjectId, EdgeInfo)> = {
                let graph = self.graph(relation);
                graph
                    .parents(old)
                    .map(|p| {
                        (
                            p,
                            graph.edge_info(p, old).cloned().unwrap_or_default(),
                        )
                    })
                    .collect()
            };
            for (parent, info) in parents {
                if parent == new {
                    continue;
                }
                let merged = match self.graph(relation).edge_info(parent, new).cloned() {
                    Some(existing) => EdgeInfo::merge(existing, info),
                    None => info,
                };
                self.remove_edge(relation, parent, old);
                self.add_edge(relation, parent, new, merged)?;
            }
            if move_children {
                let children: Vec<(ObjectId, EdgeInfo)> = {
                    let graph = self.graph(relation);
                    graph
                        .children(old)
                        .map(|c| {
                            (
                                c,
                                graph.edge_info(old, c).cloned().unwrap_or_default(),
                            )
                        })
                        .collect()
                };
                for (child, info) in children {
                    if child == new {
                        continue;
                    }
                    let merged = match self.graph(relation).edge_info(new, child).cloned() {
                        Some(existing) => EdgeInfo::merge(existing, info),
                        None => info,
                    };
                    self.remove_edge(relation, old, child);
                    self.add_edge(relation, new, child, merged)?;
                }
            }
        }
        if self.missions.remove(&old) {
            self.missions.insert(new);
        }
        if self.permanent_tasks.remove(&old) {
            self.permanent_tasks.insert(new);
        }
        Ok(())
    }

    // -- removal ------------------------------------------------------------

    /// Remove a task and its bound generators. Fails with `ForbidsRemoval`
    /// while the task is the child of a strong edge; the garbage collector
    /// unlinks parents before finalizing.
    pub fn remove_task(&mut self, id: ObjectId) -> Result<(), PlanError> {
        let task = self.task(id)?;
        for relation in Relation::TASK_RELATIONS {
            if !relation.is_strong() {
                continue;
            }
            if self.graph(relation).parents(id).next().is_some() {
                return Err(PlanError::ForbidsRemoval(format!(
                    "task {id} is still a child in the strong `{relation}` relation"
                )));
            }
        }
        let bound: Vec<ObjectId> = task.bound_events().map(|(_, g)| g).collect();
        let model = task.model().name().to_string();
        let state = task.state();
        for generator in bound {
            self.drop_event(generator);
        }
        for relation in Relation::TASK_RELATIONS {
            self.graphs.graph_mut(relation).remove_vertex(id);
        }
        if let Some(index) = self.model_index.get_mut(&model) {
            index.remove(&id);
        }
        self.state_index[state.index()].remove(&id);
        self.missions.remove(&id);
        self.permanent_tasks.remove(&id);
        self.tasks.remove(&id);
        self.changes.push(PlanChange::TaskFinalized { task: id });
        Ok(())
    }

    /// Remove a free event generator; no-op for unknown ids.
    pub fn remove_free_event(&mut self, id: ObjectId) {
        if !self.free_events.remove(&id) {
            return;
        }
        self.drop_event(id);
    }

    fn drop_event(&mut self, id: ObjectId) {
        for relation in Relation::EVENT_RELATIONS {
            self.graphs.graph_mut(relation).remove_vertex(id);
        }
        self.permanent_events.remove(&id);
        self.achieve_links
            .retain(|(source, target)| *source != id && *target != id);
        self.events.remove(&id);
    }

    // -- achieve links ------------------------------------------------------

    pub(crate) fn add_achieve_link(&mut self, source: ObjectId, target: ObjectId) {
        if !self.achieve_links.contains(&(source, target)) {
            self.achieve_links.push((source, target));
        }
    }

    pub(crate) fn is_achieve_link(&self, source: ObjectId, target: ObjectId) -> bool {
        self.achieve_links.contains(&(source, target))
    }

    // -- change journal -----------------------------------------------------

    pub(crate) fn take_changes(&mut self) -> Vec<PlanChange> {
        std::mem::take(&mut self.changes)
    }

    pub(crate) fn push_change(&mut self, change: PlanChange) {
        self.changes.push(change);
    }

    // -- queries ------------------------------------------------------------

    /// Entry point of the matcher API; see [`crate::internal::plan::query`].
    pub fn find_tasks(&self) -> super::query::TaskQuery {
        super::query::TaskQuery::new()
    }

    // -- snapshot -----------------------------------------------------------

    /// Read-only structural snapshot for the control protocol.
    pub fn snapshot(&self) -> PlanSnapshot {
        let mut tasks: Vec<TaskSnapshot> = self
            .tasks
            .values()
            .map(|task| {
                let mut arguments = serde_json::Map::new();
                for (name, _) in task.arguments().iter() {
                    if let Some(value) = task.arguments().get(name) {
                        arguments.insert(name.to_string(), value.clone());
                    }
                }
                TaskSnapshot {
                    id: task.id().as_u64(),
                    model: task.model().name().to_string(),
                    state: task.state().to_string(),
                    mission: self.is_mission(task.id()),
                    arguments: Value::Object(arguments),
                }
            })
            .collect();
        tasks.sort_by_key(|t| t.id);
        let mut edges = Vec::new();
        for relation in Relation::ALL {
            for (parent, child, _) in self.graph(relation).edges() {
                edges.push(EdgeSnapshot {
                    relation: relation.as_str().to_string(),
                    parent: parent.as_u64(),
                    child: child.as_u64(),
                });
            }
        }
        edges.sort_by(|a, b| (a.parent, a.child, &a.relation).cmp(&(b.parent, b.child, &b.relation)));
        PlanSnapshot {
            cycle: self.cycle,
            tasks,
            edges,
        }
    }
}

/// Serializable structural snapshot of a plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub cycle: u64,
    pub tasks: Vec<TaskSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: u64,
    pub model: String,
    pub state: String,
    pub mission: bool,
    pub arguments: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub relation: String,
    pub parent: u64,
    pub child: u64,
}
