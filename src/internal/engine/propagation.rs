//! The propagation step: processing of queued `call`/`emit` requests to
//! their transitive closure.
//!
//! Queue discipline:
//! - Entries are processed FIFO. An emission requested from inside a running
//!   command goes to the *front* of the queue (depth-first), so a command
//!   that emits synchronously observes its own emission before any sibling
//!   effect.
//! - Effects of one emission enqueue in per-edge insertion order; whether
//!   Signal effects come before Forwarding effects is fixed once, at engine
//!   construction.
//! - `call`/`emit` invoked while propagation runs are queued to the current
//!   step, never to a new cycle.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::{
    errors::PlanError,
    ident::ObjectId,
    internal::{
        event::{
            emission::{Emission, EmissionRef},
            generator::{EmissionHandler, GeneratorKind, UnreachableHandler},
        },
        exception::{FailurePoint, LocalizedError},
        log::record::LogRecord,
        plan::Plan,
        relation::{DependencyInfo, EdgeInfo, Relation},
        task::{TaskModel, TaskState},
    },
};

/// A `call` gathered for a start-like event, waiting for the scheduler.
#[derive(Clone, Debug)]
pub struct PendingCall {
    pub generator: ObjectId,
    pub context: Option<Value>,
}

/// An emission deferred by a Delay generator, to be fired by the engine's
/// timer scan.
#[derive(Clone, Debug)]
pub(crate) struct DelayedEmission {
    pub(crate) generator: ObjectId,
    pub(crate) after: f64,
    pub(crate) context: Option<Value>,
    pub(crate) sources: Vec<EmissionRef>,
}

#[derive(Clone, Debug)]
enum QueueEntry {
    Call {
        generator: ObjectId,
        context: Option<Value>,
        sources: Vec<EmissionRef>,
    },
    Emit {
        generator: ObjectId,
        context: Option<Value>,
        sources: Vec<EmissionRef>,
        /// Set when a Delay generator's wait already elapsed.
        due: bool,
    },
}

/// Mutable view over a plan during one propagation step. All user code
/// (commands, handlers, poll blocks) receives this as its capability to
/// affect the plan.
pub struct Propagation<'a> {
    plan: &'a mut Plan,
    queue: VecDeque<QueueEntry>,
    gathering: bool,
    in_command: bool,
    signal_first: bool,
    now: DateTime<Utc>,
    gathered_start_calls: Vec<PendingCall>,
    pub(crate) errors: Vec<LocalizedError>,
    pub(crate) records: Vec<LogRecord>,
    pub(crate) delayed: Vec<DelayedEmission>,
    pub(crate) emission_count: u32,
}

impl<'a> Propagation<'a> {
    pub(crate) fn new(plan: &'a mut Plan, now: DateTime<Utc>, signal_first: bool) -> Self {
        Self {
            plan,
            queue: VecDeque::new(),
            gathering: false,
            in_command: false,
            signal_first,
            now,
            gathered_start_calls: Vec::new(),
            errors: Vec::new(),
            records: Vec::new(),
            delayed: Vec::new(),
            emission_count: 0,
        }
    }

    pub fn plan(&self) -> &Plan {
        self.plan
    }

    pub fn plan_mut(&mut self) -> &mut Plan {
        self.plan
    }

    /// Wall-clock time of the current cycle.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn set_gathering(&mut self, gathering: bool) {
        self.gathering = gathering;
    }

    pub(crate) fn take_gathered_start_calls(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.gathered_start_calls)
    }

    pub(crate) fn take_errors(&mut self) -> Vec<LocalizedError> {
        std::mem::take(&mut self.errors)
    }

    fn failure_point_of(&self, generator: ObjectId) -> FailurePoint {
        match self.plan.get_event(generator).and_then(|g| g.task()) {
            Some(task) => FailurePoint::Task(task),
            None => FailurePoint::Event(generator),
        }
    }

    fn push_error(&mut self, error: PlanError, generator: ObjectId) {
        let point = self.failure_point_of(generator);
        self.errors.push(LocalizedError::new(error, point));
    }

    // -- call ---------------------------------------------------------------

    /// Queue a command execution. Fails immediately on misuse; the command
    /// itself runs during queue processing.
    pub fn call(&mut self, generator: ObjectId, context: Option<Value>) -> Result<(), PlanError> {
        self.check_call(generator)?;
        let event = self.plan.event(generator)?;
        let is_start = event.symbol() == Some(TaskModel::START);
        if self.gathering && is_start {
            // start decisions are the scheduler's to make
            self.gathered_start_calls.push(PendingCall { generator, context });
            return Ok(());
        }
        self.queue.push_back(QueueEntry::Call {
            generator,
            context,
            sources: Vec::new(),
        });
        Ok(())
    }

    fn check_call(&self, generator: ObjectId) -> Result<(), PlanError> {
        if !self.plan.executable() {
            return Err(PlanError::NotExecutable(
                "the plan has no execution engine".to_string(),
            ));
        }
        let event = self.plan.event(generator)?;
        if event.unreachable() {
            return Err(PlanError::Unreachable(generator.to_string()));
        }
        if !event.controllable() {
            return Err(PlanError::NotControllable(generator.to_string()));
        }
        if let Some(task_id) = event.task() {
            let task = self.plan.task(task_id)?;
            if task.state() == TaskState::Finished {
                return Err(PlanError::Finished(generator.to_string()));
            }
            if !task.executable(self.plan.executable()) {
                return Err(PlanError::NotExecutable(format!(
                    "task {task_id} is abstract or not fully instantiated"
                )));
            }
        }
        Ok(())
    }

    /// Queue a direct call that already passed the scheduler.
    pub(crate) fn enqueue_scheduled_call(&mut self, call: PendingCall) {
        self.queue.push_back(QueueEntry::Call {
            generator: call.generator,
            context: call.context,
            sources: Vec::new(),
        });
    }

    // -- emit ---------------------------------------------------------------

    /// Queue an emission. Fails immediately on misuse; the emission happens
    /// during queue processing, depth-first when requested from inside a
    /// command.
    pub fn emit(&mut self, generator: ObjectId, context: Option<Value>) -> Result<(), PlanError> {
        self.check_emit(generator)?;
        let entry = QueueEntry::Emit {
            generator,
            context,
            sources: Vec::new(),
            due: false,
        };
        if self.in_command {
            self.queue.push_front(entry);
        } else {
            self.queue.push_back(entry);
        }
        Ok(())
    }

    fn check_emit(&self, generator: ObjectId) -> Result<(), PlanError> {
        if !self.plan.executable() {
            return Err(PlanError::NotExecutable(
                "the plan has no execution engine".to_string(),
            ));
        }
        let event = self.plan.event(generator)?;
        if event.unreachable() {
            return Err(PlanError::Unreachable(generator.to_string()));
        }
        if let (Some(task_id), Some(symbol)) = (event.task(), event.symbol()) {
            let task = self.plan.task(task_id)?;
            if !task.executable(self.plan.executable()) {
                return Err(PlanError::NotExecutable(format!(
                    "task {task_id} is abstract or not fully instantiated"
                )));
            }
            task.emission_allowed(symbol)?;
        }
        Ok(())
    }

    pub(crate) fn enqueue_due_emission(
        &mut self,
        generator: ObjectId,
        context: Option<Value>,
        sources: Vec<EmissionRef>,
    ) {
        self.queue.push_back(QueueEntry::Emit {
            generator,
            context,
            sources,
            due: true,
        });
    }

    // -- queue processing ---------------------------------------------------

    /// Drain the queue: the transitive closure of every queued request.
    pub(crate) fn process_queue(&mut self) {
        while let Some(entry) = self.queue.pop_front() {
            match entry {
                QueueEntry::Call {
                    generator,
                    context,
                    sources,
                } => self.process_call(generator, context, sources),
                QueueEntry::Emit {
                    generator,
                    context,
                    sources,
                    due,
                } => self.process_emit(generator, context, sources, due),
            }
        }
    }

    fn process_call(
        &mut self,
        generator: ObjectId,
        context: Option<Value>,
        _sources: Vec<EmissionRef>,
    ) {
        let Some(event) = self.plan.get_event(generator) else {
            return;
        };
        if event.unreachable() {
            self.push_error(PlanError::Unreachable(generator.to_string()), generator);
            return;
        }
        let Some(command) = event.command() else {
            self.push_error(PlanError::NotControllable(generator.to_string()), generator);
            return;
        };
        let symbol = event.symbol().map(str::to_string);
        let task_id = event.task();

        if let (Some(task_id), Some(symbol)) = (task_id, symbol.as_deref()) {
            let Ok(task) = self.plan.task(task_id) else {
                return;
            };
            if task.state() == TaskState::Finished {
                self.push_error(PlanError::Finished(generator.to_string()), generator);
                return;
            }
            let terminal = task
                .model()
                .event_model(symbol)
                .map(|e| e.terminal)
                .unwrap_or(false);
            if symbol == TaskModel::START {
                if task.state() == TaskState::Pending {
                    if let Err(error) = self.resolve_delayed_arguments(task_id) {
                        self.push_error(error, generator);
                        return;
                    }
                    self.plan.set_task_state(task_id, TaskState::Starting);
                }
            } else if terminal
                && matches!(
                    self.plan.task(task_id).map(|t| t.state()),
                    Ok(TaskState::Starting) | Ok(TaskState::Running)
                )
            {
                self.plan.set_task_state(task_id, TaskState::Finishing);
            }
        }

        if let Some(event) = self.plan.get_event_mut(generator) {
            event.set_pending(true);
        }
        self.in_command = true;
        let result = command(self, context);
        self.in_command = false;
        if let Err(error) = result {
            self.push_error(
                PlanError::CommandFailed(generator.to_string(), error.to_string()),
                generator,
            );
        }
    }

    fn process_emit(
        &mut self,
        generator: ObjectId,
        context: Option<Value>,
        sources: Vec<EmissionRef>,
        due: bool,
    ) {
        let Some(event) = self.plan.get_event(generator) else {
            return;
        };
        if event.unreachable() {
            self.push_error(PlanError::Unreachable(generator.to_string()), generator);
            return;
        }

        // combinator gating; the probe avoids holding the generator borrow
        // across the gate mutation
        enum KindProbe {
            Plain,
            And,
            Or,
            Filter(crate::internal::event::generator::FilterFn),
            Delay(f64),
        }
        let probe = match event.kind() {
            GeneratorKind::And(_) => KindProbe::And,
            GeneratorKind::Or(_) => KindProbe::Or,
            GeneratorKind::Filter(filter) => KindProbe::Filter(filter.clone()),
            GeneratorKind::Delay(after) => KindProbe::Delay(*after),
            GeneratorKind::Free | GeneratorKind::TaskBound { .. } => KindProbe::Plain,
        };
        let mut context = context;
        match probe {
            KindProbe::And => {
                let from = sources.first().map(|s| s.generator);
                let Some(event) = self.plan.get_event_mut(generator) else {
                    return;
                };
                let GeneratorKind::And(gate) = event.kind_mut() else {
                    return;
                };
                if let Some(from) = from
                    && gate.waited.contains(&from)
                    && !gate.seen.contains(&from)
                {
                    gate.seen.push(from);
                }
                if gate.fired || gate.seen.len() < gate.waited.len() {
                    return;
                }
                gate.fired = true;
            }
            KindProbe::Or => {
                let Some(event) = self.plan.get_event_mut(generator) else {
                    return;
                };
                let GeneratorKind::Or(gate) = event.kind_mut() else {
                    return;
                };
                if gate.fired {
                    return;
                }
                gate.fired = true;
            }
            KindProbe::Filter(filter) => {
                context = filter(context);
            }
            KindProbe::Delay(after) => {
                if !due {
                    self.delayed.push(DelayedEmission {
                        generator,
                        after,
                        context,
                        sources,
                    });
                    return;
                }
            }
            KindProbe::Plain => {}
        }

        // task state compatibility, re-checked at processing time
        let event = match self.plan.get_event(generator) {
            Some(event) => event,
            None => return,
        };
        let task_id = event.task();
        let symbol = event.symbol().map(str::to_string);
        if let (Some(task_id), Some(symbol)) = (task_id, symbol.as_deref())
            && let Ok(task) = self.plan.task(task_id)
            && let Err(error) = task.emission_allowed(symbol)
        {
            self.push_error(error, generator);
            return;
        }

        let emission = Emission {
            cycle: self.plan.cycle(),
            time: self.now,
            context,
            sources,
        };
        let reference = {
            let Some(event) = self.plan.get_event_mut(generator) else {
                return;
            };
            match event.record_emission(emission.clone()) {
                Ok(reference) => reference,
                Err(error) => {
                    self.push_error(error, generator);
                    return;
                }
            }
        };
        self.emission_count += 1;
        self.records.push(LogRecord::EventEmitted {
            generator: generator.as_u64(),
            context_digest: emission.context_digest(),
            sources: emission
                .sources
                .iter()
                .map(|s| (s.generator.as_u64(), s.index))
                .collect(),
            time: self.now,
        });

        // lifecycle transitions driven by the emission
        if let (Some(task_id), Some(symbol)) = (task_id, symbol.as_deref()) {
            match symbol {
                TaskModel::START => self.plan.set_task_state(task_id, TaskState::Running),
                TaskModel::STOP => self.finish_task(task_id),
                _ => {}
            }
        }

        // handlers, in registration order
        let handlers: Vec<EmissionHandler> = self
            .plan
            .get_event(generator)
            .map(|e| e.handlers())
            .unwrap_or_default();
        for handler in handlers {
            if let Err(error) = handler(self, &emission) {
                self.push_error(
                    PlanError::HandlerFailed(generator.to_string(), error.to_string()),
                    generator,
                );
            }
        }

        // queued effects along Signal and Forwarding, per-edge insertion order
        let signal_children: Vec<ObjectId> =
            self.plan.graph(Relation::Signal).children(generator).collect();
        let forward_children: Vec<ObjectId> = self
            .plan
            .graph(Relation::Forwarding)
            .children(generator)
            .collect();
        let source = vec![reference];
        let enqueue_signals = |propagation: &mut Self| {
            for child in &signal_children {
                propagation.queue.push_back(QueueEntry::Call {
                    generator: *child,
                    context: emission.context.clone(),
                    sources: source.clone(),
                });
            }
        };
        let enqueue_forwards = |propagation: &mut Self| {
            for child in &forward_children {
                propagation.queue.push_back(QueueEntry::Emit {
                    generator: *child,
                    context: emission.context.clone(),
                    sources: source.clone(),
                    due: false,
                });
            }
        };
        if self.signal_first {
            enqueue_signals(self);
            enqueue_forwards(self);
        } else {
            enqueue_forwards(self);
            enqueue_signals(self);
        }
    }

    fn resolve_delayed_arguments(&mut self, task_id: ObjectId) -> Result<(), PlanError> {
        let entries = match self.plan.get_task(task_id) {
            Some(task) => task.arguments().delayed_entries(),
            None => return Ok(()),
        };
        for (name, resolver) in entries {
            let value = resolver(self.plan, task_id).map_err(|error| {
                PlanError::PreconditionFailed(format!(
                    "delayed argument `{name}` of task {task_id} failed to resolve: {error}"
                ))
            })?;
            if let Some(task) = self.plan.get_task_mut(task_id) {
                task.arguments_mut().set(&name, value);
            }
        }
        Ok(())
    }

    /// Stop-emission bookkeeping: the task is finished, its never-emitted
    /// events become unreachable, and execution-agent parents abort.
    fn finish_task(&mut self, task_id: ObjectId) {
        self.plan.set_task_state(task_id, TaskState::Finished);
        let Ok(task) = self.plan.task(task_id) else {
            return;
        };
        let stale: Vec<ObjectId> = task
            .bound_events()
            .map(|(_, id)| id)
            .filter(|id| {
                self.plan
                    .get_event(*id)
                    .map(|e| !e.emitted() && !e.unreachable())
                    .unwrap_or(false)
            })
            .collect();
        let reason = json!({ "task_finished": task_id.as_u64() });
        for event in stale {
            self.unreachable(event, reason.clone());
        }
        // agent stop forces aborted on its executed tasks
        let executed: Vec<ObjectId> = self
            .plan
            .graph(Relation::ExecutionAgent)
            .parents(task_id)
            .collect();
        for parent in executed {
            let aborted = self
                .plan
                .get_task(parent)
                .filter(|t| {
                    matches!(
                        t.state(),
                        TaskState::Starting | TaskState::Running | TaskState::Finishing
                    )
                })
                .and_then(|t| t.event("aborted").ok());
            if let Some(aborted) = aborted {
                self.queue.push_back(QueueEntry::Emit {
                    generator: aborted,
                    context: Some(json!({ "execution_agent_stopped": task_id.as_u64() })),
                    sources: Vec::new(),
                    due: false,
                });
            }
        }
    }

    // -- unreachability -----------------------------------------------------

    /// Monotonically mark a generator unreachable, run its handlers once,
    /// and propagate the loss of reachability along Signal/Forwarding
    /// children that cannot emit on their own any more.
    pub fn unreachable(&mut self, generator: ObjectId, reason: Value) {
        let mut worklist = vec![(generator, reason)];
        while let Some((current, reason)) = worklist.pop() {
            let handlers = {
                let Some(event) = self.plan.get_event_mut(current) else {
                    continue;
                };
                if event.unreachable() {
                    continue;
                }
                event.mark_unreachable(reason.clone())
            };
            self.records.push(LogRecord::EventUnreachable {
                generator: current.as_u64(),
                reason_digest: crate::ident::Digest::of_value(&reason),
                time: self.now,
            });
            for handler in handlers {
                if let Err(error) = handler(self, &reason) {
                    self.push_error(
                        PlanError::HandlerFailed(current.to_string(), error.to_string()),
                        current,
                    );
                }
            }
            let children: Vec<ObjectId> = self
                .plan
                .graph(Relation::CausalLink)
                .children(current)
                .collect();
            for child in children {
                if self.loses_reachability(current, child) {
                    let derived = json!({
                        "unreachable_parent": current.as_u64(),
                        "reason": reason,
                    });
                    worklist.push((child, derived));
                }
            }
        }
    }

    /// Does `child` lose its last way of emitting when `parent` becomes
    /// unreachable? An `and` gate dies with any input; an achieve target
    /// dies with its source regardless of controllability; everything else
    /// needs every causal parent gone and no command of its own.
    fn loses_reachability(&self, parent: ObjectId, child: ObjectId) -> bool {
        let Some(event) = self.plan.get_event(child) else {
            return false;
        };
        if event.unreachable() {
            return false;
        }
        if self.plan.is_achieve_link(parent, child) {
            return true;
        }
        if matches!(event.kind(), GeneratorKind::And(_)) {
            return true;
        }
        if event.controllable() {
            return false;
        }
        self.plan
            .graph(Relation::CausalLink)
            .parents(child)
            .all(|p| {
                self.plan
                    .get_event(p)
                    .map(|e| e.unreachable())
                    .unwrap_or(true)
            })
    }

    /// Register a handler invoked exactly once with the unreachability
    /// reason: immediately when the generator is already unreachable,
    /// otherwise at the moment reachability is lost.
    pub fn when_unreachable(
        &mut self,
        generator: ObjectId,
        handler: UnreachableHandler,
    ) -> Result<(), PlanError> {
        let event = self.plan.event(generator)?;
        if event.unreachable() {
            let reason = event
                .unreachability_reason()
                .cloned()
                .unwrap_or(Value::Null);
            if let Err(error) = handler(self, &reason) {
                self.push_error(
                    PlanError::HandlerFailed(generator.to_string(), error.to_string()),
                    generator,
                );
            }
            return Ok(());
        }
        if let Some(event) = self.plan.get_event_mut(generator) {
            event.push_unreachable_handler(handler);
        }
        Ok(())
    }

    // -- building blocks ----------------------------------------------------

    /// Defer this generator's emission to `task`: the task becomes a
    /// dependency, its `success` emission is forwarded as this generator's
    /// emission, and losing the task without success makes the generator
    /// unreachable.
    pub fn achieve_with(&mut self, generator: ObjectId, task: ObjectId) -> Result<(), PlanError> {
        let success = self.plan.task(task)?.event("success")?;
        if let Some(owner) = self.plan.event(generator)?.task() {
            self.plan.add_edge(
                Relation::Dependency,
                owner,
                task,
                EdgeInfo::Dependency(DependencyInfo::new()),
            )?;
        }
        self.plan
            .add_edge(Relation::Forwarding, success, generator, EdgeInfo::None)?;
        self.plan.add_achieve_link(success, generator);
        if let Some(event) = self.plan.get_event_mut(generator) {
            event.set_pending(true);
        }
        Ok(())
    }

    /// Re-arm an `and`/`or` combinator so it can emit again.
    pub fn reset_combinator(&mut self, generator: ObjectId) -> Result<(), PlanError> {
        let event = self
            .plan
            .get_event_mut(generator)
            .ok_or_else(|| PlanError::Finalized(generator.to_string()))?;
        match event.kind_mut() {
            GeneratorKind::And(gate) => {
                gate.seen.clear();
                gate.fired = false;
                Ok(())
            }
            GeneratorKind::Or(gate) => {
                gate.fired = false;
                Ok(())
            }
            _ => Err(PlanError::InvalidArgument(format!(
                "generator {generator} is not a combinator"
            ))),
        }
    }

    /// Inject a localized error at a task, as if one of its events failed.
    pub fn inject_fault(&mut self, task: ObjectId, error: PlanError) {
        self.errors
            .push(LocalizedError::new(error, FailurePoint::Task(task)));
    }

    /// Fault reaction: drive the task to its configured terminal event. The
    /// command is preferred when controllable; otherwise the event is
    /// emitted directly. Pending tasks just lose their ownership marks and
    /// fall to the garbage collector.
    pub(crate) fn fault_reaction(&mut self, task_id: ObjectId) {
        let Some(task) = self.plan.get_task(task_id) else {
            return;
        };
        match task.state() {
            TaskState::Starting | TaskState::Running => {
                let symbol = task.failure_reaction().to_string();
                let Ok(reaction) = task.event(&symbol) else {
                    return;
                };
                let controllable = self
                    .plan
                    .get_event(reaction)
                    .map(|e| e.controllable())
                    .unwrap_or(false);
                if controllable {
                    self.queue.push_back(QueueEntry::Call {
                        generator: reaction,
                        context: None,
                        sources: Vec::new(),
                    });
                } else {
                    self.queue.push_back(QueueEntry::Emit {
                        generator: reaction,
                        context: None,
                        sources: Vec::new(),
                        due: false,
                    });
                }
            }
            TaskState::Pending => {
                self.plan.remove_mission(task_id);
                self.plan.remove_permanent_task(task_id);
            }
            TaskState::Finishing | TaskState::Finished => {}
        }
    }
}
