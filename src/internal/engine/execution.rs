//! The execution engine: owns a plan, a scheduler, the external event
//! queue, timers, and the event logger, and runs the cycle loop that drives
//! everything in §-order: gather, schedule, propagate, check, propagate
//! errors, collect garbage, log.

use std::{
    collections::VecDeque,
    rc::Rc,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    gc::{self, GarbageCollector},
    propagation::{PendingCall, Propagation},
    scheduler::{self, Scheduler},
};
use crate::{
    config::EngineConfig,
    errors::PlanError,
    ident::{Digest, ObjectId},
    internal::{
        event::{emission::EmissionRef, generator::{EmissionHandler, UnreachableHandler}},
        exception::{
            ExceptionHandler, ExceptionMatcher, ExceptionStatus, LocalizedError, PlanException,
            propagation::propagate_exceptions,
        },
        log::{
            record::{CycleStats, LogRecord},
            writer::EventLogger,
        },
        plan::{Plan, PlanChange},
        relation::{Relation, standard::check_dependencies},
        task::TaskState,
    },
};

/// A request pushed by an external thread, drained at the top of each cycle.
#[derive(Clone, Debug)]
pub enum ExternalEvent {
    Call {
        generator: ObjectId,
        context: Option<Value>,
    },
    Emit {
        generator: ObjectId,
        context: Option<Value>,
    },
}

/// Thread-safe queue connecting worker threads to the kernel. Workers only
/// ever hand over plain data; no plan state crosses this boundary.
#[derive(Default)]
pub struct ExternalQueue {
    queue: Mutex<VecDeque<ExternalEvent>>,
}

impl ExternalQueue {
    pub fn push_emit(&self, generator: ObjectId, context: Option<Value>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(ExternalEvent::Emit { generator, context });
        }
    }

    pub fn push_call(&self, generator: ObjectId, context: Option<Value>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(ExternalEvent::Call { generator, context });
        }
    }

    fn drain(&self) -> Vec<ExternalEvent> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Gather-phase handler: sensor sampling, asynchronous results, anything
/// that turns the outside world into `call`/`emit` requests.
pub type GatherHandler = Rc<dyn Fn(&mut Propagation<'_>) -> Result<(), PlanError>>;

/// Callback invoked for every exception that survived all handlers.
pub type PlanExceptionCallback = Rc<dyn Fn(&PlanException)>;

#[derive(Clone, Debug)]
enum TimerKind {
    /// Produce `TimedOut` if the generator has not emitted by the deadline.
    Deadline { generator: ObjectId },
    /// Fire a Delay generator's deferred emission.
    DelayedEmit {
        generator: ObjectId,
        context: Option<Value>,
        sources: Vec<EmissionRef>,
    },
}

#[derive(Clone, Debug)]
struct TimerEntry {
    at: DateTime<Utc>,
    kind: TimerKind,
}

/// Summary of one completed cycle.
#[derive(Clone, Copy, Debug)]
pub struct CycleReport {
    pub cycle: u64,
    pub duration: Duration,
    pub emissions: u32,
    pub errors: u32,
}

/// Single-threaded cooperative execution engine bound to one plan.
pub struct ExecutionEngine {
    plan: Plan,
    config: EngineConfig,
    scheduler: Box<dyn Scheduler>,
    external: Arc<ExternalQueue>,
    gather_handlers: Vec<GatherHandler>,
    global_exception_handlers: Vec<(ExceptionMatcher, ExceptionHandler)>,
    exception_callback: Option<PlanExceptionCallback>,
    pending_calls: Vec<PendingCall>,
    carryover_errors: Vec<LocalizedError>,
    timers: Vec<TimerEntry>,
    gc: GarbageCollector,
    logger: Option<EventLogger>,
    quit_requested: bool,
    fatal: bool,
}

impl ExecutionEngine {
    /// Bind an engine to a plan, making the plan executable.
    pub fn new(mut plan: Plan, config: EngineConfig) -> Self {
        plan.set_executable(true);
        let scheduler = scheduler::build(config.scheduler);
        let gc = GarbageCollector::new(config.finalize_delay);
        Self {
            plan,
            scheduler,
            external: Arc::new(ExternalQueue::default()),
            gather_handlers: Vec::new(),
            global_exception_handlers: Vec::new(),
            exception_callback: None,
            pending_calls: Vec::new(),
            carryover_errors: Vec::new(),
            timers: Vec::new(),
            gc,
            logger: None,
            quit_requested: false,
            fatal: false,
            config,
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle worker threads use to enqueue emissions for the next cycle.
    pub fn external_queue(&self) -> Arc<ExternalQueue> {
        self.external.clone()
    }

    /// Replace the active scheduler.
    pub fn set_scheduler(&mut self, scheduler: Box<dyn Scheduler>) {
        tracing::debug!("scheduler replaced by `{}`", scheduler.name());
        self.scheduler = scheduler;
    }

    /// Create the event log file under the configured log directory,
    /// resolved against the working directory when relative.
    pub fn attach_logger(&mut self) -> Result<(), PlanError> {
        let log_dir = if self.config.log_dir.is_absolute() {
            self.config.log_dir.clone()
        } else {
            self.config.working_dir.join(&self.config.log_dir)
        };
        std::fs::create_dir_all(&log_dir)?;
        let path = log_dir.join("events.log");
        self.logger = Some(EventLogger::create(path, self.config.log_channel_size)?);
        Ok(())
    }

    /// Use an already-created logger (tests point it at a temp file).
    pub fn set_logger(&mut self, logger: EventLogger) {
        self.logger = Some(logger);
    }

    /// Register an external-event propagation handler, run in phase 1 of
    /// every cycle.
    pub fn on_gather(&mut self, handler: GatherHandler) {
        self.gather_handlers.push(handler);
    }

    /// Register a plan-global exception handler.
    pub fn on_exception(&mut self, matcher: ExceptionMatcher, handler: ExceptionHandler) {
        self.global_exception_handlers.push((matcher, handler));
    }

    /// Callback for exceptions surviving all handlers.
    pub fn on_plan_exception(&mut self, callback: PlanExceptionCallback) {
        self.exception_callback = Some(callback);
    }

    /// Register a deadline: if `generator` has not emitted `seconds` from
    /// now, a `TimedOut` localized error is produced.
    pub fn deadline(&mut self, generator: ObjectId, seconds: f64) -> Result<(), PlanError> {
        self.plan.event(generator)?;
        self.timers.push(TimerEntry {
            at: Utc::now() + chrono::Duration::microseconds((seconds * 1e6) as i64),
            kind: TimerKind::Deadline { generator },
        });
        Ok(())
    }

    /// Request the shutdown sequence: from the next cycle on, missions are
    /// unmarked and normal GC drains the plan; `run` returns when empty.
    pub fn quit(&mut self) {
        self.quit_requested = true;
    }

    pub fn quitting(&self) -> bool {
        self.quit_requested
    }

    // -- out-of-cycle operations -------------------------------------------

    /// Run `f` inside a throwaway propagation step, processing its effects
    /// to closure immediately. Errors and log records flow into the same
    /// places a cycle would put them.
    pub fn with_propagation<R>(
        &mut self,
        f: impl FnOnce(&mut Propagation<'_>) -> R,
    ) -> R {
        let now = Utc::now();
        let mut propagation = Propagation::new(&mut self.plan, now, self.config.signal_first);
        let result = f(&mut propagation);
        propagation.process_queue();
        let records = std::mem::take(&mut propagation.records);
        let delayed = std::mem::take(&mut propagation.delayed);
        let mut leftovers = propagation.take_errors();
        let pending = propagation.take_gathered_start_calls();
        drop(propagation);
        self.carryover_errors.append(&mut leftovers);
        self.pending_calls.extend(pending);
        for entry in delayed {
            self.timers.push(TimerEntry {
                at: now + chrono::Duration::microseconds((entry.after * 1e6) as i64),
                kind: TimerKind::DelayedEmit {
                    generator: entry.generator,
                    context: entry.context,
                    sources: entry.sources,
                },
            });
        }
        if let Some(logger) = &self.logger {
            for record in records {
                logger.record(record);
            }
        }
        result
    }

    /// Call a generator's command; effects run immediately.
    pub fn call(&mut self, generator: ObjectId, context: Option<Value>) -> Result<(), PlanError> {
        self.with_propagation(|p| p.call(generator, context))
    }

    /// Emit a generator; effects run immediately.
    pub fn emit(&mut self, generator: ObjectId, context: Option<Value>) -> Result<(), PlanError> {
        self.with_propagation(|p| p.emit(generator, context))
    }

    /// Mark a generator unreachable; propagation included.
    pub fn unreachable(&mut self, generator: ObjectId, reason: Value) {
        self.with_propagation(|p| p.unreachable(generator, reason));
    }

    /// Register a handler invoked once with the unreachability reason.
    pub fn when_unreachable(
        &mut self,
        generator: ObjectId,
        handler: UnreachableHandler,
    ) -> Result<(), PlanError> {
        self.with_propagation(|p| p.when_unreachable(generator, handler))
    }

    /// Register an emission handler on a generator.
    pub fn on_event(
        &mut self,
        generator: ObjectId,
        handler: EmissionHandler,
    ) -> Result<(), PlanError> {
        self.with_propagation(|p| {
            p.plan_mut()
                .get_event_mut(generator)
                .map(|e| e.on(handler))
                .ok_or_else(|| PlanError::Finalized(generator.to_string()))
        })
    }

    /// Defer a generator's emission to a task; see
    /// [`Propagation::achieve_with`].
    pub fn achieve_with(
        &mut self,
        generator: ObjectId,
        task: ObjectId,
    ) -> Result<(), PlanError> {
        self.with_propagation(|p| p.achieve_with(generator, task))
    }

    /// Re-arm an `and`/`or` combinator.
    pub fn reset_combinator(&mut self, generator: ObjectId) -> Result<(), PlanError> {
        self.with_propagation(|p| p.reset_combinator(generator))
    }

    // -- the cycle ----------------------------------------------------------

    /// Run one full execution cycle.
    pub fn step(&mut self) -> Result<CycleReport, PlanError> {
        let now = Utc::now();
        let started = Instant::now();
        let cycle = self.plan.cycle();
        if let Some(logger) = &self.logger {
            logger.record(LogRecord::CycleStart { cycle, time: now });
        }

        if self.quit_requested {
            self.plan.clear_missions();
        }

        let mut propagation = Propagation::new(&mut self.plan, now, self.config.signal_first);
        propagation.errors.append(&mut self.carryover_errors);

        // 1. external event gathering
        propagation.set_gathering(true);
        for event in self.external.drain() {
            let result = match event {
                ExternalEvent::Call { generator, context } => propagation.call(generator, context),
                ExternalEvent::Emit { generator, context } => propagation.emit(generator, context),
            };
            if let Err(error) = result {
                tracing::warn!("external event rejected: {error}");
            }
        }
        for handler in self.gather_handlers.clone() {
            if let Err(error) = handler(&mut propagation) {
                tracing::warn!("gather handler failed: {error}");
            }
        }
        let polls: Vec<(ObjectId, crate::internal::task::PollFn)> = propagation
            .plan()
            .tasks_in_state(TaskState::Running)
            .iter()
            .filter_map(|id| {
                propagation
                    .plan()
                    .get_task(*id)
                    .and_then(|t| t.poll().map(|p| (*id, p)))
            })
            .collect();
        for (task, poll) in polls {
            if let Err(error) = poll(&mut propagation, task) {
                propagation.inject_fault(
                    task,
                    PlanError::HandlerFailed(task.to_string(), error.to_string()),
                );
            }
        }
        let due: Vec<TimerEntry> = {
            let (due, later): (Vec<_>, Vec<_>) =
                self.timers.drain(..).partition(|t| t.at <= now);
            self.timers = later;
            due
        };
        for timer in due {
            match timer.kind {
                TimerKind::Deadline { generator } => {
                    let fired = propagation
                        .plan()
                        .get_event(generator)
                        .map(|e| e.emitted() || e.unreachable())
                        .unwrap_or(true);
                    if !fired {
                        let point = propagation
                            .plan()
                            .get_event(generator)
                            .and_then(|e| e.task());
                        let error = PlanError::TimedOut(format!(
                            "generator {generator} did not emit before its deadline"
                        ));
                        match point {
                            Some(task) => propagation.inject_fault(task, error),
                            None => propagation.errors.push(LocalizedError::new(
                                error,
                                crate::internal::exception::FailurePoint::Event(generator),
                            )),
                        }
                    }
                }
                TimerKind::DelayedEmit {
                    generator,
                    context,
                    sources,
                } => propagation.enqueue_due_emission(generator, context, sources),
            }
        }
        propagation.set_gathering(false);

        // 2. scheduling
        let mut pending = std::mem::take(&mut self.pending_calls);
        pending.extend(propagation.take_gathered_start_calls());
        let explicit = pending.len();
        for call in auto_start_candidates(propagation.plan()) {
            if !pending.iter().any(|p| p.generator == call.generator) {
                pending.push(call);
            }
        }
        let eligible = self.scheduler.eligible(propagation.plan(), &pending, now);
        for (index, call) in pending.into_iter().enumerate() {
            if eligible.contains(&call.generator) {
                propagation.enqueue_scheduled_call(call);
            } else if index < explicit {
                // explicit requests stay queued while their task is still
                // waiting to start; auto candidates are recomputed next cycle
                let waiting = propagation
                    .plan()
                    .get_event(call.generator)
                    .map(|event| match event.task() {
                        Some(task) => propagation
                            .plan()
                            .get_task(task)
                            .map(|t| t.state() == TaskState::Pending)
                            .unwrap_or(false),
                        None => !event.emitted() && !event.unreachable(),
                    })
                    .unwrap_or(false);
                if waiting {
                    self.pending_calls.push(call);
                }
            }
        }

        // 3. propagation
        propagation.process_queue();

        // 4. structure checks
        let structure_errors = check_dependencies(propagation.plan());
        propagation.errors.extend(structure_errors);

        // 5. error propagation
        let errors = propagation.take_errors();
        let outcomes =
            propagate_exceptions(&mut propagation, errors, &self.global_exception_handlers);
        propagation.process_queue();

        // a finished child has served its strong edges: drop them after the
        // handlers ran, so the checker reports once and the GC can finalize
        // the child
        for relation in Relation::TASK_RELATIONS {
            if !relation.is_strong() {
                continue;
            }
            let settled: Vec<(ObjectId, ObjectId)> = propagation
                .plan()
                .graph(relation)
                .edges()
                .filter(|(_, child, _)| {
                    propagation
                        .plan()
                        .get_task(*child)
                        .map(|t| t.state() == TaskState::Finished)
                        .unwrap_or(false)
                })
                .map(|(parent, child, _)| (parent, child))
                .collect();
            for (parent, child) in settled {
                propagation.plan_mut().remove_edge(relation, parent, child);
            }
        }

        // 6. garbage collection
        self.gc.collect(&mut propagation);

        let records = std::mem::take(&mut propagation.records);
        let delayed = std::mem::take(&mut propagation.delayed);
        let emissions = propagation.emission_count;
        let mut leftover = propagation.take_errors();
        drop(propagation);
        self.carryover_errors.append(&mut leftover);
        for entry in delayed {
            self.timers.push(TimerEntry {
                at: now + chrono::Duration::microseconds((entry.after * 1e6) as i64),
                kind: TimerKind::DelayedEmit {
                    generator: entry.generator,
                    context: entry.context,
                    sources: entry.sources,
                },
            });
        }

        let error_count = outcomes.len() as u32;
        for (exception, status) in &outcomes {
            match status {
                ExceptionStatus::Handled => {
                    tracing::debug!("exception handled by {:?}", exception.handled_by);
                }
                ExceptionStatus::Fatal | ExceptionStatus::PlanLevel => {
                    tracing::warn!("plan-level exception: {}", exception.origin.error);
                    if let Some(callback) = &self.exception_callback {
                        callback(exception);
                    }
                    if self.config.abort_on_exception {
                        self.fatal = true;
                    }
                }
            }
        }

        // 7. logging and cycle increment
        if let Some(logger) = &self.logger {
            for change in self.plan.take_changes() {
                log_change(logger, change, now);
            }
            for record in records {
                logger.record(record);
            }
            for (exception, status) in &outcomes {
                logger.record(LogRecord::Exception {
                    matcher_digest: Digest::of_bytes(
                        exception.origin.error.kind().as_str().as_bytes(),
                    ),
                    failure_point: exception.origin.point.id().as_u64(),
                    status: status.wire_id(),
                });
            }
        } else {
            self.plan.take_changes();
        }
        let duration = started.elapsed();
        if let Some(logger) = &self.logger {
            logger.record(LogRecord::CycleEnd {
                cycle,
                time: Utc::now(),
                stats: CycleStats {
                    duration_us: duration.as_micros() as u64,
                    emissions,
                    errors: error_count,
                },
            });
        }
        self.plan.bump_cycle();

        if duration.as_secs_f64() > self.config.cycle_period * self.config.overrun_factor {
            tracing::warn!(
                "overly long cycle {cycle}: {:.3}s against a {:.3}s period",
                duration.as_secs_f64(),
                self.config.cycle_period
            );
        }
        Ok(CycleReport {
            cycle,
            duration,
            emissions,
            errors: error_count,
        })
    }

    /// The cycle loop: step, sleep to the period, repeat. Returns the
    /// process exit code: 0 after a clean shutdown, 1 after a fatal
    /// unhandled exception.
    pub fn run(&mut self) -> Result<i32, PlanError> {
        let period = Duration::from_secs_f64(self.config.cycle_period.max(0.0));
        loop {
            let report = self.step()?;
            if self.fatal {
                if let Some(logger) = &self.logger {
                    logger.flush();
                }
                return Ok(1);
            }
            if self.quit_requested && self.plan.is_empty() {
                if let Some(logger) = &self.logger {
                    logger.flush();
                }
                return Ok(0);
            }
            if let Some(rest) = period.checked_sub(report.duration) {
                std::thread::sleep(rest);
            }
        }
    }
}

/// Pending useful tasks the scheduler may start on its own: fully
/// instantiated, not abstract, with a controllable start event.
fn auto_start_candidates(plan: &Plan) -> Vec<PendingCall> {
    let useful = gc::useful_tasks(plan);
    let mut candidates: Vec<(ObjectId, ObjectId)> = plan
        .tasks_in_state(TaskState::Pending)
        .iter()
        .copied()
        .filter(|id| useful.contains(id))
        .filter_map(|id| {
            let task = plan.get_task(id)?;
            if !task.executable(plan.executable()) {
                return None;
            }
            let start = task.start_event().ok()?;
            plan.get_event(start)
                .filter(|e| e.controllable() && !e.unreachable())
                .map(|_| (id, start))
        })
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .map(|(_, generator)| PendingCall {
            generator,
            context: None,
        })
        .collect()
}

fn log_change(logger: &EventLogger, change: PlanChange, now: DateTime<Utc>) {
    match change {
        PlanChange::TaskAdded {
            task,
            model_digest,
            arguments_digest,
            bound_events,
        } => {
            logger.record(LogRecord::TaskAdded {
                task: task.as_u64(),
                model_digest,
                arguments_digest,
                time: now,
            });
            for (symbol, generator) in bound_events {
                logger.record(LogRecord::TaskEventBound {
                    task: task.as_u64(),
                    symbol,
                    generator: generator.as_u64(),
                });
            }
        }
        PlanChange::TaskFinalized { task } => {
            logger.record(LogRecord::TaskFinalized {
                task: task.as_u64(),
                time: now,
            });
        }
        PlanChange::EdgeAdded {
            relation,
            parent,
            child,
            info_digest,
        } => {
            logger.record(LogRecord::EdgeAdded {
                relation: relation.wire_id(),
                parent: parent.as_u64(),
                child: child.as_u64(),
                info_digest,
            });
        }
        PlanChange::EdgeRemoved {
            relation,
            parent,
            child,
        } => {
            logger.record(LogRecord::EdgeRemoved {
                relation: relation.wire_id(),
                parent: parent.as_u64(),
                child: child.as_u64(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{rc::Rc, sync::Arc};

    use super::ExecutionEngine;
    use crate::{
        config::EngineConfig,
        internal::{
            event::generator::EventGenerator,
            plan::Plan,
            task::{Task, TaskModel, TaskState},
        },
    };

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(Plan::new(), EngineConfig::default())
    }

    /// Binding an engine makes the plan executable.
    #[test]
    fn test_engine_makes_plan_executable() {
        let engine = engine();
        assert!(engine.plan().executable());
    }

    /// A mission auto-starts through the scheduler and runs.
    #[test]
    fn test_mission_auto_start() {
        let mut engine = engine();
        let task = engine
            .plan_mut()
            .add_task(Task::new(Arc::new(TaskModel::new("GoForward"))))
            .unwrap();
        engine.plan_mut().add_mission(task).unwrap();
        engine.step().unwrap();
        assert_eq!(engine.plan().task(task).unwrap().state(), TaskState::Running);
    }

    /// Emissions pushed from the external queue land next cycle.
    #[test]
    fn test_external_queue_emission() {
        let mut engine = engine();
        let event = engine.plan_mut().add_free_event(EventGenerator::new());
        let queue = engine.external_queue();
        queue.push_emit(event, None);
        engine.step().unwrap();
        assert!(engine.plan().event(event).unwrap().emitted());
    }

    /// The quit sequence unmarks missions and drains the plan.
    #[test]
    fn test_quit_drains_plan() {
        let mut engine = engine();
        let task = engine
            .plan_mut()
            .add_task(Task::new(Arc::new(TaskModel::new("GoForward"))))
            .unwrap();
        engine.plan_mut().add_mission(task).unwrap();
        engine.step().unwrap();
        engine.quit();
        for _ in 0..5 {
            engine.step().unwrap();
        }
        assert!(engine.plan().is_empty());
    }

    /// achieve_with forwards the achieving task's success as the deferred
    /// generator's own emission.
    #[test]
    fn test_achieve_with_success() {
        let mut engine = engine();
        let target = engine.plan_mut().add_free_event(EventGenerator::new());
        let worker = engine
            .plan_mut()
            .add_task(Task::new(Arc::new(TaskModel::new("Worker"))))
            .unwrap();
        engine.plan_mut().add_mission(worker).unwrap();
        engine.achieve_with(target, worker).unwrap();
        assert!(engine.plan().event(target).unwrap().pending());

        engine.step().unwrap();
        let success = engine.plan().task(worker).unwrap().event("success").unwrap();
        engine.call(success, None).unwrap();
        assert!(engine.plan().event(target).unwrap().emitted());
        assert!(!engine.plan().event(target).unwrap().pending());
    }

    /// achieve_with makes the generator unreachable when the task ends
    /// without success.
    #[test]
    fn test_achieve_with_failure() {
        let mut engine = engine();
        let target = engine.plan_mut().add_free_event(EventGenerator::new());
        let worker = engine
            .plan_mut()
            .add_task(Task::new(Arc::new(TaskModel::new("Worker"))))
            .unwrap();
        engine.plan_mut().add_mission(worker).unwrap();
        engine.achieve_with(target, worker).unwrap();

        engine.step().unwrap();
        let aborted = engine.plan().task(worker).unwrap().event("aborted").unwrap();
        engine.call(aborted, None).unwrap();
        assert!(engine.plan().event(target).unwrap().unreachable());
        assert!(!engine.plan().event(target).unwrap().emitted());
    }

    /// An `or` gate latches on its first input until reset.
    #[test]
    fn test_or_gate_latches() {
        let mut engine = engine();
        let a = engine.plan_mut().add_free_event(EventGenerator::new());
        let b = engine.plan_mut().add_free_event(EventGenerator::new());
        let either = crate::internal::event::or(engine.plan_mut(), &[a, b]).unwrap();
        engine.emit(a, None).unwrap();
        engine.emit(b, None).unwrap();
        assert_eq!(engine.plan().event(either).unwrap().history().len(), 1);
        engine.reset_combinator(either).unwrap();
        engine.emit(a, None).unwrap();
        assert_eq!(engine.plan().event(either).unwrap().history().len(), 2);
    }

    /// A filter generator re-emits with a mapped context.
    #[test]
    fn test_filter_maps_context() {
        let mut engine = engine();
        let source = engine.plan_mut().add_free_event(EventGenerator::new());
        let doubled = crate::internal::event::filter(
            engine.plan_mut(),
            source,
            Rc::new(|context| {
                context
                    .and_then(|v| v.as_f64())
                    .map(|v| serde_json::json!(v * 2.0))
            }),
        )
        .unwrap();
        engine.emit(source, Some(serde_json::json!(21.0))).unwrap();
        let emission = engine
            .plan()
            .event(doubled)
            .unwrap()
            .last_emission()
            .cloned()
            .unwrap();
        assert_eq!(emission.context, Some(serde_json::json!(42.0)));
        assert_eq!(emission.sources.len(), 1);
    }

    /// An expired deadline produces a TimedOut plan-level exception.
    #[test]
    fn test_deadline_times_out() {
        let mut engine = engine();
        let event = engine.plan_mut().add_free_event(EventGenerator::new());
        engine.deadline(event, 0.0).unwrap();
        let seen = std::rc::Rc::new(std::cell::Cell::new(false));
        let callback_seen = seen.clone();
        engine.on_plan_exception(Rc::new(move |exception| {
            if matches!(
                exception.origin.error.kind(),
                crate::errors::ErrorKind::TimedOut
            ) {
                callback_seen.set(true);
            }
        }));
        std::thread::sleep(std::time::Duration::from_millis(5));
        engine.step().unwrap();
        assert!(seen.get());
    }

    /// An execution agent's stop forces aborted on the tasks it executes.
    #[test]
    fn test_execution_agent_stop_aborts() {
        let mut engine = engine();
        let task = engine
            .plan_mut()
            .add_task(Task::new(Arc::new(TaskModel::new("Driver"))))
            .unwrap();
        let agent = engine
            .plan_mut()
            .add_task(Task::new(Arc::new(TaskModel::new("Process"))))
            .unwrap();
        engine.plan_mut().add_mission(task).unwrap();
        engine
            .plan_mut()
            .add_edge(
                crate::internal::relation::Relation::ExecutionAgent,
                task,
                agent,
                crate::internal::relation::EdgeInfo::None,
            )
            .unwrap();
        engine.step().unwrap();
        assert_eq!(engine.plan().task(task).unwrap().state(), TaskState::Running);
        assert_eq!(engine.plan().task(agent).unwrap().state(), TaskState::Running);

        let agent_stop = engine.plan().task(agent).unwrap().stop_event().unwrap();
        engine.call(agent_stop, None).unwrap();
        let aborted = engine.plan().task(task).unwrap().event("aborted").unwrap();
        assert!(engine.plan().event(aborted).unwrap().emitted());
        assert_eq!(
            engine.plan().task(task).unwrap().state(),
            TaskState::Finished
        );
    }
}
