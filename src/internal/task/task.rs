//! Task instances and their derived lifecycle state.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──start.call──▶ Starting ──start.emit──▶ Running
//!                                                     │
//!                                any terminal .call ──▶ Finishing
//!                                                     │
//!                                        stop.emit ──▶ Finished
//! ```
//!
//! The state is a function of the task's event history; the kernel keeps a
//! cached copy in sync so the plan's state index stays O(1).

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use serde_json::Value;

use super::{arguments::Arguments, model::{PollFn, TaskModel}};
use crate::{
    errors::PlanError,
    ident::ObjectId,
    internal::{
        exception::{ExceptionHandler, ExceptionMatcher},
        plan::Plan,
    },
};

/// Derived lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskState {
    /// In a plan, start not called yet.
    Pending,
    /// Start command accepted, start not emitted yet.
    Starting,
    /// Start emitted, no terminal event engaged.
    Running,
    /// A terminal event's command was called; stop not emitted yet.
    Finishing,
    /// Stop emitted. Terminal state, never regresses.
    Finished,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Starting,
        TaskState::Running,
        TaskState::Finishing,
        TaskState::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Finishing => "finishing",
            TaskState::Finished => "finished",
        }
    }

    /// Position in [`TaskState::ALL`]; used by the plan's state index.
    pub fn index(&self) -> usize {
        match self {
            TaskState::Pending => 0,
            TaskState::Starting => 1,
            TaskState::Running => 2,
            TaskState::Finishing => 3,
            TaskState::Finished => 4,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = PlanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TaskState::Pending),
            "starting" => Ok(TaskState::Starting),
            "running" => Ok(TaskState::Running),
            "finishing" => Ok(TaskState::Finishing),
            "finished" => Ok(TaskState::Finished),
            _ => Err(PlanError::InvalidArgument(format!(
                "unknown task state: {value}"
            ))),
        }
    }
}

/// A long-running activity: a bundle of named event generators plus
/// arguments, owned by at most one plan.
#[derive(Clone)]
pub struct Task {
    id: ObjectId,
    model: Arc<TaskModel>,
    arguments: Arguments,
    /// Event symbol to generator id; filled when the task is added to a plan.
    bound_events: BTreeMap<String, ObjectId>,
    state: TaskState,
    abstract_task: bool,
    /// Terminal event called on fault reaction; defaults to `stop`.
    failure_reaction: String,
    poll: Option<PollFn>,
    exception_handlers: Vec<(ExceptionMatcher, ExceptionHandler)>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("model", &self.model.name())
            .field("state", &self.state)
            .field("abstract", &self.abstract_task)
            .finish()
    }
}

impl Task {
    /// Instantiate a task from its model. Model defaults are merged into the
    /// argument set; event generators are bound later, when the task enters
    /// a plan.
    pub fn new(model: Arc<TaskModel>) -> Self {
        let mut arguments = Arguments::new();
        arguments.merge_defaults(&model);
        let abstract_task = model.is_abstract();
        let poll = model.poll();
        Self {
            id: ObjectId::next(),
            model,
            arguments,
            bound_events: BTreeMap::new(),
            state: TaskState::Pending,
            abstract_task,
            failure_reaction: TaskModel::STOP.to_string(),
            poll,
            exception_handlers: Vec::new(),
        }
    }

    /// Instantiate with a set of concrete arguments.
    pub fn with_arguments<'a>(
        model: Arc<TaskModel>,
        arguments: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Self {
        let mut task = Self::new(model);
        for (name, value) in arguments {
            task.arguments.set(name, value);
        }
        task
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn model(&self) -> &Arc<TaskModel> {
        &self.model
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub fn is_abstract(&self) -> bool {
        self.abstract_task
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn arguments_mut(&mut self) -> &mut Arguments {
        &mut self.arguments
    }

    /// The generator bound to an event symbol. Fails before the task is
    /// added to a plan, or for symbols the model does not declare.
    pub fn event(&self, symbol: &str) -> Result<ObjectId, PlanError> {
        if !self.model.has_event(symbol) {
            return Err(PlanError::InvalidArgument(format!(
                "model {} has no `{symbol}` event",
                self.model.name()
            )));
        }
        self.bound_events.get(symbol).copied().ok_or_else(|| {
            PlanError::NotExecutable(format!(
                "task {} is not part of a plan; its events are not bound",
                self.id
            ))
        })
    }

    pub fn start_event(&self) -> Result<ObjectId, PlanError> {
        self.event(TaskModel::START)
    }

    pub fn stop_event(&self) -> Result<ObjectId, PlanError> {
        self.event(TaskModel::STOP)
    }

    /// Reverse lookup: the symbol a generator id is bound to.
    pub fn symbol_of(&self, generator: ObjectId) -> Option<&str> {
        self.bound_events
            .iter()
            .find(|(_, id)| **id == generator)
            .map(|(symbol, _)| symbol.as_str())
    }

    pub fn bound_events(&self) -> impl Iterator<Item = (&str, ObjectId)> {
        self.bound_events.iter().map(|(s, id)| (s.as_str(), *id))
    }

    pub(crate) fn bind_event(&mut self, symbol: &str, generator: ObjectId) {
        self.bound_events.insert(symbol.to_string(), generator);
    }

    pub fn fully_instantiated(&self) -> bool {
        self.arguments.fully_instantiated(&self.model)
    }

    /// A task is executable iff it sits in an executable plan, is not
    /// abstract, and is fully instantiated.
    pub fn executable(&self, plan_executable: bool) -> bool {
        plan_executable && !self.abstract_task && self.fully_instantiated()
    }

    /// Terminal event called when the error propagation marks this task for
    /// fault reaction.
    pub fn failure_reaction(&self) -> &str {
        &self.failure_reaction
    }

    pub fn set_failure_reaction(&mut self, symbol: &str) {
        self.failure_reaction = symbol.to_string();
    }

    pub(crate) fn poll(&self) -> Option<PollFn> {
        self.poll.clone()
    }

    pub fn set_poll(&mut self, poll: PollFn) {
        self.poll = Some(poll);
    }

    /// Register an instance-level exception handler, consulted before the
    /// model-level ones during error propagation.
    pub fn on_exception(&mut self, matcher: ExceptionMatcher, handler: ExceptionHandler) {
        self.exception_handlers.push((matcher, handler));
    }

    /// Instance handlers first, then the model's.
    pub(crate) fn exception_handlers(&self) -> Vec<(ExceptionMatcher, ExceptionHandler)> {
        self.exception_handlers
            .iter()
            .cloned()
            .chain(self.model.exception_handlers().iter().cloned())
            .collect()
    }

    /// A running task whose `stop` is controllable can be interrupted.
    pub fn interruptible(&self) -> bool {
        matches!(self.state, TaskState::Running)
            && self
                .model
                .event_model(TaskModel::STOP)
                .map(|e| e.controllable)
                .unwrap_or(false)
    }

    /// Symbols of the terminal events that have emitted, in model order.
    pub fn terminal_emissions(&self, plan: &Plan) -> Vec<String> {
        self.model
            .events()
            .iter()
            .filter(|e| e.terminal && e.symbol != TaskModel::STOP)
            .filter_map(|e| {
                let id = self.bound_events.get(&e.symbol)?;
                let generator = plan.get_event(*id)?;
                generator.emitted().then(|| e.symbol.clone())
            })
            .collect()
    }

    /// Check that emitting `symbol` is compatible with the current state:
    /// `start` requires a pending or starting task, terminal symbols require
    /// running or finishing, everything else requires running.
    pub(crate) fn emission_allowed(&self, symbol: &str) -> Result<(), PlanError> {
        let event = self.model.event_model(symbol).ok_or_else(|| {
            PlanError::InvalidArgument(format!(
                "model {} has no `{symbol}` event",
                self.model.name()
            ))
        })?;
        let allowed = if symbol == TaskModel::START {
            matches!(self.state, TaskState::Pending | TaskState::Starting)
        } else if event.terminal {
            matches!(
                self.state,
                TaskState::Running | TaskState::Finishing | TaskState::Starting
            )
        } else {
            matches!(self.state, TaskState::Running)
        };
        if allowed {
            Ok(())
        } else {
            Err(PlanError::EmissionFailed(format!(
                "cannot emit `{symbol}` while task {} is {}",
                self.id, self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{Task, TaskState};
    use crate::internal::task::model::TaskModel;

    /// A fresh task is pending with unbound events.
    #[test]
    fn test_new_task() {
        let model = Arc::new(TaskModel::new("GoForward").with_argument("speed", true, None));
        let task = Task::new(model);
        assert_eq!(task.state(), TaskState::Pending);
        assert!(task.start_event().is_err());
        assert!(!task.fully_instantiated());
    }

    /// with_arguments sets concrete values and merges defaults.
    #[test]
    fn test_with_arguments() {
        let model = Arc::new(
            TaskModel::new("GoForward")
                .with_argument("speed", true, None)
                .with_argument("frame", true, Some(json!("odom"))),
        );
        let task = Task::with_arguments(model, [("speed", json!(0.1))]);
        assert!(task.fully_instantiated());
        assert_eq!(task.arguments().get("frame"), Some(&json!("odom")));
    }

    /// Emission compatibility follows the lifecycle.
    #[test]
    fn test_emission_allowed() {
        let model = Arc::new(TaskModel::new("GoForward"));
        let mut task = Task::new(model);
        task.emission_allowed("start").unwrap();
        assert!(task.emission_allowed("success").is_err());
        task.set_state(TaskState::Running);
        assert!(task.emission_allowed("start").is_err());
        task.emission_allowed("success").unwrap();
        task.emission_allowed("updated").unwrap();
        task.set_state(TaskState::Finishing);
        assert!(task.emission_allowed("updated").is_err());
        task.emission_allowed("stop").unwrap();
    }

    /// State strings round-trip.
    #[test]
    fn test_state_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
    }
}
