//! Task models: the type identity of a task. A model fixes the event symbol
//! set (with controllability and terminal flags), the declared arguments,
//! and the model-level wiring (forwardings, signals, handlers) merged into
//! every new instance.
//!
//! # Terminal closure
//!
//! `stop` is always terminal, and every terminal event forwards to `stop`,
//! transitively. `with_event` maintains this automatically for terminal
//! events; `validate` re-checks it, since user-declared forwardings may
//! reroute the paths.

use std::rc::Rc;

use serde_json::Value;

use crate::{
    errors::PlanError,
    ident::{Digest, ObjectId},
    internal::{
        engine::propagation::Propagation,
        event::generator::EmissionHandler,
        exception::{ExceptionHandler, ExceptionMatcher},
    },
};

/// Poll handler of a task: invoked once per cycle while the task is running.
pub type PollFn = Rc<dyn Fn(&mut Propagation<'_>, ObjectId) -> Result<(), PlanError>>;

/// One event symbol of a task model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventModel {
    pub symbol: String,
    /// Controllable events get a command when the task is added to a plan;
    /// the default command emits the event itself.
    pub controllable: bool,
    pub terminal: bool,
}

/// One declared argument of a task model.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgumentModel {
    pub name: String,
    pub required: bool,
    pub default: Option<Value>,
}

/// Type identity of a task: symbols, arguments, and model-level wiring.
#[derive(Clone)]
pub struct TaskModel {
    name: String,
    events: Vec<EventModel>,
    forwardings: Vec<(String, String)>,
    signals: Vec<(String, String)>,
    arguments: Vec<ArgumentModel>,
    handlers: Vec<(String, EmissionHandler)>,
    exception_handlers: Vec<(ExceptionMatcher, ExceptionHandler)>,
    poll: Option<PollFn>,
    abstract_model: bool,
}

impl std::fmt::Debug for TaskModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskModel")
            .field("name", &self.name)
            .field("events", &self.events)
            .field("arguments", &self.arguments)
            .field("abstract", &self.abstract_model)
            .finish()
    }
}

impl TaskModel {
    pub const START: &'static str = "start";
    pub const STOP: &'static str = "stop";

    /// A model with the standard event set: `start`, `success`, `failed`,
    /// `aborted` (terminal, forwarded to `stop`), `updated`, and `stop`.
    pub fn new(name: &str) -> Self {
        let mut model = Self {
            name: name.to_string(),
            events: Vec::new(),
            forwardings: Vec::new(),
            signals: Vec::new(),
            arguments: Vec::new(),
            handlers: Vec::new(),
            exception_handlers: Vec::new(),
            poll: None,
            abstract_model: false,
        };
        model.events.push(EventModel {
            symbol: Self::START.to_string(),
            controllable: true,
            terminal: false,
        });
        model.events.push(EventModel {
            symbol: Self::STOP.to_string(),
            controllable: true,
            terminal: true,
        });
        model = model
            .with_event("success", true, true)
            .with_event("failed", true, true)
            .with_event("aborted", true, true);
        model.events.push(EventModel {
            symbol: "updated".to_string(),
            controllable: false,
            terminal: false,
        });
        model
    }

    /// Declare an additional event symbol. Terminal events are forwarded to
    /// `stop` so the terminal closure holds by construction.
    pub fn with_event(mut self, symbol: &str, controllable: bool, terminal: bool) -> Self {
        self.events.push(EventModel {
            symbol: symbol.to_string(),
            controllable,
            terminal,
        });
        if terminal && symbol != Self::STOP {
            self.forwardings
                .push((symbol.to_string(), Self::STOP.to_string()));
        }
        self
    }

    /// Declare an argument; instances must set it (or rely on the default)
    /// before they become executable.
    pub fn with_argument(mut self, name: &str, required: bool, default: Option<Value>) -> Self {
        self.arguments.push(ArgumentModel {
            name: name.to_string(),
            required,
            default,
        });
        self
    }

    /// Model-level forwarding between two of the model's events.
    pub fn with_forwarding(mut self, from: &str, to: &str) -> Self {
        self.forwardings.push((from.to_string(), to.to_string()));
        self
    }

    /// Model-level signal between two of the model's events.
    pub fn with_signal(mut self, from: &str, to: &str) -> Self {
        self.signals.push((from.to_string(), to.to_string()));
        self
    }

    /// Model-level emission handler, merged into every instance.
    pub fn on(mut self, symbol: &str, handler: EmissionHandler) -> Self {
        self.handlers.push((symbol.to_string(), handler));
        self
    }

    /// Model-level exception handler.
    pub fn on_exception(mut self, matcher: ExceptionMatcher, handler: ExceptionHandler) -> Self {
        self.exception_handlers.push((matcher, handler));
        self
    }

    /// Poll handler invoked once per cycle while instances are running.
    pub fn with_poll(mut self, poll: PollFn) -> Self {
        self.poll = Some(poll);
        self
    }

    /// Abstract models may appear in plans but are not executable.
    pub fn make_abstract(mut self) -> Self {
        self.abstract_model = true;
        self
    }

    /// Check the model invariants: exactly one `start`, exactly one `stop`
    /// which is terminal, and every terminal symbol transitively forwarded
    /// to `stop`.
    pub fn validate(&self) -> Result<(), PlanError> {
        let starts = self.events.iter().filter(|e| e.symbol == Self::START).count();
        if starts != 1 {
            return Err(PlanError::InvalidModel(
                self.name.clone(),
                format!("expected exactly one start event, found {starts}"),
            ));
        }
        let stops: Vec<&EventModel> = self
            .events
            .iter()
            .filter(|e| e.symbol == Self::STOP)
            .collect();
        if stops.len() != 1 {
            return Err(PlanError::InvalidModel(
                self.name.clone(),
                format!("expected exactly one stop event, found {}", stops.len()),
            ));
        }
        if !stops[0].terminal {
            return Err(PlanError::InvalidModel(
                self.name.clone(),
                "stop must be terminal".to_string(),
            ));
        }
        for event in &self.events {
            if event.terminal && event.symbol != Self::STOP && !self.forwards_to_stop(&event.symbol)
            {
                return Err(PlanError::InvalidModel(
                    self.name.clone(),
                    format!("terminal event `{}` does not reach stop", event.symbol),
                ));
            }
        }
        Ok(())
    }

    fn forwards_to_stop(&self, symbol: &str) -> bool {
        let mut stack = vec![symbol.to_string()];
        let mut seen = vec![];
        while let Some(current) = stack.pop() {
            if current == Self::STOP {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current.clone());
            for (from, to) in &self.forwardings {
                if *from == current {
                    stack.push(to.clone());
                }
            }
        }
        false
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &[EventModel] {
        &self.events
    }

    pub fn event_model(&self, symbol: &str) -> Option<&EventModel> {
        self.events.iter().find(|e| e.symbol == symbol)
    }

    pub fn has_event(&self, symbol: &str) -> bool {
        self.event_model(symbol).is_some()
    }

    pub fn terminal_symbols(&self) -> impl Iterator<Item = &str> {
        self.events
            .iter()
            .filter(|e| e.terminal)
            .map(|e| e.symbol.as_str())
    }

    pub fn arguments(&self) -> &[ArgumentModel] {
        &self.arguments
    }

    pub fn argument_model(&self, name: &str) -> Option<&ArgumentModel> {
        self.arguments.iter().find(|a| a.name == name)
    }

    pub fn forwardings(&self) -> &[(String, String)] {
        &self.forwardings
    }

    pub fn signals(&self) -> &[(String, String)] {
        &self.signals
    }

    pub(crate) fn handlers_for(&self, symbol: &str) -> Vec<EmissionHandler> {
        self.handlers
            .iter()
            .filter(|(s, _)| s == symbol)
            .map(|(_, h)| h.clone())
            .collect()
    }

    pub(crate) fn exception_handlers(&self) -> &[(ExceptionMatcher, ExceptionHandler)] {
        &self.exception_handlers
    }

    pub(crate) fn poll(&self) -> Option<PollFn> {
        self.poll.clone()
    }

    pub fn is_abstract(&self) -> bool {
        self.abstract_model
    }

    /// Content digest of the model identity, written to task-added log
    /// records.
    pub fn digest(&self) -> Digest {
        let events: Vec<Value> = self
            .events
            .iter()
            .map(|e| {
                serde_json::json!({
                    "symbol": e.symbol,
                    "controllable": e.controllable,
                    "terminal": e.terminal,
                })
            })
            .collect();
        let arguments: Vec<&str> = self.arguments.iter().map(|a| a.name.as_str()).collect();
        Digest::of_value(&serde_json::json!({
            "name": self.name,
            "events": events,
            "arguments": arguments,
            "abstract": self.abstract_model,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::TaskModel;

    /// The standard model passes validation and has the default symbols.
    #[test]
    fn test_default_model() {
        let model = TaskModel::new("GoForward");
        model.validate().unwrap();
        assert!(model.has_event("start"));
        assert!(model.has_event("stop"));
        assert!(model.has_event("success"));
        let terminals: Vec<&str> = model.terminal_symbols().collect();
        assert!(terminals.contains(&"stop"));
        assert!(terminals.contains(&"aborted"));
    }

    /// Custom terminal events are forwarded to stop automatically.
    #[test]
    fn test_terminal_closure_by_construction() {
        let model = TaskModel::new("Grasp").with_event("dropped", false, true);
        model.validate().unwrap();
        assert!(
            model
                .forwardings()
                .contains(&("dropped".to_string(), "stop".to_string()))
        );
    }

    /// Model digests distinguish event sets.
    #[test]
    fn test_model_digest() {
        let a = TaskModel::new("MoveTo");
        let b = TaskModel::new("MoveTo").with_event("blocked", false, true);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), TaskModel::new("MoveTo").digest());
    }
}
